//! Transport link to the messaging-network process.
//!
//! Newline-delimited JSON over one TCP connection: perch dials out, the
//! read half decodes [`LinkEvent`] lines into the engine, the write half
//! drains the engine's outbound [`LinkCommand`] channel. Malformed inbound
//! lines are logged and counted, never forwarded. A lost connection is
//! redialed with exponential backoff.

use std::io;
use std::time::Duration;

use perch_link_protocol::{LinkCommand, LinkEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use crate::session::EngineHandle;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Why a connection attempt or an established connection ended.
enum LinkExit {
    /// Shutdown signal observed.
    Shutdown,
    /// The engine is gone; the link has nothing left to serve.
    EngineGone,
    /// Socket error or EOF. `had_traffic` is true when at least one event
    /// made it through on this connection.
    ConnectionLost { error: io::Error, had_traffic: bool },
}

/// Owns the socket and the reconnect loop.
pub struct TransportLink {
    addr: String,
    engine: EngineHandle,
    outbound: mpsc::Receiver<LinkCommand>,
    shutdown: watch::Receiver<bool>,
    parse_failures: u64,
}

impl TransportLink {
    pub fn new(
        addr: String,
        engine: EngineHandle,
        outbound: mpsc::Receiver<LinkCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        TransportLink {
            addr,
            engine,
            outbound,
            shutdown,
            parse_failures: 0,
        }
    }

    /// Dial, serve, redial until shutdown.
    pub async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!(addr = %self.addr, "Transport link connected");
                    match self.drive(stream).await {
                        LinkExit::Shutdown => break,
                        LinkExit::EngineGone => {
                            debug!("Engine stopped, closing transport link");
                            break;
                        }
                        LinkExit::ConnectionLost { error, had_traffic } => {
                            warn!(%error, "Transport link lost");
                            backoff = next_backoff(backoff, had_traffic);
                        }
                    }
                }
                Err(error) => {
                    warn!(addr = %self.addr, %error, "Transport connect failed");
                    backoff = next_backoff(backoff, false);
                }
            }

            debug!(seconds = backoff.as_secs(), "Redialing transport after backoff");
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = time::sleep(backoff) => {}
            }
        }
        info!("Transport link stopped");
    }

    /// Serve one established connection until it drops or we shut down.
    async fn drive(&mut self, stream: TcpStream) -> LinkExit {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut had_traffic = false;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return LinkExit::Shutdown;
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if self.forward_line(&line).await.is_err() {
                            return LinkExit::EngineGone;
                        }
                        had_traffic = true;
                    }
                    Ok(None) => {
                        return LinkExit::ConnectionLost {
                            error: io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "transport closed the connection",
                            ),
                            had_traffic,
                        };
                    }
                    Err(error) => return LinkExit::ConnectionLost { error, had_traffic },
                },
                command = self.outbound.recv() => match command {
                    Some(command) => {
                        match serde_json::to_string(&command) {
                            Ok(mut line) => {
                                line.push('\n');
                                if let Err(error) = write_half.write_all(line.as_bytes()).await {
                                    return LinkExit::ConnectionLost { error, had_traffic };
                                }
                                had_traffic = true;
                            }
                            Err(error) => {
                                warn!(%error, "Failed to encode outbound command, dropping");
                            }
                        }
                    }
                    // The engine dropped its sender: shutting down.
                    None => return LinkExit::EngineGone,
                },
            }
        }
    }

    /// Decode one inbound line and hand it to the engine.
    ///
    /// Err means the engine is gone; parse failures are swallowed here.
    async fn forward_line(&mut self, line: &str) -> Result<(), ()> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<LinkEvent>(trimmed) {
            Ok(event) => self.engine.link_event(event).await.map_err(|_| ()),
            Err(error) => {
                self.parse_failures += 1;
                warn!(
                    %error,
                    total = self.parse_failures,
                    "Rejecting malformed link event"
                );
                Ok(())
            }
        }
    }
}

/// Backoff policy: a connection that carried traffic resets the delay,
/// anything else doubles it up to the cap.
fn next_backoff(current: Duration, had_traffic: bool) -> Duration {
    if had_traffic {
        INITIAL_BACKOFF
    } else {
        (current * 2).min(MAX_BACKOFF)
    }
}
