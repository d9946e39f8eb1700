//! Cloneable command front for the engine task.

use std::fmt;

use perch_link_protocol::LinkEvent;
use tokio::sync::{mpsc, oneshot};

use crate::session::CursorKind;
use crate::session::events::{EngineCommand, EngineError, SessionSummary};

/// Sends commands into the engine. Cheap to clone; every holder talks to
/// the same session registry.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        EngineHandle { tx }
    }

    /// Forward one decoded link event.
    pub async fn link_event(&self, event: LinkEvent) -> Result<(), EngineError> {
        self.tx
            .send(EngineCommand::Link(event))
            .await
            .map_err(|_| EngineError::EngineShutdown)
    }

    /// Announce a poll timer tick for one pipeline.
    pub async fn poll_tick(&self, kind: CursorKind) -> Result<(), EngineError> {
        self.tx
            .send(EngineCommand::PollTick { kind })
            .await
            .map_err(|_| EngineError::EngineShutdown)
    }

    /// Snapshot all sessions.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Sessions { reply })
            .await
            .map_err(|_| EngineError::EngineShutdown)?;
        rx.await.map_err(|_| EngineError::EngineShutdown)
    }

    /// Disconnect every session and stop the engine. Resolves once the
    /// registry is drained.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Shutdown { reply })
            .await
            .map_err(|_| EngineError::EngineShutdown)?;
        rx.await.map_err(|_| EngineError::EngineShutdown)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}
