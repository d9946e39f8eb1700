//! Gateway daemon command implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use perch::config::{self, Config};
use perch::link::TransportLink;
use perch::pool::WorkerPool;
use perch::remote::{HttpRemoteApi, RemoteApi};
use perch::server::{self, AppState};
use perch::session::{Engine, EngineConfig, OUTBOUND_CAPACITY, Poller};
use perch::store::{FileUserStore, UserStore};

pub async fn run(config_path: &str) -> Result<()> {
    let config = Config::load(config_path).await?;

    if config.remote.consumer_key.is_empty() || config.remote.consumer_secret.is_empty() {
        warn!("Consumer key or secret is empty; sign-in will fail until both are configured");
    }

    // User records live next to the config file unless an absolute path is given
    let storage_path = config::resolve_path(Path::new(config_path), &config.storage.path);
    let store: Arc<dyn UserStore> = Arc::new(FileUserStore::new(&storage_path));
    info!(path = %storage_path.display(), "User store ready");

    let api: Arc<dyn RemoteApi> =
        Arc::new(HttpRemoteApi::new(&config.remote).context("building remote API client")?);
    let pool = WorkerPool::new(config.polling.worker_slots);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (engine, engine_task) = Engine::spawn(
        EngineConfig {
            store,
            api,
            pool,
            outbound: outbound_tx,
            default_mode: config.defaults.mode,
            chatroom_name: config.defaults.chatroom_name.clone(),
        },
        shutdown_rx.clone(),
    );

    let poller = Poller::spawn(
        engine.clone(),
        config.polling.status_interval(),
        config.polling.dm_interval(),
        shutdown_rx.clone(),
    );
    info!(
        status_secs = config.polling.status_interval_secs,
        direct_message_secs = config.polling.direct_message_interval_secs,
        "Polling started"
    );

    let status_server = if config.status_server.enabled {
        let addr = config.status_server.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding status server to {addr}"))?;
        let app = server::build_app(AppState {
            engine: engine.clone(),
        });
        let mut server_shutdown = shutdown_rx.clone();
        info!(addr = %addr, "Status server listening");
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Status server stopped unexpectedly");
            }
        }))
    } else {
        None
    };

    let link_addr = config.link.addr();
    let link = TransportLink::new(link_addr.clone(), engine.clone(), outbound_rx, shutdown_rx);
    let link_task = tokio::spawn(link.run());
    info!(addr = %link_addr, "Transport link started");

    shutdown_signal().await;

    // Disconnect every session first so the farewell commands enter the
    // outbound channel while the link is still draining it. Once the engine
    // task ends the channel closes and the link exits on its own.
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Engine was already gone at shutdown");
    }
    let _ = engine_task.await;
    let _ = shutdown_tx.send(true);
    poller.join().await;
    let _ = link_task.await;
    if let Some(task) = status_server {
        let _ = task.await;
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
