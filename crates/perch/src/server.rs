//! Status server: a small read-only HTTP surface for health checks and
//! session inspection. Gateway traffic never passes through here.

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::session::{EngineHandle, SessionSummary};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECTIONS: usize = 32;

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/sessions", get(sessions))
        .with_state(state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(ConcurrencyLimitLayer::new(MAX_CONNECTIONS))
}

// ============================================================================
// Handlers
// ============================================================================

async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
struct ReadyzResponse {
    status: String,
    sessions: usize,
}

/// Ready when the engine task answers.
async fn readyz(State(state): State<AppState>) -> Result<Json<ReadyzResponse>, StatusCode> {
    match state.engine.sessions().await {
        Ok(summaries) => Ok(Json(ReadyzResponse {
            status: "ok".to_string(),
            sessions: summaries.len(),
        })),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

#[derive(Serialize)]
struct VersionResponse {
    name: &'static str,
    version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, StatusCode> {
    state
        .engine
        .sessions()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}
