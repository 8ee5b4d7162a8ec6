//! REST endpoint handlers for the relay server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/api/status` | Run state, limits, and connected viewers |
//! | `GET` | `/health` | Liveness probe |

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use relay_core::controller::RunStatus;
use relay_types::SessionId;

use crate::state::AppState;

/// Response body for `GET /api/status`.
#[derive(Debug, serde::Serialize)]
pub struct StatusResponse {
    /// Run controller status.
    #[serde(flatten)]
    pub run: RunStatus,
    /// Number of registered viewer sessions.
    pub sessions: usize,
    /// Registered viewers, oldest connection first.
    pub viewers: Vec<ViewerInfo>,
    /// ISO 8601 timestamp of server start.
    pub server_started_at: String,
}

/// One connected viewer as reported by `GET /api/status`.
#[derive(Debug, serde::Serialize)]
pub struct ViewerInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Peer address.
    pub remote: String,
    /// ISO 8601 timestamp of when the connection was accepted.
    pub connected_at: String,
}

// ---------------------------------------------------------------------------
// GET /api/status
// ---------------------------------------------------------------------------

/// Report the run state and the connected viewers.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let run = state.controller.status().await;

    let mut sessions = state.registry.snapshot().await;
    sessions.sort_by_key(|s| (s.connected_at(), s.id()));
    let viewers: Vec<ViewerInfo> = sessions
        .iter()
        .map(|session| ViewerInfo {
            id: session.id(),
            remote: session.remote().to_string(),
            connected_at: session.connected_at().to_rfc3339(),
        })
        .collect();

    Json(StatusResponse {
        run,
        sessions: viewers.len(),
        viewers,
        server_started_at: state.started_at.to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
