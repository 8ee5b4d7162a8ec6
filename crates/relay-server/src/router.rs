//! Axum router construction for the relay server.
//!
//! Assembles the viewer `WebSocket` routes and the REST endpoints into a
//! single [`Router`] with CORS and request tracing.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router for the relay.
///
/// The router includes:
/// - `GET /` -- viewer `WebSocket`
/// - `GET /ws` -- viewer `WebSocket` (alias)
/// - `GET /api/status` -- run status
/// - `GET /health` -- liveness probe
///
/// The `WebSocket` routes need the peer address, so serve the router with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Viewer WebSocket
        .route("/", get(ws::ws_viewer))
        .route("/ws", get(ws::ws_viewer))
        // REST API
        .route("/api/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
