//! Relay server startup helper for embedding in the engine binary.
//!
//! Provides [`spawn_relay`], which binds the endpoint eagerly and then
//! launches the server on a background Tokio task.
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_server::startup::spawn_relay;
//!
//! let handle = spawn_relay(&config.server, state, shutdown_signal()).await?;
//! tracing::info!(addr = %handle.local_addr, "listening");
//! handle.task.await??;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use relay_core::config::ListenConfig;
use tokio::task::JoinHandle;

use crate::server::{ServerError, bind};
use crate::state::AppState;

/// Errors that can occur when spawning the relay server.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The server failed to bind or start.
    #[error("server start error: {0}")]
    Server(#[from] ServerError),
}

/// A running relay server.
#[derive(Debug)]
pub struct RelayHandle {
    /// Address the server is listening on.
    pub local_addr: SocketAddr,
    /// The background server task. Resolves after graceful shutdown.
    pub task: JoinHandle<Result<(), ServerError>>,
}

/// Bind the configured endpoint and serve it on a background task.
///
/// The bind happens before this function returns, so an endpoint that is
/// already taken is reported to the caller rather than logged from the
/// background task.
///
/// # Errors
///
/// Returns [`StartupError::Server`] if the address cannot be bound.
pub async fn spawn_relay<F>(
    listen: &ListenConfig,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<RelayHandle, StartupError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let server = bind(&listen.host, listen.port, state).await?;
    let local_addr = server.local_addr();

    let task = tokio::spawn(async move {
        let result = server.serve(shutdown).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Relay server exited with error");
        }
        result
    });

    tracing::info!(%local_addr, "Relay server spawned on background task");

    Ok(RelayHandle { local_addr, task })
}
