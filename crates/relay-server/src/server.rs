//! Relay HTTP server lifecycle management.
//!
//! [`bind`] claims the TCP endpoint up front so that an address already in
//! use is reported before anything else starts. [`BoundServer::serve`]
//! then runs the Axum server until the supplied shutdown future resolves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Errors that can occur when starting or running the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server encountered a fatal error while serving.
    #[error("serve error: {0}")]
    Serve(String),
}

/// A server whose listener is bound but not yet accepting.
#[derive(Debug)]
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
}

/// Bind `host:port` and build the router.
///
/// Port `0` picks an ephemeral port; read it back with
/// [`BoundServer::local_addr`].
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the address cannot be resolved or is
/// already in use.
pub async fn bind(host: &str, port: u16, state: Arc<AppState>) -> Result<BoundServer, ServerError> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {host}:{port}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ServerError::Bind(format!("no local address for {host}:{port}: {e}")))?;

    Ok(BoundServer {
        listener,
        local_addr,
        router: build_router(state),
    })
}

impl BoundServer {
    /// The address actually bound.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve requests until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Serve`] if the server hits a fatal I/O error.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %self.local_addr, "Relay server listening");

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Serve(format!("serve error: {e}")))?;

        info!(addr = %self.local_addr, "Relay server stopped");
        Ok(())
    }
}
