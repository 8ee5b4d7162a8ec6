//! Shared application state for the relay server.
//!
//! [`AppState`] bundles the run controller, the session registry, and the
//! per-connection settings. It is wrapped in [`Arc`] and injected into
//! handlers via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::config::ListenConfig;
use relay_core::controller::RunController;

use crate::registry::SessionRegistry;

/// Greeting sent in the connection acknowledgment.
pub const CONNECTED_MESSAGE: &str = "Successfully connected to simulation server";

/// Per-connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// Longest a connection may go without inbound traffic.
    pub idle_timeout: Duration,
    /// Outbound queue capacity per session.
    pub outbound_queue: usize,
}

impl From<&ListenConfig> for ConnectionSettings {
    fn from(config: &ListenConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
            outbound_queue: config.outbound_queue,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ListenConfig::default())
    }
}

/// Shared state for the Axum application.
#[derive(Clone)]
pub struct AppState {
    /// Owner of the run state and step loop.
    pub controller: RunController,
    /// Currently connected viewers.
    pub registry: Arc<SessionRegistry>,
    /// Keep-alive and queue settings applied to each connection.
    pub connection: ConnectionSettings,
    /// When the server state was created.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create application state around an existing controller and registry.
    ///
    /// The registry must be the one the controller's publisher broadcasts to.
    pub fn new(
        controller: RunController,
        registry: Arc<SessionRegistry>,
        connection: ConnectionSettings,
    ) -> Self {
        Self {
            controller,
            registry,
            connection,
            started_at: Utc::now(),
        }
    }
}
