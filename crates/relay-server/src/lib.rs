//! Viewer-facing server for the telemetry relay.
//!
//! This crate provides an Axum server that exposes:
//!
//! - **`WebSocket` endpoint** (`/` and `/ws`) where viewers receive the
//!   connection acknowledgment, per-tick `update` frames, and run
//!   `status` notices, and send `control` commands
//! - **REST endpoints** for the run status and a liveness probe
//!
//! # Architecture
//!
//! Every connection registers a [`Session`] in the shared
//! [`SessionRegistry`]. The run controller publishes through a
//! [`Broadcaster`], which serializes each message once and enqueues it on
//! every session's bounded outbound queue without waiting. Each
//! connection task drains its own queue to the socket, so one slow
//! viewer never delays the others or the step loop.
//!
//! [`Session`]: session::Session
//! [`SessionRegistry`]: registry::SessionRegistry
//! [`Broadcaster`]: fanout::Broadcaster

pub mod error;
pub mod fanout;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod startup;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use fanout::Broadcaster;
pub use registry::SessionRegistry;
pub use router::build_router;
pub use server::{BoundServer, ServerError, bind};
pub use startup::{RelayHandle, StartupError, spawn_relay};
pub use state::{AppState, ConnectionSettings};
