//! Shared wire types for the telemetry relay.
//!
//! This crate is the single source of truth for what travels between the
//! relay and its viewers. Types flow downstream to `TypeScript` via
//! `ts-rs` for the browser viewer.
//!
//! # Modules
//!
//! - [`ids`] -- Viewer session identifier
//! - [`enums`] -- Run phase, end reason, and handshake status
//! - [`snapshot`] -- Entity/signal snapshots and the per-tick [`Frame`]
//! - [`protocol`] -- Inbound control decoding and outbound [`ServerMessage`]

pub mod enums;
pub mod ids;
pub mod protocol;
pub mod snapshot;

// Re-export all public types at crate root for convenience.
pub use enums::{ConnectionStatus, EndReason, RunPhase};
pub use ids::SessionId;
pub use protocol::{
    ControlCommand, DEFAULT_SPEED, MALFORMED_MESSAGE, ProtocolError, RunNotice, ServerMessage,
    decode_command,
};
pub use snapshot::{EntitySnapshot, Frame, SignalSnapshot, StepSnapshot};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation for the viewer.

    #[test]
    fn export_bindings() {
        // The files are written to `bindings/` relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::SessionId::export_all();
        let _ = crate::enums::RunPhase::export_all();
        let _ = crate::enums::EndReason::export_all();
        let _ = crate::enums::ConnectionStatus::export_all();
        let _ = crate::snapshot::EntitySnapshot::export_all();
        let _ = crate::snapshot::SignalSnapshot::export_all();
        let _ = crate::snapshot::Frame::export_all();
        let _ = crate::protocol::RunNotice::export_all();
        let _ = crate::protocol::ServerMessage::export_all();
    }
}
