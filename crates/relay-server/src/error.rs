//! Error types for viewer connections.
//!
//! [`ConnectionError`] covers every way handling one inbound message can
//! fail. None of them are fatal: the handler turns recoverable ones into
//! an `error` reply for the sender and keeps the connection open.

use relay_core::controller::CommandError;
use relay_types::{MALFORMED_MESSAGE, ProtocolError, ServerMessage};

/// Errors raised while serving a single viewer connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The message could not be parsed as a control envelope.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// Parser detail, for logs only.
        reason: String,
    },

    /// The message parsed but could not be applied.
    #[error("processing error: {detail}")]
    ProcessingError {
        /// Human-readable detail, echoed to the sender.
        detail: String,
    },

    /// The socket closed or failed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ConnectionError {
    /// The `error` message sent back to the viewer, if any.
    pub fn reply(&self) -> Option<ServerMessage> {
        match self {
            Self::MalformedPayload { .. } => Some(ServerMessage::error(MALFORMED_MESSAGE)),
            Self::ProcessingError { detail } => Some(ServerMessage::error(format!(
                "Error processing message: {detail}"
            ))),
            Self::ConnectionClosed => None,
        }
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Malformed { reason } => Self::MalformedPayload { reason },
            invalid @ ProtocolError::InvalidValue { .. } => Self::ProcessingError {
                detail: invalid.to_string(),
            },
        }
    }
}

impl From<CommandError> for ConnectionError {
    fn from(e: CommandError) -> Self {
        Self::ProcessingError {
            detail: e.to_string(),
        }
    }
}
