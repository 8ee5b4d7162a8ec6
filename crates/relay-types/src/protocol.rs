//! JSON control and telemetry protocol spoken with viewers.
//!
//! Inbound text is a control envelope:
//!
//! ```json
//! {"type": "control", "action": "set_speed", "speed": 2.0}
//! ```
//!
//! Unknown `type` values and unknown control actions are ignored so
//! newer viewers can talk to older relays. Outbound messages are
//! [`ServerMessage`] values tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::enums::{ConnectionStatus, EndReason, RunPhase};
use crate::snapshot::Frame;

/// Speed used when a `set_speed` command omits the `speed` field.
pub const DEFAULT_SPEED: f64 = 1.0;

/// Error text sent to a viewer whose message could not be parsed.
pub const MALFORMED_MESSAGE: &str = "Invalid JSON format";

/// Errors produced while decoding an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The text is not a JSON object or lacks the envelope fields.
    #[error("malformed payload: {reason}")]
    Malformed {
        /// What was wrong with the payload.
        reason: String,
    },

    /// A recognized command carried a field of the wrong shape.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// The offending field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// A decoded control command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    /// Launch a run if none is active.
    Start,
    /// Stop the active run.
    Stop,
    /// Change the speed multiplier. The value is not yet range-checked.
    SetSpeed(f64),
}

/// Payload of a `status` message broadcast when a run starts or ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RunNotice {
    /// Phase the run has entered.
    pub status: RunPhase,
    /// Why the run ended, when `status` is `stopped`.
    pub reason: Option<EndReason>,
    /// Number of frames broadcast in this run so far.
    pub step: u64,
    /// Human-readable detail (engine failure text, for example).
    pub message: Option<String>,
}

/// Every message the relay sends to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ServerMessage {
    /// Handshake acknowledgment, sent once per connection before any update.
    Connection {
        /// Always `connected`.
        status: ConnectionStatus,
        /// Greeting text.
        message: String,
    },
    /// Per-tick telemetry frame.
    Update(Frame),
    /// Run lifecycle notice.
    Status(RunNotice),
    /// Error reply, sent only to the viewer that caused it.
    Error {
        /// Description of the failure.
        message: String,
    },
}

impl ServerMessage {
    /// Build the connection acknowledgment.
    pub fn connected(message: impl Into<String>) -> Self {
        Self::Connection {
            status: ConnectionStatus::Connected,
            message: message.into(),
        }
    }

    /// Build an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Short name of the message kind, for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Update(_) => "update",
            Self::Status(_) => "status",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON text sent over the wire.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] if a float in the payload is not
    /// representable (serde rejects nothing else for these types).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode one inbound text message.
///
/// Returns `Ok(None)` for well-formed envelopes the relay does not act
/// on (non-control types, unknown actions).
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] when the text is not a JSON
/// object with a string `type` (and, for control messages, a string
/// `action`). Returns [`ProtocolError::InvalidValue`] when `set_speed`
/// carries a `speed` that is not numeric.
pub fn decode_command(text: &str) -> Result<Option<ControlCommand>, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })?;

    let Value::Object(envelope) = value else {
        return Err(ProtocolError::Malformed {
            reason: String::from("expected a JSON object"),
        });
    };

    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed {
            reason: String::from("missing string field `type`"),
        })?;

    if kind != "control" {
        return Ok(None);
    }

    let action = envelope
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed {
            reason: String::from("control message is missing string field `action`"),
        })?;

    match action {
        "start" => Ok(Some(ControlCommand::Start)),
        "stop" => Ok(Some(ControlCommand::Stop)),
        "set_speed" => parse_speed(envelope.get("speed")).map(|s| Some(ControlCommand::SetSpeed(s))),
        _ => Ok(None),
    }
}

/// Read the `speed` field: a JSON number, a numeric string, or absent.
fn parse_speed(field: Option<&Value>) -> Result<f64, ProtocolError> {
    match field {
        None | Some(Value::Null) => Ok(DEFAULT_SPEED),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| ProtocolError::InvalidValue {
            field: "speed",
            reason: format!("{n} is not representable as a float"),
        }),
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|e| ProtocolError::InvalidValue {
            field: "speed",
            reason: format!("could not convert string to float: '{s}' ({e})"),
        }),
        Some(other) => Err(ProtocolError::InvalidValue {
            field: "speed",
            reason: format!("expected a number, got {other}"),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn decodes_start_and_stop() {
        assert_eq!(
            decode_command(r#"{"type":"control","action":"start"}"#).unwrap(),
            Some(ControlCommand::Start)
        );
        assert_eq!(
            decode_command(r#"{"type":"control","action":"stop"}"#).unwrap(),
            Some(ControlCommand::Stop)
        );
    }

    #[test]
    fn decodes_speed_number_and_string() {
        assert_eq!(
            decode_command(r#"{"type":"control","action":"set_speed","speed":2.0}"#).unwrap(),
            Some(ControlCommand::SetSpeed(2.0))
        );
        assert_eq!(
            decode_command(r#"{"type":"control","action":"set_speed","speed":"0.5"}"#).unwrap(),
            Some(ControlCommand::SetSpeed(0.5))
        );
    }

    #[test]
    fn missing_speed_defaults_to_one() {
        assert_eq!(
            decode_command(r#"{"type":"control","action":"set_speed"}"#).unwrap(),
            Some(ControlCommand::SetSpeed(DEFAULT_SPEED))
        );
    }

    #[test]
    fn non_numeric_speed_is_invalid_value() {
        let err = decode_command(r#"{"type":"control","action":"set_speed","speed":"fast"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidValue { field: "speed", .. }));

        let err = decode_command(r#"{"type":"control","action":"set_speed","speed":[1]}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidValue { .. }));
    }

    #[test]
    fn unknown_types_and_actions_are_ignored() {
        assert_eq!(decode_command(r#"{"type":"ping"}"#).unwrap(), None);
        assert_eq!(
            decode_command(r#"{"type":"control","action":"rewind"}"#).unwrap(),
            None
        );
    }

    #[test]
    fn bad_json_is_malformed() {
        assert!(matches!(
            decode_command("{not json").unwrap_err(),
            ProtocolError::Malformed { .. }
        ));
        assert!(matches!(
            decode_command("[1,2,3]").unwrap_err(),
            ProtocolError::Malformed { .. }
        ));
        assert!(matches!(
            decode_command(r#"{"action":"start"}"#).unwrap_err(),
            ProtocolError::Malformed { .. }
        ));
        assert!(matches!(
            decode_command(r#"{"type":"control"}"#).unwrap_err(),
            ProtocolError::Malformed { .. }
        ));
    }

    #[test]
    fn connection_ack_shape() {
        let json: Value =
            serde_json::from_str(&ServerMessage::connected("hello").encode().unwrap()).unwrap();
        assert_eq!(json["type"], "connection");
        assert_eq!(json["status"], "connected");
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn update_frame_is_flattened_under_type_tag() {
        let frame = Frame {
            step: 3,
            entities: BTreeMap::new(),
            signals: BTreeMap::new(),
            sim_time: 0.3,
        };
        let json: Value =
            serde_json::from_str(&ServerMessage::Update(frame).encode().unwrap()).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["step"], 3);
        assert!(json["vehicles"].is_object());
        assert!(json["trafficLights"].is_object());
        assert_eq!(json["time"], 0.3);
    }

    #[test]
    fn status_notice_shape() {
        let notice = ServerMessage::Status(RunNotice {
            status: RunPhase::Stopped,
            reason: Some(EndReason::EngineFailure),
            step: 12,
            message: Some(String::from("engine crashed")),
        });
        let json: Value = serde_json::from_str(&notice.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["reason"], "engine_failure");
        assert_eq!(json["step"], 12);
        assert_eq!(notice.kind(), "status");
    }

    #[test]
    fn error_reply_shape() {
        let json: Value =
            serde_json::from_str(&ServerMessage::error(MALFORMED_MESSAGE).encode().unwrap())
                .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "Invalid JSON format");
    }
}
