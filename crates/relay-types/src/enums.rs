//! Enumeration types shared by the run controller and the wire protocol.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Lifecycle phase of the simulation run.
///
/// `Idle` only exists before the first `start`. After a run ends the
/// phase stays `Stopped` until the next `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum RunPhase {
    /// No run has been started since the process came up.
    #[default]
    Idle,
    /// The step loop is active and broadcasting frames.
    Running,
    /// The last run ended (stopped, exhausted, or failed).
    Stopped,
}

impl RunPhase {
    /// Lowercase name used in logs and the wire protocol.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl core::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a run left the `Running` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum EndReason {
    /// A viewer sent `stop` (or the process is shutting down).
    OperatorStop,
    /// The configured step ceiling was reached.
    MaxTicks,
    /// The snapshot source reported that it has no more data.
    Completed,
    /// The snapshot source failed to initialize or to advance.
    EngineFailure,
}

/// Connection handshake status sent in the acknowledgment message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ConnectionStatus {
    /// The session is registered and will receive broadcasts.
    Connected,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn phases_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&RunPhase::Running).unwrap(), "\"running\"");
        assert_eq!(RunPhase::Stopped.to_string(), "stopped");
        assert_eq!(RunPhase::default(), RunPhase::Idle);
    }

    #[test]
    fn end_reasons_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&EndReason::EngineFailure).unwrap(),
            "\"engine_failure\""
        );
        assert_eq!(serde_json::to_string(&EndReason::MaxTicks).unwrap(), "\"max_ticks\"");
    }
}
