//! Configuration loading and typed config structures for the relay.
//!
//! The configuration lives in `relay-config.yaml` next to the binary's
//! working directory. Every section and field has a default, so an empty
//! file (or no file at all) yields a runnable relay on port 8765.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is outside its allowed range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level relay configuration.
///
/// Mirrors the structure of `relay-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RelayConfig {
    /// Network endpoint and connection keep-alive settings.
    #[serde(default)]
    pub server: ListenConfig,

    /// Step loop pacing and limits.
    #[serde(default)]
    pub run: RunConfig,

    /// Which snapshot source to drive and with what scenario.
    #[serde(default)]
    pub source: SourceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `RELAY_HOST` overrides `server.host`
    /// - `RELAY_PORT` overrides `server.port`
    /// - `RELAY_SCENARIO` overrides `source.scenario`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, then apply environment
    /// overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `RELAY_PORT` is not a port number.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("RELAY_PORT") {
            self.server.port = port.trim().parse().map_err(|e| ConfigError::Invalid {
                reason: format!("RELAY_PORT={port} is not a valid port: {e}"),
            })?;
        }
        if let Some(scenario) = lookup("RELAY_SCENARIO") {
            self.source.scenario = scenario;
        }
        Ok(())
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.base_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: String::from("run.base_interval_ms must be greater than 0"),
            });
        }
        if !(self.run.max_speed.is_finite() && self.run.max_speed > 0.0) {
            return Err(ConfigError::Invalid {
                reason: format!("run.max_speed must be positive, got {}", self.run.max_speed),
            });
        }
        if !(self.run.initial_speed.is_finite()
            && self.run.initial_speed > 0.0
            && self.run.initial_speed <= self.run.max_speed)
        {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "run.initial_speed must be in (0, {}], got {}",
                    self.run.max_speed, self.run.initial_speed
                ),
            });
        }
        if self.server.outbound_queue == 0 {
            return Err(ConfigError::Invalid {
                reason: String::from("server.outbound_queue must be greater than 0"),
            });
        }
        if self.server.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: String::from("server.ping_interval_secs must be greater than 0"),
            });
        }
        Ok(())
    }
}

/// Network endpoint and per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenConfig {
    /// Address to bind (e.g. `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for the WebSocket endpoint.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between keep-alive pings sent to each viewer.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Seconds a viewer may stay silent after a ping before it is dropped.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Frames buffered per viewer before it is considered too slow.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl ListenConfig {
    /// Interval between keep-alive pings.
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Longest a connection may go without inbound traffic.
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.saturating_add(self.ping_timeout_secs))
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Step loop pacing and limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunConfig {
    /// Delay between ticks at speed 1.0, in milliseconds.
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,

    /// Steps per run before the loop stops itself (0 = unlimited).
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u64,

    /// Speed multiplier at process start.
    #[serde(default = "default_initial_speed")]
    pub initial_speed: f64,

    /// Upper clamp for `set_speed`.
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
}

impl RunConfig {
    /// Base interval as a [`Duration`].
    pub const fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            max_ticks: default_max_ticks(),
            initial_speed: default_initial_speed(),
            max_speed: default_max_speed(),
        }
    }
}

/// Kind of snapshot source the binary drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Built-in synthetic intersection.
    #[default]
    Demo,
    /// JSON-lines trace replayed from `scenario`.
    Replay,
}

/// Snapshot source selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    /// Which source implementation to use.
    #[serde(default)]
    pub kind: SourceKind,

    /// Opaque scenario handle passed to the source (a trace path for
    /// `replay`, a label for `demo`).
    #[serde(default = "default_scenario")]
    pub scenario: String,

    /// Random seed for the demo source.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Vehicles kept on the road by the demo source.
    #[serde(default = "default_vehicles")]
    pub vehicles: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            scenario: default_scenario(),
            seed: default_seed(),
            vehicles: default_vehicles(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    8765
}

const fn default_ping_interval_secs() -> u64 {
    20
}

const fn default_ping_timeout_secs() -> u64 {
    20
}

const fn default_outbound_queue() -> usize {
    64
}

const fn default_base_interval_ms() -> u64 {
    100
}

const fn default_max_ticks() -> u64 {
    3600
}

const fn default_initial_speed() -> f64 {
    1.0
}

const fn default_max_speed() -> f64 {
    100.0
}

fn default_scenario() -> String {
    "intersection".to_owned()
}

const fn default_seed() -> u64 {
    42
}

const fn default_vehicles() -> u32 {
    16
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.run.base_interval_ms, 100);
        assert_eq!(config.run.max_ticks, 3600);
        assert_eq!(config.source.kind, SourceKind::Demo);
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9000
  ping_interval_secs: 5
  ping_timeout_secs: 10
  outbound_queue: 8

run:
  base_interval_ms: 50
  max_ticks: 0
  initial_speed: 2.0
  max_speed: 10.0

source:
  kind: replay
  scenario: "traces/rush_hour.jsonl"

logging:
  level: "debug"
  json: true
"#;

        let mut config: RelayConfig = serde_yml::from_str(yaml).unwrap();
        config.apply_overrides(|_| None).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.outbound_queue, 8);
        assert_eq!(config.run.base_interval(), Duration::from_millis(50));
        assert_eq!(config.run.max_ticks, 0);
        assert_eq!(config.run.initial_speed, 2.0);
        assert_eq!(config.source.kind, SourceKind::Replay);
        assert_eq!(config.source.scenario, "traces/rush_hour.jsonl");
        assert!(config.logging.json);
    }

    #[test]
    fn parse_minimal_yaml() {
        let config: RelayConfig = serde_yml::from_str("run:\n  max_ticks: 10\n").unwrap();
        assert_eq!(config.run.max_ticks, 10);
        assert_eq!(config.run.base_interval_ms, 100);
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn parse_empty_yaml() {
        let config = RelayConfig::parse("");
        assert!(config.is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = RelayConfig::default();
        config
            .apply_overrides(|key| match key {
                "RELAY_PORT" => Some(String::from("9100")),
                "RELAY_SCENARIO" => Some(String::from("other.jsonl")),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.source.scenario, "other.jsonl");
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn bad_port_override_is_rejected() {
        let mut config = RelayConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "RELAY_PORT").then(|| String::from("not-a-port"))
        });
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = RelayConfig::default();
        config.run.base_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn initial_speed_above_max_is_rejected() {
        let mut config = RelayConfig::default();
        config.run.initial_speed = 500.0;
        assert!(config.validate().is_err());
        config.run.initial_speed = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_project_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("relay-config.yaml");
        if path.exists() {
            let config = RelayConfig::from_file(&path);
            assert!(config.is_ok(), "Failed to load project config: {config:?}");
        }
    }
}
