//! Relay engine binary for the telemetry relay.
//!
//! This is the main entry point that wires together the snapshot source,
//! the run controller, and the viewer server. It loads configuration,
//! verifies the source can serve its scenario, binds the endpoint, and
//! then relays until `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `relay-config.yaml` (defaults if absent)
//! 2. Initialize structured logging (tracing)
//! 3. Build the snapshot source and check the scenario
//! 4. Create the session registry, broadcaster, and run controller
//! 5. Bind and spawn the relay server
//! 6. Wait for `Ctrl-C`, stop any active run, and shut the server down

mod demo;
mod error;
mod replay;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relay_core::config::{LoggingConfig, RelayConfig, SourceConfig, SourceKind};
use relay_core::controller::{RunController, RunSettings};
use relay_core::pacer::TokioPacer;
use relay_core::source::{ScenarioHandle, SnapshotSource};
use relay_server::{AppState, Broadcaster, ConnectionSettings, SessionRegistry, spawn_relay};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::demo::DemoSource;
use crate::error::EngineError;
use crate::replay::ReplaySource;

/// Configuration file looked up in the working directory.
const CONFIG_PATH: &str = "relay-config.yaml";

/// How long to wait for open connections after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Application entry point for the relay engine.
///
/// # Errors
///
/// Returns an error if configuration is invalid, the scenario cannot be
/// loaded, or the endpoint cannot be bound.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    info!("relay-engine starting");
    info!(
        host = config.server.host,
        port = config.server.port,
        base_interval_ms = config.run.base_interval_ms,
        max_ticks = config.run.max_ticks,
        source = ?config.source.kind,
        scenario = config.source.scenario,
        "Configuration loaded"
    );

    // 3. Build the snapshot source and verify the scenario.
    let source = build_source(&config.source);
    let scenario = ScenarioHandle::new(config.source.scenario.clone());
    source.check(&scenario).map_err(EngineError::from)?;
    info!(source = source.name(), %scenario, "Snapshot source ready");

    // 4. Registry, broadcaster, and controller.
    let registry = Arc::new(SessionRegistry::new());
    let controller = RunController::new(
        source,
        scenario,
        Arc::new(Broadcaster::new(Arc::clone(&registry))),
        Arc::new(TokioPacer),
        RunSettings::from(&config.run),
    );

    // 5. Bind and spawn the relay server.
    let state = Arc::new(AppState::new(
        controller.clone(),
        registry,
        ConnectionSettings::from(&config.server),
    ));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut handle = spawn_relay(&config.server, state, async move {
        let _ = shutdown_rx.await;
    })
    .await
    .map_err(EngineError::from)?;
    info!(addr = %handle.local_addr, "Relay server started");

    // 6. Run until Ctrl-C or the server exits on its own.
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
            }
            info!("Shutdown requested");
        }
        result = &mut handle.task => {
            warn!(?result, "Relay server exited unexpectedly");
        }
    }

    controller.shutdown().await;
    let _ = shutdown_tx.send(());
    if !handle.task.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, &mut handle.task).await.is_err()
    {
        warn!("Open connections did not close in time, exiting anyway");
    }

    info!("relay-engine shutdown complete");
    Ok(())
}

/// Load the relay configuration from `relay-config.yaml`.
///
/// Looks for the config file relative to the current working directory.
/// Environment overrides apply in both cases.
fn load_config() -> Result<RelayConfig, EngineError> {
    let config_path = Path::new(CONFIG_PATH);
    let config = if config_path.exists() {
        RelayConfig::from_file(config_path)?
    } else {
        RelayConfig::parse("")?
    };
    Ok(config)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`.
fn init_logging(logging: &LoggingConfig) -> Result<(), EngineError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| EngineError::Logging {
            message: format!("invalid log filter {:?}: {e}", logging.level),
        })?;

    let installed = if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };
    installed.map_err(|e| EngineError::Logging {
        message: e.to_string(),
    })
}

/// Build the snapshot source selected by configuration.
fn build_source(config: &SourceConfig) -> Arc<dyn SnapshotSource> {
    match config.kind {
        SourceKind::Demo => Arc::new(DemoSource::new(config.seed, config.vehicles)),
        SourceKind::Replay => Arc::new(ReplaySource),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn demo_source_selected_by_default() {
        let source = build_source(&SourceConfig::default());
        assert_eq!(source.name(), "demo");
        assert!(source.check(&ScenarioHandle::new("intersection")).is_ok());
    }

    #[test]
    fn replay_source_checks_its_trace() {
        let config = SourceConfig {
            kind: SourceKind::Replay,
            ..SourceConfig::default()
        };
        let source = build_source(&config);
        assert_eq!(source.name(), "replay");
        assert!(
            source
                .check(&ScenarioHandle::new("/nonexistent/trace.jsonl"))
                .is_err()
        );
    }

    #[tokio::test]
    async fn demo_run_reaches_step_ceiling() {
        let registry = Arc::new(SessionRegistry::new());
        let controller = RunController::new(
            build_source(&SourceConfig::default()),
            ScenarioHandle::new("intersection"),
            Arc::new(Broadcaster::new(Arc::clone(&registry))),
            Arc::new(relay_core::pacer::InstantPacer),
            RunSettings {
                max_ticks: 25,
                ..RunSettings::default()
            },
        );

        let _ = controller.start().await;
        controller.join().await;

        let status = controller.status().await;
        assert_eq!(status.tick_count, 25);
        assert_eq!(
            status.last_end_reason,
            Some(relay_types::EndReason::MaxTicks)
        );
    }
}
