//! Snapshot source contract and a scripted implementation.
//!
//! The relay never simulates anything itself. A [`SnapshotSource`] wraps
//! the simulation engine: given an opaque [`ScenarioHandle`] it produces
//! a [`Stepper`], which advances one tick per call and reports the
//! entity and signal state afterwards. The run controller owns the
//! stepper for the lifetime of one run and calls
//! [`shutdown`](Stepper::shutdown) exactly once when the run ends.
//!
//! [`ScriptedSource`] produces a fixed number of synthetic ticks and
//! records how it was driven, which lets the controller and server be
//! exercised without a real engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use relay_types::{EntitySnapshot, SignalSnapshot, StepSnapshot};

/// Errors reported by a snapshot source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The engine (or its scenario) cannot be reached or loaded.
    #[error("snapshot source unavailable: {message}")]
    Unavailable {
        /// Description of what is missing.
        message: String,
    },

    /// The engine failed while advancing a tick.
    #[error("step failed at tick {tick}: {message}")]
    Step {
        /// Zero-based tick that failed.
        tick: u64,
        /// Description of the failure.
        message: String,
    },
}

/// Opaque handle identifying the scenario a source should load.
///
/// The relay passes it through untouched; only the source interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScenarioHandle(String);

impl ScenarioHandle {
    /// Wrap a scenario reference.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ScenarioHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of asking a stepper to advance.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The engine advanced one tick; here is the state after it.
    Advanced(StepSnapshot),
    /// The engine has no more data for this scenario.
    Done,
}

/// One live engine session, owned by a single run.
pub trait Stepper: Send {
    /// Advance the simulation by one tick.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Step`] if the engine fails. The run ends
    /// with an engine failure; [`shutdown`](Self::shutdown) is still
    /// called afterwards.
    fn advance(&mut self) -> Result<StepOutcome, SourceError>;

    /// Release engine resources. Called exactly once per stepper.
    fn shutdown(&mut self);
}

/// Factory for steppers.
pub trait SnapshotSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Verify the scenario can be loaded, without starting the engine.
    ///
    /// Called once at process startup so that a missing collaborator is
    /// fatal early rather than on the first `start`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] if the scenario cannot be used.
    fn check(&self, _scenario: &ScenarioHandle) -> Result<(), SourceError> {
        Ok(())
    }

    /// Start an engine session for the scenario.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] if the engine cannot start.
    fn initialize(&self, scenario: &ScenarioHandle) -> Result<Box<dyn Stepper>, SourceError>;
}

// ---------------------------------------------------------------------------
// Scripted source
// ---------------------------------------------------------------------------

/// Counters describing how a [`ScriptedSource`] has been driven.
#[derive(Debug, Default)]
pub struct SourceStats {
    initialized: AtomicU64,
    shutdowns: AtomicU64,
    advances: AtomicU64,
    active: AtomicU64,
    peak_active: AtomicU64,
}

impl SourceStats {
    /// Number of steppers created.
    pub fn initialized(&self) -> u64 {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of steppers shut down.
    pub fn shutdowns(&self) -> u64 {
        self.shutdowns.load(Ordering::Acquire)
    }

    /// Total successful and unsuccessful `advance` calls.
    pub fn advances(&self) -> u64 {
        self.advances.load(Ordering::Acquire)
    }

    /// Steppers created but not yet shut down.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously live steppers ever observed.
    pub fn peak_active(&self) -> u64 {
        self.peak_active.load(Ordering::Acquire)
    }
}

/// Source that emits a fixed number of synthetic ticks.
///
/// Each tick reports one entity (`veh0`) moving along the x axis and one
/// signal (`center`) cycling through two phases. Optionally fails on a
/// given tick or at initialization.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    ticks: u64,
    fail_at: Option<u64>,
    fail_init: bool,
    stats: Arc<SourceStats>,
}

impl ScriptedSource {
    /// A source whose steppers report `Done` after `ticks` advances.
    pub fn new(ticks: u64) -> Self {
        Self {
            ticks,
            fail_at: None,
            fail_init: false,
            stats: Arc::new(SourceStats::default()),
        }
    }

    /// Fail the advance for zero-based tick `tick`.
    #[must_use]
    pub const fn failing_at(mut self, tick: u64) -> Self {
        self.fail_at = Some(tick);
        self
    }

    /// Fail every `initialize` call.
    #[must_use]
    pub const fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Shared counters, updated by every stepper this source creates.
    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }
}

impl SnapshotSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn initialize(&self, scenario: &ScenarioHandle) -> Result<Box<dyn Stepper>, SourceError> {
        if self.fail_init {
            return Err(SourceError::Unavailable {
                message: format!("scripted failure loading {scenario}"),
            });
        }
        let _ = self.stats.initialized.fetch_add(1, Ordering::AcqRel);
        let active = self.stats.active.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let _ = self.stats.peak_active.fetch_max(active, Ordering::AcqRel);
        Ok(Box::new(ScriptedStepper {
            tick: 0,
            ticks: self.ticks,
            fail_at: self.fail_at,
            stats: Arc::clone(&self.stats),
            closed: false,
        }))
    }
}

struct ScriptedStepper {
    tick: u64,
    ticks: u64,
    fail_at: Option<u64>,
    stats: Arc<SourceStats>,
    closed: bool,
}

impl Stepper for ScriptedStepper {
    fn advance(&mut self) -> Result<StepOutcome, SourceError> {
        let _ = self.stats.advances.fetch_add(1, Ordering::AcqRel);
        if self.fail_at == Some(self.tick) {
            return Err(SourceError::Step {
                tick: self.tick,
                message: String::from("scripted engine failure"),
            });
        }
        if self.tick >= self.ticks {
            return Ok(StepOutcome::Done);
        }

        let tick = self.tick;
        self.tick = self.tick.saturating_add(1);

        // Tick counts in tests stay far below f64's exact integer range.
        #[allow(clippy::cast_precision_loss)]
        let position = tick as f64;

        let mut entities = BTreeMap::new();
        entities.insert(
            String::from("veh0"),
            EntitySnapshot {
                id: String::from("veh0"),
                x: position,
                y: 0.0,
                angle: 90.0,
                speed: 1.0,
                category: String::from("car"),
                route: vec![String::from("west_in"), String::from("east_out")],
            },
        );
        let phases = vec![String::from("Gr"), String::from("rG")];
        let current = if tick % 2 == 0 { "Gr" } else { "rG" };
        let mut signals = BTreeMap::new();
        signals.insert(
            String::from("center"),
            SignalSnapshot {
                current_state: current.to_owned(),
                phase_sequence: phases,
            },
        );

        Ok(StepOutcome::Advanced(StepSnapshot {
            entities,
            signals,
            sim_time: position * 0.1,
        }))
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stats.shutdowns.fetch_add(1, Ordering::AcqRel);
        let _ = self.stats.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn scripted_stepper_runs_to_done() {
        let source = ScriptedSource::new(2);
        let mut stepper = source.initialize(&ScenarioHandle::new("test")).unwrap();

        assert!(matches!(stepper.advance().unwrap(), StepOutcome::Advanced(_)));
        assert!(matches!(stepper.advance().unwrap(), StepOutcome::Advanced(_)));
        assert_eq!(stepper.advance().unwrap(), StepOutcome::Done);

        stepper.shutdown();
        let stats = source.stats();
        assert_eq!(stats.initialized(), 1);
        assert_eq!(stats.shutdowns(), 1);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.advances(), 3);
    }

    #[test]
    fn scripted_snapshot_contents() {
        let source = ScriptedSource::new(5);
        let mut stepper = source.initialize(&ScenarioHandle::new("test")).unwrap();
        let _ = stepper.advance().unwrap();
        let StepOutcome::Advanced(snapshot) = stepper.advance().unwrap() else {
            panic!("expected a snapshot");
        };
        assert_eq!(snapshot.entities["veh0"].route.len(), 2);
        assert_eq!(snapshot.signals["center"].current_state, "rG");
    }

    #[test]
    fn scripted_failure_modes() {
        let source = ScriptedSource::new(5).failing_at(1);
        let mut stepper = source.initialize(&ScenarioHandle::new("test")).unwrap();
        assert!(stepper.advance().is_ok());
        assert!(matches!(stepper.advance(), Err(SourceError::Step { tick: 1, .. })));

        let broken = ScriptedSource::new(5).failing_init();
        assert!(matches!(
            broken.initialize(&ScenarioHandle::new("x")),
            Err(SourceError::Unavailable { .. })
        ));
        assert_eq!(broken.stats().initialized(), 0);
    }

    #[test]
    fn repeated_shutdown_is_counted_once() {
        let source = ScriptedSource::new(1);
        let mut stepper = source.initialize(&ScenarioHandle::new("test")).unwrap();
        stepper.shutdown();
        stepper.shutdown();
        assert_eq!(source.stats().shutdowns(), 1);
    }
}
