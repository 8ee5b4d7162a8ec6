//! Run controller: the simulation lifecycle state machine and step loop.
//!
//! [`RunController`] owns the single [`RunState`] shared by every viewer
//! connection. All mutation goes through [`start`](RunController::start),
//! [`stop`](RunController::stop), and
//! [`set_speed`](RunController::set_speed), which serialize on one lock.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start--> Running --stop / ceiling / done / failure--> Stopped
//!                    ^                                           |
//!                    +------------------start--------------------+
//! ```
//!
//! # At most one loop
//!
//! Every `start` that leaves a non-running state bumps the run
//! generation and spawns a loop task that first awaits the previous
//! loop task. A loop whose generation is no longer current exits at
//! its next check, so a quick `stop`/`start` pair never produces two
//! overlapping tick streams.
//!
//! # Engine calls
//!
//! Every [`Stepper`] call and [`SnapshotSource::initialize`] runs on the
//! blocking pool, so a slow engine never stalls connection tasks. A panic
//! inside the engine ends the run as an engine failure; the stepper is
//! still shut down and the controller accepts the next `start`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared as SharedFuture};
use relay_types::{EndReason, Frame, RunNotice, RunPhase, ServerMessage};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::pacer::{Pacer, tick_interval};
use crate::source::{ScenarioHandle, SnapshotSource, StepOutcome, Stepper};

/// Errors returned by control operations.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The requested speed multiplier is not a positive finite number.
    #[error("speed must be a positive number, got {value}")]
    InvalidSpeed {
        /// The rejected value.
        value: f64,
    },
}

/// Delivers controller output to viewers.
///
/// The controller awaits [`publish`](Self::publish) while holding the run
/// state lock, so implementations must enqueue rather than wait on slow
/// subscribers.
pub trait FramePublisher: Send + Sync {
    /// Deliver a message to every current subscriber.
    ///
    /// Resolves to the number of subscribers the message was queued for.
    fn publish<'a>(&'a self, message: &'a ServerMessage) -> BoxFuture<'a, usize>;
}

/// Read-only copy of the shared run state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunState {
    /// Current lifecycle phase.
    pub phase: RunPhase,
    /// Speed multiplier applied to the base interval. Always positive.
    pub speed: f64,
    /// Frames broadcast in the current (or last) run.
    pub tick_count: u64,
}

/// Result of a `start` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new loop was launched for this run generation.
    Launched {
        /// The generation number of the new run.
        generation: u64,
    },
    /// A run was already active; nothing changed.
    AlreadyRunning,
}

/// Pacing and limits applied to every run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    /// Delay between ticks at speed 1.0.
    pub base_interval: Duration,
    /// Steps per run before the loop stops itself (0 = unlimited).
    pub max_ticks: u64,
    /// Speed multiplier at construction.
    pub initial_speed: f64,
    /// Upper clamp for `set_speed`.
    pub max_speed: f64,
}

impl From<&RunConfig> for RunSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            base_interval: config.base_interval(),
            max_ticks: config.max_ticks,
            initial_speed: config.initial_speed,
            max_speed: config.max_speed,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

/// JSON-serializable controller status for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    /// Current lifecycle phase.
    pub phase: RunPhase,
    /// Current speed multiplier.
    pub speed: f64,
    /// Frames broadcast in the current (or last) run.
    pub tick_count: u64,
    /// Configured step ceiling (0 = unlimited).
    pub max_ticks: u64,
    /// Base tick interval in milliseconds.
    pub base_interval_ms: u64,
    /// Effective tick interval in milliseconds at the current speed.
    pub interval_ms: u64,
    /// Number of runs started since process start.
    pub runs_started: u64,
    /// Why the last run ended, if one has.
    pub last_end_reason: Option<EndReason>,
    /// Name of the snapshot source.
    pub source: &'static str,
    /// Scenario handle passed to the source.
    pub scenario: String,
    /// ISO 8601 timestamp of controller creation.
    pub started_at: String,
}

/// Completion of a spawned run loop, awaitable from several places.
type LoopTask = SharedFuture<BoxFuture<'static, ()>>;

struct Inner {
    state: RunState,
    generation: u64,
    last_end: Option<EndReason>,
    loop_task: Option<LoopTask>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    source: Arc<dyn SnapshotSource>,
    scenario: ScenarioHandle,
    publisher: Arc<dyn FramePublisher>,
    pacer: Arc<dyn Pacer>,
    settings: RunSettings,
    created_at: DateTime<Utc>,
}

/// Owner of the run state and the step loop.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct RunController {
    shared: Arc<Shared>,
}

impl RunController {
    /// Create a controller in the `Idle` phase.
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        scenario: ScenarioHandle,
        publisher: Arc<dyn FramePublisher>,
        pacer: Arc<dyn Pacer>,
        settings: RunSettings,
    ) -> Self {
        let speed = if settings.initial_speed.is_finite() && settings.initial_speed > 0.0 {
            settings.initial_speed.min(settings.max_speed)
        } else {
            1.0
        };
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: RunState {
                        phase: RunPhase::Idle,
                        speed,
                        tick_count: 0,
                    },
                    generation: 0,
                    last_end: None,
                    loop_task: None,
                }),
                wake: Notify::new(),
                source,
                scenario,
                publisher,
                pacer,
                settings,
                created_at: Utc::now(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    /// Launch a run unless one is already active.
    ///
    /// Concurrent callers are serialized on the state lock; exactly one
    /// of them observes [`StartOutcome::Launched`].
    pub async fn start(&self) -> StartOutcome {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.phase == RunPhase::Running {
            debug!("Start ignored, run already active");
            return StartOutcome::AlreadyRunning;
        }

        inner.generation = inner.generation.saturating_add(1);
        let generation = inner.generation;
        inner.state.phase = RunPhase::Running;
        inner.state.tick_count = 0;
        inner.last_end = None;

        let previous = inner.loop_task.take();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            run_loop(shared, generation).await;
        });
        inner.loop_task = Some(
            handle
                .map(|joined| {
                    if let Err(e) = joined {
                        warn!(error = %e, "Run loop ended abnormally");
                    }
                })
                .boxed()
                .shared(),
        );

        info!(generation, "Run launched");
        StartOutcome::Launched { generation }
    }

    /// Stop the active run.
    ///
    /// Returns `true` if a run was active. The loop observes the stop at
    /// its next check; a sleeping loop is woken immediately. Stopping an
    /// idle or stopped controller changes nothing.
    pub async fn stop(&self) -> bool {
        let was_running = {
            let mut inner = self.shared.inner.lock().await;
            let running = inner.state.phase == RunPhase::Running;
            if running {
                inner.state.phase = RunPhase::Stopped;
            }
            running
        };
        if was_running {
            self.shared.wake.notify_waiters();
            info!("Run stop requested");
        }
        was_running
    }

    /// Set the speed multiplier.
    ///
    /// Values above the configured maximum are clamped to it. Returns the
    /// previous speed on success; the state is unchanged on error.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidSpeed`] for zero, negative, or
    /// non-finite values.
    pub async fn set_speed(&self, requested: f64) -> Result<f64, CommandError> {
        if !(requested.is_finite() && requested > 0.0) {
            return Err(CommandError::InvalidSpeed { value: requested });
        }
        let applied = requested.min(self.shared.settings.max_speed);
        let previous = {
            let mut inner = self.shared.inner.lock().await;
            std::mem::replace(&mut inner.state.speed, applied)
        };
        info!(previous, speed = applied, "Speed changed");
        Ok(previous)
    }

    /// Stop any active run and wait for its loop to release the stepper.
    pub async fn shutdown(&self) {
        let _ = self.stop().await;
        self.join().await;
    }

    /// Wait for the most recently launched loop to finish.
    pub async fn join(&self) {
        let task = self.shared.inner.lock().await.loop_task.clone();
        if let Some(task) = task {
            task.await;
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Copy of the current run state.
    pub async fn state(&self) -> RunState {
        self.shared.inner.lock().await.state
    }

    /// Full status for the status endpoint.
    pub async fn status(&self) -> RunStatus {
        let inner = self.shared.inner.lock().await;
        let settings = &self.shared.settings;
        let interval = tick_interval(settings.base_interval, inner.state.speed);
        RunStatus {
            phase: inner.state.phase,
            speed: inner.state.speed,
            tick_count: inner.state.tick_count,
            max_ticks: settings.max_ticks,
            base_interval_ms: duration_ms(settings.base_interval),
            interval_ms: duration_ms(interval),
            runs_started: inner.generation,
            last_end_reason: inner.last_end,
            source: self.shared.source.name(),
            scenario: self.shared.scenario.to_string(),
            started_at: self.shared.created_at.to_rfc3339(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Step loop
// ---------------------------------------------------------------------------

/// How a single run ended.
struct RunEnd {
    reason: EndReason,
    detail: Option<String>,
    frames: u64,
}

impl RunEnd {
    const fn failure(detail: String, frames: u64) -> Self {
        Self {
            reason: EndReason::EngineFailure,
            detail: Some(detail),
            frames,
        }
    }

    const fn stopped(frames: u64) -> Self {
        Self {
            reason: EndReason::OperatorStop,
            detail: None,
            frames,
        }
    }
}

async fn run_loop(shared: Arc<Shared>, generation: u64) {
    info!(
        generation,
        source = shared.source.name(),
        scenario = %shared.scenario,
        max_ticks = shared.settings.max_ticks,
        "Run starting"
    );

    let source = Arc::clone(&shared.source);
    let scenario = shared.scenario.clone();
    let initialized = on_blocking_pool(move || source.initialize(&scenario)).await;
    let stepper = match initialized {
        Ok(Ok(stepper)) => stepper,
        Ok(Err(e)) => {
            error!(generation, error = %e, "Snapshot source failed to initialize");
            finish(&shared, generation, RunEnd::failure(e.to_string(), 0)).await;
            return;
        }
        Err(panic) => {
            error!(generation, panic = %panic, "Snapshot source panicked during initialization");
            let detail = format!("snapshot source panicked: {panic}");
            finish(&shared, generation, RunEnd::failure(detail, 0)).await;
            return;
        }
    };

    {
        let inner = shared.inner.lock().await;
        if is_current(&inner, generation) {
            let notice = ServerMessage::Status(RunNotice {
                status: RunPhase::Running,
                reason: None,
                step: 0,
                message: None,
            });
            let _ = shared.publisher.publish(&notice).await;
        }
    }

    let (stepper, end) = drive(&shared, generation, stepper).await;
    match stepper {
        Some(stepper) => release(generation, stepper).await,
        None => warn!(generation, "Stepper lost with its blocking task, not released"),
    }

    finish(&shared, generation, end).await;
}

/// Render a panic payload for logs and the stopped notice.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

/// Run a synchronous engine call on the blocking pool.
///
/// A panic inside `call` comes back as `Err` with the panic message.
async fn on_blocking_pool<T, F>(call: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => Err(panic_message(e.into_panic().as_ref())),
        Err(e) => Err(e.to_string()),
    }
}

/// Run `call` against the stepper on the blocking pool and hand it back.
///
/// The stepper is returned even when `call` panics. The outer `Err` means
/// the blocking task itself was lost (runtime shutdown), taking the
/// stepper with it.
async fn with_stepper<T, F>(
    mut stepper: Box<dyn Stepper>,
    call: F,
) -> Result<(Box<dyn Stepper>, Result<T, String>), String>
where
    F: FnOnce(&mut Box<dyn Stepper>) -> T + Send + 'static,
    T: Send + 'static,
{
    on_blocking_pool(move || {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| call(&mut stepper)))
            .map_err(|payload| panic_message(payload.as_ref()));
        (stepper, result)
    })
    .await
}

async fn release(generation: u64, stepper: Box<dyn Stepper>) {
    match with_stepper(stepper, |s| s.shutdown()).await {
        Ok((_, Ok(()))) => debug!(generation, "Stepper released"),
        Ok((_, Err(panic))) => {
            warn!(generation, panic = %panic, "Stepper panicked during shutdown");
        }
        Err(e) => warn!(generation, error = %e, "Stepper shutdown task lost"),
    }
}

fn is_current(inner: &Inner, generation: u64) -> bool {
    inner.generation == generation && inner.state.phase == RunPhase::Running
}

async fn drive(
    shared: &Shared,
    generation: u64,
    mut stepper: Box<dyn Stepper>,
) -> (Option<Box<dyn Stepper>>, RunEnd) {
    let max_ticks = shared.settings.max_ticks;
    let mut frames: u64 = 0;

    loop {
        // --- Check stop / supersession (before tick) ---
        {
            let inner = shared.inner.lock().await;
            if !is_current(&inner, generation) {
                return (Some(stepper), RunEnd::stopped(frames));
            }
        }

        // --- Check step ceiling ---
        if max_ticks > 0 && frames >= max_ticks {
            info!(generation, max_ticks, "Step ceiling reached");
            let end = RunEnd {
                reason: EndReason::MaxTicks,
                detail: None,
                frames,
            };
            return (Some(stepper), end);
        }

        // --- Advance the engine ---
        let (returned, advanced) = match with_stepper(stepper, |s| s.advance()).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(generation, tick = frames, error = %e, "Snapshot source task lost");
                return (None, RunEnd::failure(e, frames));
            }
        };
        stepper = returned;
        let snapshot = match advanced {
            Ok(Ok(StepOutcome::Advanced(snapshot))) => snapshot,
            Ok(Ok(StepOutcome::Done)) => {
                info!(generation, frames, "Snapshot source exhausted");
                let end = RunEnd {
                    reason: EndReason::Completed,
                    detail: None,
                    frames,
                };
                return (Some(stepper), end);
            }
            Ok(Err(e)) => {
                error!(generation, tick = frames, error = %e, "Snapshot source failed");
                return (Some(stepper), RunEnd::failure(e.to_string(), frames));
            }
            Err(panic) => {
                error!(generation, tick = frames, panic = %panic, "Snapshot source panicked");
                let detail = format!("snapshot source panicked: {panic}");
                return (Some(stepper), RunEnd::failure(detail, frames));
            }
        };

        // --- Broadcast and count, atomically with respect to `stop` ---
        let woken = shared.wake.notified();
        tokio::pin!(woken);
        let speed = {
            let mut inner = shared.inner.lock().await;
            if !is_current(&inner, generation) {
                return (Some(stepper), RunEnd::stopped(frames));
            }
            let step = frames;
            let frame = ServerMessage::Update(Frame::from_snapshot(step, snapshot));
            let delivered = shared.publisher.publish(&frame).await;
            frames = frames.saturating_add(1);
            inner.state.tick_count = frames;
            debug!(generation, step, delivered, "Frame broadcast");
            // Registered under the lock so a `stop` after this point wakes us.
            let _ = woken.as_mut().enable();
            inner.state.speed
        };

        // --- Sleep for the paced interval (woken early by stop) ---
        let interval = tick_interval(shared.settings.base_interval, speed);
        tokio::select! {
            () = shared.pacer.pause(interval) => {}
            () = &mut woken => {}
        }
    }
}

async fn finish(shared: &Shared, generation: u64, end: RunEnd) {
    {
        let mut inner = shared.inner.lock().await;
        if inner.generation == generation {
            inner.state.phase = RunPhase::Stopped;
            inner.last_end = Some(end.reason);
        }
    }

    let notice = ServerMessage::Status(RunNotice {
        status: RunPhase::Stopped,
        reason: Some(end.reason),
        step: end.frames,
        message: end.detail.clone(),
    });
    let delivered = shared.publisher.publish(&notice).await;

    info!(
        generation,
        reason = ?end.reason,
        frames = end.frames,
        detail = end.detail.as_deref().unwrap_or(""),
        delivered,
        "Run ended"
    );
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::panic
)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use relay_types::StepSnapshot;

    use super::*;
    use crate::pacer::InstantPacer;
    use crate::source::{ScriptedSource, SourceError};

    /// Source whose steppers panic on a given advance (or in `initialize`).
    #[derive(Default)]
    struct PanickingSource {
        /// Zero-based advance that panics; `None` panics in `initialize`.
        panic_at: Option<u64>,
        shutdowns: Arc<AtomicU64>,
    }

    struct PanickingStepper {
        panic_at: u64,
        advances: u64,
        shutdowns: Arc<AtomicU64>,
    }

    impl SnapshotSource for PanickingSource {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn initialize(&self, _scenario: &ScenarioHandle) -> Result<Box<dyn Stepper>, SourceError> {
            let Some(panic_at) = self.panic_at else {
                panic!("engine crashed while loading");
            };
            Ok(Box::new(PanickingStepper {
                panic_at,
                advances: 0,
                shutdowns: Arc::clone(&self.shutdowns),
            }))
        }
    }

    impl Stepper for PanickingStepper {
        fn advance(&mut self) -> Result<StepOutcome, SourceError> {
            if self.advances == self.panic_at {
                panic!("engine crashed at tick {}", self.advances);
            }
            self.advances += 1;
            Ok(StepOutcome::Advanced(StepSnapshot::default()))
        }

        fn shutdown(&mut self) {
            let _ = self.shutdowns.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Publisher that records every message it is given.
    #[derive(Default)]
    struct RecordingPublisher {
        messages: StdMutex<Vec<ServerMessage>>,
    }

    impl RecordingPublisher {
        fn steps(&self) -> Vec<u64> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    ServerMessage::Update(frame) => Some(frame.step),
                    _ => None,
                })
                .collect()
        }

        fn notices(&self) -> Vec<RunNotice> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    ServerMessage::Status(n) => Some(n.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl FramePublisher for RecordingPublisher {
        fn publish<'a>(&'a self, message: &'a ServerMessage) -> BoxFuture<'a, usize> {
            self.messages.lock().unwrap().push(message.clone());
            futures::future::ready(1).boxed()
        }
    }

    /// Pacer that records requested intervals and returns immediately.
    #[derive(Default)]
    struct RecordingPacer {
        intervals: StdMutex<Vec<Duration>>,
    }

    impl Pacer for RecordingPacer {
        fn pause(&self, interval: Duration) -> BoxFuture<'_, ()> {
            self.intervals.lock().unwrap().push(interval);
            Box::pin(tokio::task::yield_now())
        }
    }

    fn settings(max_ticks: u64) -> RunSettings {
        RunSettings {
            base_interval: Duration::from_millis(100),
            max_ticks,
            initial_speed: 1.0,
            max_speed: 10.0,
        }
    }

    fn harness(
        source: ScriptedSource,
        max_ticks: u64,
    ) -> (RunController, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let controller = RunController::new(
            Arc::new(source),
            ScenarioHandle::new("test"),
            Arc::clone(&publisher) as Arc<dyn FramePublisher>,
            Arc::new(InstantPacer),
            settings(max_ticks),
        );
        (controller, publisher)
    }

    #[tokio::test]
    async fn initial_state_is_idle() {
        let (controller, _) = harness(ScriptedSource::new(10), 0);
        let state = controller.state().await;
        assert_eq!(state.phase, RunPhase::Idle);
        assert_eq!(state.speed, 1.0);
        assert_eq!(state.tick_count, 0);
    }

    #[tokio::test]
    async fn run_stops_at_step_ceiling() {
        let source = ScriptedSource::new(100);
        let stats = source.stats();
        let (controller, publisher) = harness(source, 5);

        assert!(matches!(controller.start().await, StartOutcome::Launched { generation: 1 }));
        controller.join().await;

        assert_eq!(publisher.steps(), vec![0, 1, 2, 3, 4]);
        let state = controller.state().await;
        assert_eq!(state.phase, RunPhase::Stopped);
        assert_eq!(state.tick_count, 5);
        assert_eq!(stats.shutdowns(), 1);
        assert_eq!(
            controller.status().await.last_end_reason,
            Some(EndReason::MaxTicks)
        );
    }

    #[tokio::test]
    async fn run_completes_when_source_is_exhausted() {
        let source = ScriptedSource::new(3);
        let stats = source.stats();
        let (controller, publisher) = harness(source, 0);

        let _ = controller.start().await;
        controller.join().await;

        assert_eq!(publisher.steps(), vec![0, 1, 2]);
        let notices = publisher.notices();
        assert_eq!(notices.first().unwrap().status, RunPhase::Running);
        let last = notices.last().unwrap();
        assert_eq!(last.status, RunPhase::Stopped);
        assert_eq!(last.reason, Some(EndReason::Completed));
        assert_eq!(last.step, 3);
        assert_eq!(stats.shutdowns(), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_launch_one_loop() {
        let source = ScriptedSource::new(20);
        let stats = source.stats();
        let (controller, publisher) = harness(source, 0);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = controller.clone();
                tokio::spawn(async move { c.start().await })
            })
            .collect();
        let mut launched = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), StartOutcome::Launched { .. }) {
                launched += 1;
            }
        }
        controller.join().await;

        assert_eq!(launched, 1);
        assert_eq!(stats.initialized(), 1);
        assert_eq!(publisher.steps(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn start_while_running_is_noop() {
        let (controller, _) = harness(ScriptedSource::new(1000), 0);
        let _ = controller.start().await;
        assert_eq!(controller.start().await, StartOutcome::AlreadyRunning);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn stop_halts_updates() {
        let source = ScriptedSource::new(1_000_000);
        let stats = source.stats();
        let (controller, publisher) = harness(source, 0);

        let _ = controller.start().await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(controller.stop().await);
        let seen_at_stop = publisher.steps().len();
        controller.join().await;

        assert_eq!(publisher.steps().len(), seen_at_stop);
        assert_eq!(controller.state().await.phase, RunPhase::Stopped);
        assert_eq!(stats.shutdowns(), 1);
        assert_eq!(
            publisher.notices().last().unwrap().reason,
            Some(EndReason::OperatorStop)
        );
    }

    #[tokio::test]
    async fn stop_when_idle_changes_nothing() {
        let (controller, publisher) = harness(ScriptedSource::new(1), 0);
        assert!(!controller.stop().await);
        assert_eq!(controller.state().await.phase, RunPhase::Idle);
        assert!(publisher.notices().is_empty());
    }

    #[tokio::test]
    async fn restart_never_overlaps_loops() {
        let source = ScriptedSource::new(1_000_000);
        let stats = source.stats();
        let (controller, publisher) = harness(source, 0);

        for _ in 0..5 {
            let _ = controller.start().await;
            tokio::task::yield_now().await;
            let _ = controller.stop().await;
        }
        let _ = controller.start().await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        controller.shutdown().await;

        assert_eq!(stats.peak_active(), 1);
        assert_eq!(stats.initialized(), stats.shutdowns());

        // Steps restart at 0 for each run and increase within a run.
        let steps = publisher.steps();
        for pair in steps.windows(2) {
            let [a, b] = [pair[0], pair[1]];
            assert!(b == a + 1 || b == 0, "unexpected step sequence {a} -> {b}");
        }
    }

    #[tokio::test]
    async fn engine_failure_stops_run_and_allows_restart() {
        let source = ScriptedSource::new(10).failing_at(2);
        let stats = source.stats();
        let (controller, publisher) = harness(source, 0);

        let _ = controller.start().await;
        controller.join().await;

        assert_eq!(publisher.steps(), vec![0, 1]);
        let last = publisher.notices().last().cloned().unwrap();
        assert_eq!(last.reason, Some(EndReason::EngineFailure));
        assert!(last.message.unwrap().contains("scripted engine failure"));
        assert_eq!(stats.shutdowns(), 1);
        assert_eq!(controller.state().await.phase, RunPhase::Stopped);

        assert!(matches!(controller.start().await, StartOutcome::Launched { generation: 2 }));
        controller.join().await;
        assert_eq!(stats.initialized(), 2);
    }

    fn panicking_harness(source: PanickingSource) -> (RunController, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let controller = RunController::new(
            Arc::new(source),
            ScenarioHandle::new("test"),
            Arc::clone(&publisher) as Arc<dyn FramePublisher>,
            Arc::new(InstantPacer),
            settings(0),
        );
        (controller, publisher)
    }

    #[tokio::test]
    async fn engine_panic_stops_run_and_releases_stepper() {
        let shutdowns = Arc::new(AtomicU64::new(0));
        let (controller, publisher) = panicking_harness(PanickingSource {
            panic_at: Some(2),
            shutdowns: Arc::clone(&shutdowns),
        });

        let _ = controller.start().await;
        controller.join().await;

        assert_eq!(publisher.steps(), vec![0, 1]);
        assert_eq!(controller.state().await.phase, RunPhase::Stopped);
        assert_eq!(shutdowns.load(Ordering::Acquire), 1);

        let last = publisher.notices().last().cloned().unwrap();
        assert_eq!(last.status, RunPhase::Stopped);
        assert_eq!(last.reason, Some(EndReason::EngineFailure));
        assert_eq!(last.step, 2);
        assert!(last.message.unwrap().contains("engine crashed at tick 2"));
        assert_eq!(
            controller.status().await.last_end_reason,
            Some(EndReason::EngineFailure)
        );

        assert!(matches!(controller.start().await, StartOutcome::Launched { generation: 2 }));
        controller.join().await;
        assert_eq!(shutdowns.load(Ordering::Acquire), 2);
    }

    /// Source whose single advance blocks its thread until released.
    struct GatedSource {
        gate: StdMutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    struct GatedStepper {
        gate: std::sync::mpsc::Receiver<()>,
    }

    impl SnapshotSource for GatedSource {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn initialize(&self, _scenario: &ScenarioHandle) -> Result<Box<dyn Stepper>, SourceError> {
            let gate = self.gate.lock().unwrap().take().unwrap();
            Ok(Box::new(GatedStepper { gate }))
        }
    }

    impl Stepper for GatedStepper {
        fn advance(&mut self) -> Result<StepOutcome, SourceError> {
            let _ = self.gate.recv();
            Ok(StepOutcome::Done)
        }

        fn shutdown(&mut self) {}
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_engine_does_not_stall_the_runtime() {
        let (release, gate) = std::sync::mpsc::channel();
        let publisher = Arc::new(RecordingPublisher::default());
        let controller = RunController::new(
            Arc::new(GatedSource {
                gate: StdMutex::new(Some(gate)),
            }),
            ScenarioHandle::new("test"),
            Arc::clone(&publisher) as Arc<dyn FramePublisher>,
            Arc::new(InstantPacer),
            settings(0),
        );

        let _ = controller.start().await;
        // The only runtime thread keeps serving this task while the
        // engine is parked inside `advance`.
        while publisher.notices().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.state().await.phase, RunPhase::Running);

        release.send(()).unwrap();
        controller.join().await;
        assert_eq!(
            controller.status().await.last_end_reason,
            Some(EndReason::Completed)
        );
    }

    #[tokio::test]
    async fn init_panic_reports_engine_failure() {
        let (controller, publisher) = panicking_harness(PanickingSource::default());

        let _ = controller.start().await;
        controller.join().await;

        assert!(publisher.steps().is_empty());
        let notices = publisher.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].reason, Some(EndReason::EngineFailure));
        assert!(
            notices[0]
                .message
                .as_deref()
                .unwrap()
                .contains("engine crashed while loading")
        );
        assert_eq!(controller.state().await.phase, RunPhase::Stopped);
        assert!(matches!(controller.start().await, StartOutcome::Launched { .. }));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn init_failure_reports_engine_failure() {
        let (controller, publisher) = harness(ScriptedSource::new(10).failing_init(), 0);
        let _ = controller.start().await;
        controller.join().await;

        assert!(publisher.steps().is_empty());
        let notices = publisher.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].reason, Some(EndReason::EngineFailure));
        assert_eq!(controller.state().await.phase, RunPhase::Stopped);
    }

    #[tokio::test]
    async fn set_speed_validates_and_clamps() {
        let (controller, _) = harness(ScriptedSource::new(1), 0);

        assert_eq!(controller.set_speed(2.0).await.unwrap(), 1.0);
        assert_eq!(controller.state().await.speed, 2.0);

        assert!(controller.set_speed(0.0).await.is_err());
        assert!(controller.set_speed(-3.0).await.is_err());
        assert!(controller.set_speed(f64::NAN).await.is_err());
        assert!(controller.set_speed(f64::INFINITY).await.is_err());
        assert_eq!(controller.state().await.speed, 2.0);

        let _ = controller.set_speed(500.0).await.unwrap();
        assert_eq!(controller.state().await.speed, 10.0);
    }

    #[tokio::test]
    async fn speed_change_shortens_interval() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pacer = Arc::new(RecordingPacer::default());
        let controller = RunController::new(
            Arc::new(ScriptedSource::new(4)),
            ScenarioHandle::new("test"),
            publisher,
            Arc::clone(&pacer) as Arc<dyn Pacer>,
            settings(0),
        );

        let _ = controller.set_speed(2.0).await.unwrap();
        let _ = controller.start().await;
        controller.join().await;

        let intervals = pacer.intervals.lock().unwrap().clone();
        assert_eq!(intervals.len(), 4);
        assert!(intervals.iter().all(|d| *d == Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_wakes_sleeping_loop() {
        let publisher = Arc::new(RecordingPublisher::default());
        let controller = RunController::new(
            Arc::new(ScriptedSource::new(100)),
            ScenarioHandle::new("test"),
            publisher,
            Arc::new(crate::pacer::TokioPacer),
            RunSettings {
                base_interval: Duration::from_secs(3600),
                ..settings(0)
            },
        );

        let _ = controller.start().await;
        tokio::task::yield_now().await;
        let before = tokio::time::Instant::now();
        controller.shutdown().await;
        assert!(before.elapsed() < Duration::from_secs(3600));
        assert_eq!(controller.state().await.phase, RunPhase::Stopped);
    }

    #[tokio::test]
    async fn status_reports_configuration() {
        let (controller, _) = harness(ScriptedSource::new(1), 7);
        let status = controller.status().await;
        assert_eq!(status.phase, RunPhase::Idle);
        assert_eq!(status.max_ticks, 7);
        assert_eq!(status.base_interval_ms, 100);
        assert_eq!(status.interval_ms, 100);
        assert_eq!(status.source, "scripted");
        assert_eq!(status.scenario, "test");
        assert_eq!(status.runs_started, 0);
    }
}
