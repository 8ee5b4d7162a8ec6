//! Tick pacing.
//!
//! The run loop suspends between ticks through a [`Pacer`] rather than
//! calling `tokio::time::sleep` directly, so tests can drive ticks
//! without wall-clock delay and can observe the requested intervals.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

/// Suspends the run loop between ticks.
pub trait Pacer: Send + Sync {
    /// Wait for roughly `interval` before the next tick.
    fn pause(&self, interval: Duration) -> BoxFuture<'_, ()>;
}

/// Real-time pacer backed by [`tokio::time::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPacer;

impl Pacer for TokioPacer {
    fn pause(&self, interval: Duration) -> BoxFuture<'_, ()> {
        tokio::time::sleep(interval).boxed()
    }
}

/// Pacer that only yields to the scheduler, ignoring the interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstantPacer;

impl Pacer for InstantPacer {
    fn pause(&self, _interval: Duration) -> BoxFuture<'_, ()> {
        tokio::task::yield_now().boxed()
    }
}

/// Delay between ticks for a given speed multiplier.
///
/// Falls back to `base` if the division is not representable (the
/// controller never stores a non-positive speed, so this only guards
/// against extreme values).
pub fn tick_interval(base: Duration, speed: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() / speed).unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_scales_with_speed() {
        let base = Duration::from_millis(100);
        assert_eq!(tick_interval(base, 1.0), base);
        assert_eq!(tick_interval(base, 2.0), Duration::from_millis(50));
        assert_eq!(tick_interval(base, 0.5), Duration::from_millis(200));
    }

    #[test]
    fn unrepresentable_interval_falls_back_to_base() {
        let base = Duration::from_millis(100);
        assert_eq!(tick_interval(base, f64::MIN_POSITIVE), base);
        assert_eq!(tick_interval(base, -1.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_pacer_sleeps() {
        let start = tokio::time::Instant::now();
        TokioPacer.pause(Duration::from_millis(250)).await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn instant_pacer_returns_immediately() {
        let start = std::time::Instant::now();
        InstantPacer.pause(Duration::from_secs(60)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
