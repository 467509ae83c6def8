//! Sampling Scheduler Implementation

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Floor applied to every configured interval
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Interval used when none is configured
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Scheduler state: when inference last fired and how often it may fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingState {
    #[serde(skip)]
    pub last_inference: Option<Instant>,
    pub interval: Duration,
}

/// Wall-clock gate in front of the inference path
#[derive(Debug, Clone)]
pub struct SamplingScheduler {
    state: SamplingState,
    /// Times the gate opened
    fired: u64,
}

impl SamplingScheduler {
    /// Create a scheduler; `interval` is clamped to [`MIN_INTERVAL`]
    pub fn new(interval: Duration) -> Self {
        let interval = clamp_interval(interval);
        info!("Sampling scheduler created with {}ms interval", interval.as_millis());
        Self {
            state: SamplingState {
                last_inference: None,
                interval,
            },
            fired: 0,
        }
    }

    /// Create a scheduler from milliseconds
    pub fn from_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// Whether a new inference should run at `now`.
    ///
    /// Fires on the first call and whenever `now - last >= interval`;
    /// records `now` as the last inference time when it fires.
    pub fn should_infer(&mut self, now: Instant) -> bool {
        let due = match self.state.last_inference {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.state.interval,
        };

        if due {
            self.state.last_inference = Some(now);
            self.fired += 1;
            debug!("Sampling gate open (#{})", self.fired);
        }
        due
    }

    /// Change the interval; takes effect on the next check.
    ///
    /// Values under [`MIN_INTERVAL`] are clamped, not rejected. Returns the
    /// interval actually applied.
    pub fn set_interval(&mut self, interval: Duration) -> Duration {
        let applied = clamp_interval(interval);
        if applied != interval {
            debug!(
                "Requested interval {}ms clamped to {}ms",
                interval.as_millis(),
                applied.as_millis()
            );
        }
        if applied != self.state.interval {
            info!("Sampling interval updated to {}ms", applied.as_millis());
        }
        self.state.interval = applied;
        applied
    }

    /// Change the interval from milliseconds
    pub fn set_interval_ms(&mut self, interval_ms: u64) -> Duration {
        self.set_interval(Duration::from_millis(interval_ms))
    }

    pub fn interval(&self) -> Duration {
        self.state.interval
    }

    pub fn state(&self) -> SamplingState {
        self.state
    }

    /// Number of times the gate has opened
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Forget the last inference time (on session stop)
    pub fn reset(&mut self) {
        self.state.last_inference = None;
    }
}

impl Default for SamplingScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.max(MIN_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gating_sequence() {
        let t0 = Instant::now();
        let mut scheduler = SamplingScheduler::from_millis(500);

        assert!(scheduler.should_infer(t0));
        assert!(!scheduler.should_infer(t0 + Duration::from_millis(300)));
        assert!(scheduler.should_infer(t0 + Duration::from_millis(600)));
        assert_eq!(scheduler.state().last_inference, Some(t0 + Duration::from_millis(600)));
        assert_eq!(scheduler.fired(), 2);
    }

    #[test]
    fn test_interval_floor() {
        let mut scheduler = SamplingScheduler::default();
        assert_eq!(scheduler.set_interval_ms(50), Duration::from_millis(100));
        assert_eq!(scheduler.interval(), MIN_INTERVAL);
        assert_eq!(SamplingScheduler::from_millis(0).interval(), MIN_INTERVAL);
    }

    #[test]
    fn test_interval_change_applies_on_next_check() {
        let t0 = Instant::now();
        let mut scheduler = SamplingScheduler::from_millis(1000);
        assert!(scheduler.should_infer(t0));
        assert!(!scheduler.should_infer(t0 + Duration::from_millis(200)));

        scheduler.set_interval_ms(100);
        assert!(scheduler.should_infer(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_reset_fires_immediately() {
        let t0 = Instant::now();
        let mut scheduler = SamplingScheduler::from_millis(500);
        assert!(scheduler.should_infer(t0));
        scheduler.reset();
        assert!(scheduler.should_infer(t0 + Duration::from_millis(1)));
    }

    #[test]
    fn test_earlier_clock_never_fires() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut scheduler = SamplingScheduler::from_millis(100);
        assert!(scheduler.should_infer(t0));
        assert!(!scheduler.should_infer(t0 - Duration::from_secs(5)));
    }

    proptest! {
        #[test]
        fn prop_fired_inferences_are_spaced(
            interval_ms in 0u64..1000,
            steps in proptest::collection::vec(0u64..400, 1..60),
        ) {
            let mut scheduler = SamplingScheduler::from_millis(interval_ms);
            let interval = scheduler.interval();
            let start = Instant::now();
            let mut now = start;
            let mut last_fired: Option<Instant> = None;
            for step in steps {
                now += Duration::from_millis(step);
                if scheduler.should_infer(now) {
                    if let Some(previous) = last_fired {
                        prop_assert!(now - previous >= interval);
                    }
                    last_fired = Some(now);
                }
            }
        }
    }
}
