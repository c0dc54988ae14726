// ABOUTME: Utilities for working with times and timestamps.
// ABOUTME: Provides RFC3339 formatting and monotonic timers on tokio's clock.
use ::time::{format_description::well_known::Rfc3339, OffsetDateTime};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Convert a SystemTime to an RFC3339 timestamp string
///
/// # Examples
///
/// ```
/// use em_core::to_rfc3339;
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let time = UNIX_EPOCH + Duration::from_secs(1_609_459_200); // 2021-01-01
/// assert_eq!(to_rfc3339(time), "2021-01-01T00:00:00Z");
/// ```
pub fn to_rfc3339(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Current wall-clock time as an RFC3339 string
pub fn now_rfc3339() -> String {
    to_rfc3339(SystemTime::now())
}

/// Monotonic stopwatch backed by `tokio::time::Instant`
///
/// Because it reads tokio's clock, paused-time tests can move it forward
/// with `tokio::time::advance`.
///
/// # Examples
///
/// ```
/// use em_core::MonotonicTimer;
/// use std::thread;
/// use std::time::Duration;
///
/// let timer = MonotonicTimer::new();
/// thread::sleep(Duration::from_millis(1));
/// assert!(timer.elapsed() >= Duration::from_millis(1));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTimer {
    start: Instant,
}

impl MonotonicTimer {
    /// Create a new timer starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since creation
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in fractional milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Whole seconds elapsed, rounded down
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed().as_secs()
    }
}

impl Default for MonotonicTimer {
    fn default() -> Self {
        Self::new()
    }
}
