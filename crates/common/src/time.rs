//! Time sources.
//!
//! Consensus code needs two notions of time: a monotonic instant for timers
//! and elapsed-time budgets, and wall-clock Unix seconds for close times.
//! Both come from a [`Clock`] so tests can drive time explicitly with
//! [`ManualClock`].

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Returns the current Unix timestamp in seconds.
///
/// If the system clock is before the Unix epoch, returns 0.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic time for timers.
    fn now(&self) -> Instant;

    /// Wall-clock time in Unix seconds.
    fn unix_time(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> u64 {
        current_timestamp()
    }
}

/// A clock that only moves when told to.
///
/// Cloning shares the underlying time, so a test can hand one clone to the
/// component under test and advance the other.
///
/// ```rust
/// use std::time::Duration;
/// use lumen_common::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// let start = clock.now();
/// clock.advance(Duration::from_secs(5));
/// assert_eq!(clock.unix_time(), 1_005);
/// assert_eq!(clock.now() - start, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    base_instant: Instant,
    base_unix: u64,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new(unix_start: u64) -> Self {
        Self {
            base_instant: Instant::now(),
            base_unix: unix_start,
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + *self.offset.lock()
    }

    fn unix_time(&self) -> u64 {
        self.base_unix + self.offset.lock().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp_is_recent() {
        // 2024-01-01
        assert!(current_timestamp() > 1_704_067_200);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        other.advance(Duration::from_millis(2_500));
        assert_eq!(clock.unix_time(), 102);
        assert_eq!(clock.elapsed(), Duration::from_millis(2_500));
    }
}
