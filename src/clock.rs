//! Clock abstractions used by token buckets, the registry, and the evictor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so refill and idle timing can be faked in tests.
///
/// Readings are wall-clock nanoseconds since the Unix epoch. Bucket state is
/// persisted and restored across restarts, so a process-local monotonic origin
/// would not survive; callers must tolerate the clock stepping backwards.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_nanos(&self) -> u64;
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        system_time_to_nanos(SystemTime::now())
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the clock at `nanos` since the epoch.
    pub fn starting_at(nanos: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(nanos)) }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_to_nanos(by), Ordering::SeqCst);
    }

    pub fn set(&self, nanos: u64) {
        self.now.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Saturating conversion; instants before the epoch map to zero.
pub(crate) fn system_time_to_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(duration_to_nanos).unwrap_or(0)
}

pub(crate) fn nanos_to_system_time(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at(1_000);
        let other = clock.clone();
        clock.advance(Duration::from_nanos(500));
        assert_eq!(other.now_nanos(), 1_500);
        other.set(42);
        assert_eq!(clock.now_nanos(), 42);
    }

    #[test]
    fn pre_epoch_times_saturate_to_zero() {
        let before = UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(system_time_to_nanos(before), 0);
    }

    #[test]
    fn system_clock_is_past_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_nanos() > 1_577_836_800 * 1_000_000_000);
    }
}
