//! Token bucket over a byte budget.
//!
//! Refill happens on access: every spend first credits the tokens earned since
//! the previous refill, so there is no per-bucket timer. Refill uses integer
//! nanosecond arithmetic and rounds down, so a bucket never over-grants.
//!
//! Invariants (observable after every refill):
//! - `0 <= tokens <= capacity`
//! - `rate > 0` and `capacity > 0`
//! - a spend is all-or-nothing

use crate::clock::{Clock, SystemClock};
use crate::LimiterError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Point-in-time copy of a bucket's numeric state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Bytes currently spendable.
    pub tokens: u64,
    /// Bytes per second replenished.
    pub rate: u64,
    /// Maximum tokens the bucket can hold.
    pub capacity: u64,
    /// Wall-clock nanoseconds since the epoch of the last refill.
    pub last_refill_nanos: u64,
}

impl BucketSnapshot {
    fn validate(&self) -> Result<(), LimiterError> {
        if self.rate == 0 {
            return Err(LimiterError::must_be_positive("rate"));
        }
        if self.capacity == 0 {
            return Err(LimiterError::must_be_positive("capacity"));
        }
        Ok(())
    }

    /// Credit tokens earned up to `now`.
    ///
    /// `last_refill_nanos` only advances by the time the whole tokens account
    /// for (rounded up), so fractional progress carries into the next refill.
    fn refill(&mut self, now: u64) {
        if now < self.last_refill_nanos || self.tokens >= self.capacity {
            // clock stepped backwards, or nothing to credit
            self.tokens = self.tokens.min(self.capacity);
            self.last_refill_nanos = now;
            return;
        }

        let elapsed = u128::from(now - self.last_refill_nanos);
        let rate = u128::from(self.rate);
        let earned = elapsed * rate / NANOS_PER_SEC;
        let missing = u128::from(self.capacity - self.tokens);

        if earned >= missing {
            self.tokens = self.capacity;
            self.last_refill_nanos = now;
        } else {
            // earned < missing <= u64::MAX
            self.tokens += earned as u64;
            let accounted = (earned * NANOS_PER_SEC).div_ceil(rate);
            // accounted <= elapsed because earned was rounded down
            self.last_refill_nanos += accounted as u64;
        }
    }
}

/// A byte-budget token bucket.
///
/// All mutation is serialized by a per-bucket mutex; distinct buckets never
/// contend.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketSnapshot>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket using the system clock.
    ///
    /// # Examples
    /// ```
    /// use bytebucket::TokenBucket;
    /// let bucket = TokenBucket::new(1_000, 2_000).unwrap();
    /// assert!(bucket.try_spend(2_000));
    /// assert!(!bucket.try_spend(1));
    /// ```
    pub fn new(rate: u64, capacity: u64) -> Result<Self, LimiterError> {
        Self::with_clock(rate, capacity, Arc::new(SystemClock))
    }

    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(
        rate: u64,
        capacity: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LimiterError> {
        let state = BucketSnapshot {
            tokens: capacity,
            rate,
            capacity,
            last_refill_nanos: clock.now_nanos(),
        };
        state.validate()?;
        Ok(Self { state: Mutex::new(state), clock })
    }

    /// Rebuild a bucket from persisted state, verbatim.
    pub fn from_snapshot(
        snapshot: BucketSnapshot,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LimiterError> {
        snapshot.validate()?;
        let state = BucketSnapshot { tokens: snapshot.tokens.min(snapshot.capacity), ..snapshot };
        Ok(Self { state: Mutex::new(state), clock })
    }

    /// Refill, then spend `amount` tokens if all of them are available.
    ///
    /// Returns `false` and leaves the balance untouched when the bucket holds
    /// fewer than `amount` tokens. An `amount` above capacity can never succeed.
    pub fn try_spend(&self, amount: u64) -> bool {
        let now = self.clock.now_nanos();
        let mut state = self.lock();
        state.refill(now);
        if state.tokens >= amount {
            state.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Read the current state without refilling.
    pub fn snapshot(&self) -> BucketSnapshot {
        *self.lock()
    }

    /// Replace all four fields, including rate and capacity.
    ///
    /// Tokens above the new capacity are clamped.
    pub fn restore(&self, snapshot: BucketSnapshot) -> Result<(), LimiterError> {
        snapshot.validate()?;
        let mut state = self.lock();
        *state = BucketSnapshot { tokens: snapshot.tokens.min(snapshot.capacity), ..snapshot };
        Ok(())
    }

    pub fn rate(&self) -> u64 {
        self.lock().rate
    }

    pub fn capacity(&self) -> u64 {
        self.lock().capacity
    }

    // Bucket state is four integers; a panic mid-update cannot leave it
    // structurally broken, so a poisoned lock is safe to keep using.
    fn lock(&self) -> MutexGuard<'_, BucketSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000_000_000;

    fn manual_bucket(rate: u64, capacity: u64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::starting_at(T0);
        let bucket = TokenBucket::with_clock(rate, capacity, Arc::new(clock.clone()))
            .expect("valid bucket");
        (bucket, clock)
    }

    #[test]
    fn rejects_zero_rate_and_capacity() {
        let err = TokenBucket::new(0, 10).expect_err("zero rate is invalid");
        assert!(matches!(err, LimiterError::InvalidConfiguration { field: "rate", .. }));
        let err = TokenBucket::new(10, 0).expect_err("zero capacity is invalid");
        assert!(matches!(err, LimiterError::InvalidConfiguration { field: "capacity", .. }));
    }

    #[test]
    fn starts_full_then_denies() {
        let (bucket, _clock) = manual_bucket(1_000, 2_000);
        assert!(bucket.try_spend(2_000));
        assert!(!bucket.try_spend(1));
        assert_eq!(bucket.snapshot().tokens, 0);
    }

    #[test]
    fn denial_leaves_balance_untouched() {
        let (bucket, _clock) = manual_bucket(1_000, 2_000);
        assert!(bucket.try_spend(1_500));
        assert!(!bucket.try_spend(600));
        assert_eq!(bucket.snapshot().tokens, 500);
        assert!(bucket.try_spend(500));
    }

    #[test]
    fn refills_proportionally_and_clamps() {
        let (bucket, clock) = manual_bucket(1_000, 2_000);
        assert!(bucket.try_spend(2_000));
        assert!(!bucket.try_spend(100));

        clock.advance(Duration::from_millis(100));
        assert!(bucket.try_spend(50));
        assert_eq!(bucket.snapshot().tokens, 50);

        clock.advance(Duration::from_secs(3_600));
        assert!(!bucket.try_spend(2_001));
        assert_eq!(bucket.snapshot().tokens, 2_000);
    }

    #[test]
    fn fractional_tokens_carry_over() {
        // 3 bytes/s: each 100ms slice earns 0.3 tokens
        let (bucket, clock) = manual_bucket(3, 10);
        assert!(bucket.try_spend(10));
        for _ in 0..3 {
            clock.advance(Duration::from_millis(100));
            assert!(!bucket.try_spend(1));
        }
        clock.advance(Duration::from_millis(100));
        // 0.4s * 3 = 1.2 tokens
        assert!(bucket.try_spend(1));
        assert!(!bucket.try_spend(1));
    }

    #[test]
    fn never_over_grants_across_many_small_steps() {
        let (bucket, clock) = manual_bucket(7, 1_000);
        assert!(bucket.try_spend(1_000));
        let mut granted = 0;
        for _ in 0..1_000 {
            clock.advance(Duration::from_millis(13));
            if bucket.try_spend(1) {
                granted += 1;
            }
        }
        // 13s at 7 bytes/s is 91 tokens; rounding may only ever cost, never add
        assert!(granted <= 91, "over-granted: {granted}");
        assert!(granted >= 90, "lost more than rounding: {granted}");
    }

    #[test]
    fn clock_going_backwards_grants_nothing() {
        let (bucket, clock) = manual_bucket(1_000, 1_000);
        assert!(bucket.try_spend(1_000));
        clock.set(T0 - 5_000_000_000);
        assert!(!bucket.try_spend(1));
        clock.advance(Duration::from_millis(10));
        assert!(bucket.try_spend(10));
    }

    #[test]
    fn restore_replaces_everything() {
        let (bucket, clock) = manual_bucket(1_000, 2_000);
        let snapshot = BucketSnapshot {
            tokens: 500,
            rate: 250,
            capacity: 400,
            last_refill_nanos: clock.now_nanos(),
        };
        bucket.restore(snapshot).expect("valid snapshot");
        let state = bucket.snapshot();
        assert_eq!(state.rate, 250);
        assert_eq!(state.capacity, 400);
        assert_eq!(state.tokens, 400, "tokens clamp to restored capacity");
    }

    #[test]
    fn restore_rejects_invalid_snapshot() {
        let (bucket, _clock) = manual_bucket(1_000, 2_000);
        let bad = BucketSnapshot { tokens: 1, rate: 0, capacity: 10, last_refill_nanos: 0 };
        assert!(bucket.restore(bad).is_err());
        assert_eq!(bucket.rate(), 1_000, "failed restore leaves state alone");
    }

    #[test]
    fn wall_clock_refill() {
        let bucket = TokenBucket::new(1_000, 2_000).expect("valid bucket");
        assert!(bucket.try_spend(2_000));
        assert!(!bucket.try_spend(100));
        std::thread::sleep(Duration::from_millis(100));
        assert!(bucket.try_spend(50));
    }
}
