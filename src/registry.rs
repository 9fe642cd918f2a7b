//! Concurrent registry of token buckets keyed by identity.
//!
//! Lookups and inserts go through `DashMap`'s sharded locks, so unrelated keys
//! do not serialize on one global lock. Entries are handed out as `Arc`s; a
//! caller may keep spending on an entry after it has been evicted.

use crate::bucket::{BucketSnapshot, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::LimiterError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One bucket plus the bookkeeping the evictor and persistence need.
#[derive(Debug)]
pub struct RegistryEntry {
    key: String,
    bucket: TokenBucket,
    last_used_nanos: AtomicU64,
}

impl RegistryEntry {
    pub fn new(key: impl Into<String>, bucket: TokenBucket, last_used_nanos: u64) -> Self {
        Self { key: key.into(), bucket, last_used_nanos: AtomicU64::new(last_used_nanos) }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Nanoseconds since the epoch of the last lookup for this key.
    pub fn last_used_nanos(&self) -> u64 {
        self.last_used_nanos.load(Ordering::Acquire)
    }

    /// Record a lookup at `now`.
    ///
    /// The timestamp is the call time even if the wall clock stepped back, so
    /// an entry touched after a clock step may look older to the evictor.
    pub fn touch(&self, now: u64) {
        self.last_used_nanos.store(now, Ordering::Release);
    }

    /// Bucket state plus the last-used timestamp.
    pub fn snapshot(&self) -> (BucketSnapshot, u64) {
        (self.bucket.snapshot(), self.last_used_nanos())
    }
}

/// Shared, cloneable handle to the bucket map.
///
/// Clones observe the same entries.
#[derive(Debug, Clone)]
pub struct BucketRegistry {
    entries: Arc<DashMap<String, Arc<RegistryEntry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Registry whose buckets and timestamps read from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(DashMap::new()), clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Return the entry for `key`, creating a full bucket if absent.
    ///
    /// Concurrent callers racing on an absent key converge on one entry: the
    /// first insert wins and the other candidates are dropped. The returned
    /// entry's last-used time is refreshed either way. Fails only when a new
    /// bucket would have a zero rate or capacity.
    pub fn get_or_create(
        &self,
        key: &str,
        rate: u64,
        capacity: u64,
    ) -> Result<Arc<RegistryEntry>, LimiterError> {
        let now = self.clock.now_nanos();

        // fast path; the shard guard is released before touching
        let existing = self.entries.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(entry) = existing {
            entry.touch(now);
            return Ok(entry);
        }

        let candidate = TokenBucket::with_clock(rate, capacity, Arc::clone(&self.clock))?;
        let entry = Arc::clone(
            self.entries
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(RegistryEntry::new(key, candidate, now)))
                .value(),
        );
        entry.touch(now);
        Ok(entry)
    }

    /// Look up an entry without creating or touching it.
    pub fn get(&self, key: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert `entry`, replacing any entry under the same key.
    pub fn insert(&self, entry: RegistryEntry) {
        self.entries.insert(entry.key.clone(), Arc::new(entry));
    }

    /// Visit every entry present when the sweep starts.
    ///
    /// Entries are collected first and visited without holding any map lock,
    /// so the visitor may delete entries or run alongside request traffic.
    /// Each entry is observed as of when it is visited.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&RegistryEntry),
    {
        let entries: Vec<Arc<RegistryEntry>> =
            self.entries.iter().map(|entry| Arc::clone(entry.value())).collect();
        for entry in &entries {
            visitor(entry);
        }
    }

    /// Remove `key` if present. Returns whether something was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove `key` only if it has not been used since `cutoff_nanos`.
    ///
    /// The idle check and removal happen under the key's shard lock, so a
    /// lookup that refreshes the entry in between keeps it alive.
    pub fn delete_if_idle(&self, key: &str, cutoff_nanos: u64) -> bool {
        self.entries.remove_if(key, |_, entry| entry.last_used_nanos() < cutoff_nanos).is_some()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;
    use std::time::Duration;

    fn manual_registry() -> (BucketRegistry, ManualClock) {
        let clock = ManualClock::starting_at(1_000_000_000);
        (BucketRegistry::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn get_or_create_returns_existing_entry() {
        let (registry, clock) = manual_registry();
        let first = registry.get_or_create("1.1.1.1:api", 1_000, 2_000).unwrap();
        assert!(first.bucket().try_spend(1_500));

        clock.advance(Duration::from_secs(5));
        // different parameters do not replace a live bucket
        let second = registry.get_or_create("1.1.1.1:api", 9_999, 9_999).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.bucket().rate(), 1_000);
        assert_eq!(second.last_used_nanos(), clock.now_nanos());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn invalid_parameters_do_not_insert() {
        let (registry, _clock) = manual_registry();
        let err = registry.get_or_create("k", 0, 10).expect_err("zero rate");
        assert!(err.is_invalid_configuration());
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_creation_converges_on_one_entry() {
        let registry = BucketRegistry::new();
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("shared", 1_000, 1_000).unwrap()
                })
            })
            .collect();

        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(registry.count(), 1);
        for entry in &entries {
            assert!(Arc::ptr_eq(entry, &entries[0]));
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let (registry, _clock) = manual_registry();
        registry.get_or_create("k", 10, 10).unwrap();
        assert!(registry.delete("k"));
        assert!(!registry.delete("k"));
        assert!(registry.get("k").is_none());
    }

    #[test]
    fn for_each_tolerates_deletion_during_visit() {
        let (registry, _clock) = manual_registry();
        for i in 0..10 {
            registry.get_or_create(&format!("k{i}"), 10, 10).unwrap();
        }
        let mut visited = 0;
        registry.for_each(|entry| {
            visited += 1;
            registry.delete(entry.key());
        });
        assert_eq!(visited, 10);
        assert!(registry.is_empty());
    }

    #[test]
    fn delete_if_idle_spares_recently_touched_entries() {
        let (registry, clock) = manual_registry();
        let entry = registry.get_or_create("k", 10, 10).unwrap();
        let cutoff = clock.now_nanos() + 1;

        clock.advance(Duration::from_secs(1));
        registry.get_or_create("k", 10, 10).unwrap();
        assert!(!registry.delete_if_idle("k", cutoff));
        assert!(registry.get("k").is_some());

        assert!(registry.delete_if_idle("k", clock.now_nanos() + 1));
        // evicted entries keep working for whoever still holds them
        assert!(entry.bucket().try_spend(1));
    }

    #[test]
    fn lookup_records_call_time_even_after_clock_steps_back() {
        let (registry, clock) = manual_registry();
        let start = clock.now_nanos();
        registry.get_or_create("k", 10, 10).unwrap();

        clock.set(start - 500);
        let entry = registry.get_or_create("k", 10, 10).unwrap();
        assert_eq!(entry.last_used_nanos(), start - 500);
    }

    #[test]
    fn insert_overwrites() {
        let (registry, clock) = manual_registry();
        registry.get_or_create("k", 10, 10).unwrap();
        let bucket = TokenBucket::with_clock(99, 100, Arc::new(clock.clone())).unwrap();
        registry.insert(RegistryEntry::new("k", bucket, 7));
        let entry = registry.get("k").unwrap();
        assert_eq!(entry.bucket().rate(), 99);
        assert_eq!(entry.last_used_nanos(), 7);
    }
}
