//! Idle-bucket eviction.
//!
//! A sweep removes every entry whose last use is older than `max_age`. The
//! background loop sweeps once per interval until shutdown is signalled; it
//! does not sweep on the way out, since eviction only bounds memory.
//!
//! Evicting a bucket that still has traffic in its future is harmless: the
//! next lookup recreates it with the limits configured at that time.

use crate::clock::duration_to_nanos;
use crate::registry::BucketRegistry;
use crate::telemetry::{emit_best_effort, LimiterEvent, LogSink, TelemetrySink};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: usize,
    pub retained: usize,
}

/// Periodically prunes idle buckets from a registry.
#[derive(Debug, Clone)]
pub struct Evictor<S = LogSink> {
    registry: BucketRegistry,
    max_age: Duration,
    interval: Duration,
    sink: S,
}

impl Evictor<LogSink> {
    pub fn new(registry: BucketRegistry, max_age: Duration, interval: Duration) -> Self {
        Self { registry, max_age, interval, sink: LogSink }
    }
}

impl<S> Evictor<S> {
    /// Report sweeps to `sink` instead.
    pub fn with_sink<S2>(self, sink: S2) -> Evictor<S2> {
        Evictor { registry: self.registry, max_age: self.max_age, interval: self.interval, sink }
    }

    /// Remove every entry idle for longer than `max_age`.
    pub fn sweep(&self) -> EvictionReport {
        let now = self.registry.clock().now_nanos();
        // strictly older than the cutoff means idle for longer than max_age
        let cutoff = now.saturating_sub(duration_to_nanos(self.max_age));

        let mut removed = 0;
        self.registry.for_each(|entry| {
            if entry.last_used_nanos() < cutoff && self.registry.delete_if_idle(entry.key(), cutoff)
            {
                removed += 1;
            }
        });

        let report = EvictionReport { removed, retained: self.registry.count() };
        tracing::debug!(
            target: "bytebucket::evictor",
            removed = report.removed,
            retained = report.retained,
            "eviction sweep finished"
        );
        report
    }
}

impl<S> Evictor<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Sweep every `interval` until `shutdown` flips to `true` or its sender drops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep();
                    let event =
                        LimiterEvent::Evicted { removed: report.removed, retained: report.retained };
                    let sink = self.sink.clone();
                    emit_best_effort(sink, event).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(target: "bytebucket::evictor", "evictor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;
    use std::sync::Arc;

    const T0: u64 = 1_700_000_000_000_000_000;

    fn setup() -> (BucketRegistry, ManualClock) {
        let clock = ManualClock::starting_at(T0);
        (BucketRegistry::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn removes_exactly_the_idle_entries() {
        let (registry, clock) = setup();
        let max_age = Duration::from_secs(60);

        // ages at sweep time: 0s, 30s, 60s, 61s, 600s
        for (key, age) in [("fresh", 0u64), ("warm", 30), ("edge", 60), ("stale", 61), ("cold", 600)]
        {
            clock.set(T0 + 600_000_000_000 - age * 1_000_000_000);
            registry.get_or_create(key, 10, 10).unwrap();
        }
        clock.set(T0 + 600_000_000_000);

        let evictor = Evictor::new(registry.clone(), max_age, Duration::from_secs(1));
        let report = evictor.sweep();

        assert_eq!(report, EvictionReport { removed: 2, retained: 3 });
        for key in ["fresh", "warm", "edge"] {
            assert!(registry.get(key).is_some(), "{key} should survive");
        }
        for key in ["stale", "cold"] {
            assert!(registry.get(key).is_none(), "{key} should be evicted");
        }
    }

    #[test]
    fn empty_registry_is_not_an_error() {
        let (registry, _clock) = setup();
        let evictor = Evictor::new(registry, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(evictor.sweep(), EvictionReport { removed: 0, retained: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_on_each_tick_and_stops_on_shutdown() {
        let (registry, clock) = setup();
        registry.get_or_create("idle", 10, 10).unwrap();
        clock.advance(Duration::from_secs(120));

        let sink = MemorySink::new();
        let evictor =
            Evictor::new(registry.clone(), Duration::from_secs(60), Duration::from_secs(300))
                .with_sink(sink.clone());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(evictor.run(rx));

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(registry.is_empty());
        assert_eq!(sink.events(), vec![LimiterEvent::Evicted { removed: 1, retained: 0 }]);

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(sink.len(), 1, "no final sweep on shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_when_sender_dropped() {
        let (registry, _clock) = setup();
        let evictor = Evictor::new(registry, Duration::from_secs(60), Duration::from_secs(300));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(evictor.run(rx));
        drop(tx);
        task.await.unwrap();
    }
}
