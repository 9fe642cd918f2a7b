//! The rate limiter facade.
//!
//! Semantics:
//! - A bucket is keyed by `client:backend` and created on first use with the
//!   limit resolved at that moment (client override, else backend override,
//!   else default) and the configured burst capacity.
//! - `admit` spends the requested bytes in chunks, sleeping a fixed retry
//!   interval whenever a chunk is denied. It is the only place the limiter
//!   waits, and it never waits while holding a bucket lock.
//! - Updating the limit table does not touch live buckets; a bucket picks up
//!   new limits once it is evicted and recreated.
//! - `shutdown` stops the evictor, runs one final save, and joins both
//!   background tasks. In-flight admits are left to finish on their own.
//!
//! Example
//! ```rust
//! use bytebucket::{LimiterConfig, RateLimiter};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), bytebucket::LimiterError> {
//! let config = LimiterConfig::default()
//!     .with_default_limit(64 * 1024)
//!     .with_client_limit("10.0.0.9", 8 * 1024);
//! let limiter = RateLimiter::builder(config).start().await?;
//!
//! assert_eq!(limiter.resolve_limit("10.0.0.9", "api"), 8 * 1024);
//! limiter.admit("10.0.0.1", "api", 16 * 1024).await?;
//!
//! limiter.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::evictor::Evictor;
use crate::limits::{bucket_key, LimitTable, LiveLimits};
use crate::persistence::{PersistenceStore, PersistenceTask};
use crate::registry::{BucketRegistry, RegistryEntry};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, LimiterEvent, LogSink, PersistenceOp, TelemetrySink};
use crate::LimiterError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Largest slice of a request spent in one attempt.
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;
/// Pause between denied attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder<S = LogSink> {
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    chunk_size: u64,
    retry_interval: Duration,
    sink: S,
}

impl<S> std::fmt::Debug for RateLimiterBuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("sleeper", &self.sleeper)
            .field("chunk_size", &self.chunk_size)
            .field("retry_interval", &self.retry_interval)
            .field("sink", &"<sink>")
            .finish()
    }
}

impl RateLimiterBuilder<LogSink> {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            sink: LogSink,
        }
    }
}

impl<S> RateLimiterBuilder<S> {
    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override how the admit loop pauses between denied attempts.
    pub fn sleeper<T: Sleeper + 'static>(mut self, sleeper: T) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Largest number of bytes spent per attempt. Zero is treated as one.
    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Report background activity to `sink`.
    pub fn with_sink<S2>(self, sink: S2) -> RateLimiterBuilder<S2> {
        RateLimiterBuilder {
            config: self.config,
            clock: self.clock,
            sleeper: self.sleeper,
            chunk_size: self.chunk_size,
            retry_interval: self.retry_interval,
            sink,
        }
    }
}

impl<S> RateLimiterBuilder<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Validate the config, restore any snapshot, and spawn the background
    /// tasks. Must be called from within a tokio runtime.
    ///
    /// The snapshot is read on the blocking pool. One that cannot be read is
    /// logged and skipped; the limiter starts with an empty registry instead
    /// of failing.
    pub async fn start(self) -> Result<RateLimiter, LimiterError> {
        let config = self.config;
        config.validate()?;

        let registry = BucketRegistry::with_clock(self.clock);
        let store = config.persistence_path().map(PersistenceStore::new);

        if let Some(store) = &store {
            let event = match store.load_blocking(&registry).await {
                Ok(entries) => LimiterEvent::Loaded { entries },
                Err(e) => {
                    tracing::warn!(
                        target: "bytebucket::limiter",
                        error = %e,
                        "failed to load persisted buckets; starting empty"
                    );
                    LimiterEvent::PersistenceFailed {
                        operation: PersistenceOp::Load,
                        error: e.to_string(),
                    }
                }
            };
            emit_best_effort(self.sink.clone(), event).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(2);

        let evictor =
            Evictor::new(registry.clone(), config.bucket_max_age(), config.cleanup_interval())
                .with_sink(self.sink.clone());
        tasks.push(tokio::spawn(evictor.run(shutdown_rx.clone())));

        if let Some(store) = &store {
            let task = PersistenceTask::new(store.clone(), registry.clone(), config.save_interval())
                .with_sink(self.sink.clone());
            tasks.push(tokio::spawn(task.run(shutdown_rx)));
        }

        tracing::debug!(
            target: "bytebucket::limiter",
            default_limit = config.default_limit,
            burst = config.burst_capacity(),
            persistence = store.is_some(),
            "rate limiter started"
        );

        Ok(RateLimiter {
            limits: LiveLimits::new(config.limit_table()),
            burst_capacity: config.burst_capacity(),
            registry,
            persistence_enabled: store.is_some(),
            sleeper: self.sleeper,
            chunk_size: self.chunk_size,
            retry_interval: self.retry_interval,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Per-identity byte throttling over a shared bucket registry.
pub struct RateLimiter {
    limits: LiveLimits,
    burst_capacity: u64,
    registry: BucketRegistry,
    persistence_enabled: bool,
    sleeper: Arc<dyn Sleeper>,
    chunk_size: u64,
    retry_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("burst_capacity", &self.burst_capacity)
            .field("buckets", &self.registry.count())
            .field("persistence_enabled", &self.persistence_enabled)
            .field("chunk_size", &self.chunk_size)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl RateLimiter {
    pub fn builder(config: LimiterConfig) -> RateLimiterBuilder {
        RateLimiterBuilder::new(config)
    }

    /// Bytes per second for this identity under the current limit table.
    pub fn resolve_limit(&self, client: &str, backend: &str) -> u64 {
        self.limits.resolve(client, backend)
    }

    /// Get (or create) the bucket for this identity and refresh its last use.
    pub fn handle(&self, client: &str, backend: &str) -> Result<BucketHandle, LimiterError> {
        let rate = self.resolve_limit(client, backend);
        let key = bucket_key(client, backend);
        let entry = self.registry.get_or_create(&key, rate, self.burst_capacity)?;
        Ok(BucketHandle {
            entry,
            sleeper: Arc::clone(&self.sleeper),
            chunk_size: self.chunk_size,
            retry_interval: self.retry_interval,
        })
    }

    /// Wait until `bytes` have been granted to this identity.
    pub async fn admit(&self, client: &str, backend: &str, bytes: u64) -> Result<(), LimiterError> {
        self.handle(client, backend)?.admit(bytes).await;
        Ok(())
    }

    /// Swap in new limits for buckets created from now on.
    pub fn update_limits(&self, table: LimitTable) -> Result<(), LimiterError> {
        if table.default_limit == 0 {
            return Err(LimiterError::must_be_positive("defaultLimit"));
        }
        if table.backend_limits.values().chain(table.client_limits.values()).any(|l| *l == 0) {
            return Err(LimiterError::InvalidConfiguration {
                field: "limits",
                reason: "override limits must be greater than 0".into(),
            });
        }
        self.limits.set(table);
        Ok(())
    }

    pub fn limits(&self) -> Arc<LimitTable> {
        self.limits.get()
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    pub fn bucket_count(&self) -> usize {
        self.registry.count()
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence_enabled
    }

    /// Stop background work, save once more, and wait for both tasks.
    ///
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(target: "bytebucket::limiter", error = %e, "background task failed");
            }
        }
        tracing::debug!(target: "bytebucket::limiter", "rate limiter stopped");
    }
}

/// A resolved bucket for one identity.
///
/// Hold one per response and call [`admit`](Self::admit) for each write, so
/// the limit is resolved once.
#[derive(Clone)]
pub struct BucketHandle {
    entry: Arc<RegistryEntry>,
    sleeper: Arc<dyn Sleeper>,
    chunk_size: u64,
    retry_interval: Duration,
}

impl std::fmt::Debug for BucketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketHandle")
            .field("key", &self.entry.key())
            .field("chunk_size", &self.chunk_size)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl BucketHandle {
    pub fn key(&self) -> &str {
        self.entry.key()
    }

    pub fn entry(&self) -> &Arc<RegistryEntry> {
        &self.entry
    }

    /// Spend `bytes` chunk by chunk, sleeping between denied attempts.
    ///
    /// Chunks are capped at the bucket's capacity so every chunk is
    /// eventually grantable. Never grants more than `bytes` in total.
    pub async fn admit(&self, bytes: u64) {
        let bucket = self.entry.bucket();
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.chunk_size).min(bucket.capacity());
            while !bucket.try_spend(chunk) {
                self.sleeper.sleep(self.retry_interval).await;
            }
            remaining -= chunk;
        }
    }
}
