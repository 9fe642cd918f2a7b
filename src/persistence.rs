//! Durable snapshots of the bucket registry.
//!
//! A snapshot is a pretty-printed JSON array of records sorted by key:
//!
//! ```json
//! [
//!   {
//!     "key": "10.0.0.1:api",
//!     "tokens": 500,
//!     "limit": 1000,
//!     "burstSize": 2000,
//!     "lastRefill": "2024-05-01T12:00:00.123456789Z",
//!     "lastUsed": "2024-05-01T12:00:00.123456789Z"
//!   }
//! ]
//! ```
//!
//! Writes go to a temp file in the target directory which is fsynced and then
//! renamed over the target, so readers never see a partial file. Each bucket
//! is read under its own lock while the sweep runs, so one snapshot may mix
//! state from slightly different instants across keys.

use crate::bucket::{BucketSnapshot, TokenBucket};
use crate::clock::{nanos_to_system_time, system_time_to_nanos};
use crate::registry::{BucketRegistry, RegistryEntry};
use crate::telemetry::{emit_best_effort, LimiterEvent, LogSink, PersistenceOp, TelemetrySink};
use crate::LimiterError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// One bucket as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedBucket {
    pub key: String,
    pub tokens: u64,
    pub limit: u64,
    pub burst_size: u64,
    pub last_refill: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl PersistedBucket {
    fn capture(entry: &RegistryEntry) -> Self {
        let (bucket, last_used) = entry.snapshot();
        Self {
            key: entry.key().to_owned(),
            tokens: bucket.tokens,
            limit: bucket.rate,
            burst_size: bucket.capacity,
            last_refill: nanos_to_system_time(bucket.last_refill_nanos).into(),
            last_used: nanos_to_system_time(last_used).into(),
        }
    }

    fn bucket_snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            tokens: self.tokens,
            rate: self.limit,
            capacity: self.burst_size,
            last_refill_nanos: system_time_to_nanos(self.last_refill.into()),
        }
    }

    fn last_used_nanos(&self) -> u64 {
        system_time_to_nanos(self.last_used.into())
    }
}

/// Reads and writes registry snapshots at a fixed path.
#[derive(Debug, Clone)]
pub struct PersistenceStore {
    path: Arc<PathBuf>,
}

impl PersistenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Arc::new(path.into()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every registry entry to disk atomically. Returns the entry count.
    pub fn save(&self, registry: &BucketRegistry) -> Result<usize, LimiterError> {
        let mut records = Vec::with_capacity(registry.count());
        registry.for_each(|entry| records.push(PersistedBucket::capture(entry)));
        records.sort_by(|a, b| a.key.cmp(&b.key));

        self.write_atomically(&records).map_err(|e| LimiterError::persistence(self.path(), e))?;

        tracing::info!(
            target: "bytebucket::persistence",
            entries = records.len(),
            path = %self.path.display(),
            "saved buckets"
        );
        Ok(records.len())
    }

    fn write_atomically(&self, records: &[PersistedBucket]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let temp = tempfile::Builder::new().prefix(".buckets").suffix(".tmp").tempfile_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, records)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(self.path.as_path()).map_err(|e| e.error)?;
        Ok(())
    }

    /// Restore a snapshot into `registry`, replacing entries with the same key.
    ///
    /// A missing file is a first run and loads nothing. Restoration is
    /// all-or-nothing: if any record is unreadable or has a zero limit or
    /// burst, nothing is inserted. Refill is not applied on load, so tokens
    /// come back exactly as saved.
    pub fn load(&self, registry: &BucketRegistry) -> Result<usize, LimiterError> {
        let contents = match std::fs::read(self.path.as_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    target: "bytebucket::persistence",
                    path = %self.path.display(),
                    "no snapshot yet"
                );
                return Ok(0);
            }
            Err(e) => return Err(LimiterError::persistence(self.path(), e)),
        };

        let records: Vec<PersistedBucket> =
            serde_json::from_slice(&contents).map_err(|e| self.corrupt(e.to_string()))?;

        let mut restored = Vec::with_capacity(records.len());
        for record in &records {
            let bucket =
                TokenBucket::from_snapshot(record.bucket_snapshot(), Arc::clone(registry.clock()))
                    .map_err(|e| self.corrupt(format!("record `{}`: {e}", record.key)))?;
            restored.push(RegistryEntry::new(&record.key, bucket, record.last_used_nanos()));
        }

        let loaded = restored.len();
        for entry in restored {
            registry.insert(entry);
        }

        tracing::info!(
            target: "bytebucket::persistence",
            entries = loaded,
            path = %self.path.display(),
            "loaded buckets"
        );
        Ok(loaded)
    }

    /// Run `load` on the blocking pool.
    pub async fn load_blocking(&self, registry: &BucketRegistry) -> Result<usize, LimiterError> {
        let store = self.clone();
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || store.load(&registry))
            .await
            .map_err(|e| LimiterError::persistence(self.path(), io::Error::other(e)))?
    }

    /// Run `save` on the blocking pool.
    pub async fn save_blocking(&self, registry: &BucketRegistry) -> Result<usize, LimiterError> {
        let store = self.clone();
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || store.save(&registry))
            .await
            .map_err(|e| LimiterError::persistence(self.path(), io::Error::other(e)))?
    }

    fn corrupt(&self, reason: String) -> LimiterError {
        LimiterError::CorruptPersistenceData { path: self.path.to_path_buf(), reason }
    }
}

/// Background task that snapshots the registry on an interval and once more
/// on shutdown.
#[derive(Debug, Clone)]
pub struct PersistenceTask<S = LogSink> {
    store: PersistenceStore,
    registry: BucketRegistry,
    interval: Duration,
    sink: S,
}

impl PersistenceTask<LogSink> {
    pub fn new(store: PersistenceStore, registry: BucketRegistry, interval: Duration) -> Self {
        Self { store, registry, interval, sink: LogSink }
    }
}

impl<S> PersistenceTask<S> {
    pub fn with_sink<S2>(self, sink: S2) -> PersistenceTask<S2> {
        PersistenceTask {
            store: self.store,
            registry: self.registry,
            interval: self.interval,
            sink,
        }
    }
}

impl<S> PersistenceTask<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Save every `interval`; when `shutdown` flips to `true` (or its sender
    /// drops) save one final time, then return.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self { store, registry, interval, sink } = self;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let sink = sink.clone();
                    save_and_report(&store, &registry, sink).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        save_and_report(&store, &registry, sink).await;
        tracing::debug!(target: "bytebucket::persistence", "persistence task stopped");
    }
}

async fn save_and_report<S>(store: &PersistenceStore, registry: &BucketRegistry, sink: S)
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    let event = match store.save_blocking(registry).await {
        Ok(entries) => LimiterEvent::Saved { entries },
        Err(e) => {
            tracing::warn!(
                target: "bytebucket::persistence",
                error = %e,
                "failed to save buckets; retrying next interval"
            );
            LimiterEvent::PersistenceFailed { operation: PersistenceOp::Save, error: e.to_string() }
        }
    };
    emit_best_effort(sink, event).await;
}
