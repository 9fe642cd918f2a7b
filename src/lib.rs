#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bytebucket
//!
//! Per-client, per-backend bandwidth limiting with token buckets.
//!
//! Every `(client, backend)` pair gets its own bucket that refills at a
//! configured number of bytes per second and holds at most a burst's worth of
//! tokens. Callers ask the limiter to admit a transfer; the call returns once
//! every byte has been paid for, waiting as long as the bucket requires.
//!
//! ## Features
//!
//! - **Layered limits**: client override, then backend override, then default
//! - **Lazy bucket creation** on first use, shared between concurrent callers
//! - **Idle eviction** of buckets nobody has used for a while
//! - **Snapshot persistence** so bucket state survives restarts
//! - **Injectable clock and sleeper** for deterministic tests
//!
//! ## Quick Start
//!
//! ```rust
//! use bytebucket::{LimiterConfig, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bytebucket::LimiterError> {
//!     let config = LimiterConfig::default()
//!         .with_default_limit(64 * 1024)
//!         .with_backend_limit("uploads", 16 * 1024);
//!
//!     let limiter = RateLimiter::builder(config).start().await?;
//!     limiter.admit("10.0.0.7", "uploads", 4096).await?;
//!     limiter.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod evictor;
pub mod limiter;
pub mod limits;
pub mod persistence;
pub mod prelude;
pub mod registry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use bucket::{BucketSnapshot, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LimiterConfig;
pub use error::LimiterError;
pub use evictor::{EvictionReport, Evictor};
pub use limiter::{BucketHandle, RateLimiter, RateLimiterBuilder};
pub use limits::{bucket_key, LimitTable, LiveLimits, DEFAULT_BACKEND};
pub use persistence::{PersistedBucket, PersistenceStore, PersistenceTask};
pub use registry::{BucketRegistry, RegistryEntry};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink};
