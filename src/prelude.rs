//! Convenient re-exports for common bytebucket types.
pub use crate::{
    bucket::{BucketSnapshot, TokenBucket},
    clock::{Clock, ManualClock, SystemClock},
    config::{
        LimiterConfig, DEFAULT_BUCKET_MAX_AGE_SECS, DEFAULT_BURST_MULTIPLIER,
        DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_LIMIT, DEFAULT_SAVE_INTERVAL_SECS,
    },
    limiter::{BucketHandle, RateLimiter, RateLimiterBuilder, DEFAULT_CHUNK_SIZE},
    limits::{bucket_key, LimitTable},
    telemetry::{LimiterEvent, PersistenceOp, TelemetrySink},
    LimiterError,
};
