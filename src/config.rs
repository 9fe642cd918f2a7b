//! Limiter configuration.
//!
//! Deserializes from the camelCase JSON the configuration layer supplies;
//! missing keys take the defaults below. Durations are whole seconds.

use crate::limits::LimitTable;
use crate::LimiterError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 1 MiB/s.
pub const DEFAULT_LIMIT: u64 = 1024 * 1024;
/// Burst capacity as a multiple of the default limit when none is configured.
pub const DEFAULT_BURST_MULTIPLIER: u64 = 10;
pub const DEFAULT_BUCKET_MAX_AGE_SECS: u64 = 3_600;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 60;

/// Limits, eviction, and persistence settings.
///
/// # Examples
/// ```
/// use bytebucket::LimiterConfig;
/// let config: LimiterConfig = serde_json::from_str(
///     r#"{ "defaultLimit": 1000, "backendLimits": { "api": 2000 } }"#,
/// ).unwrap();
/// assert_eq!(config.burst_capacity(), 10_000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterConfig {
    /// Bytes per second for identities with no override.
    pub default_limit: u64,
    /// Overrides keyed by backend identity.
    pub backend_limits: HashMap<String, u64>,
    /// Overrides keyed by client identity; these beat backend overrides.
    pub client_limits: HashMap<String, u64>,
    /// Maximum tokens per bucket. `None` means 10x the default limit.
    pub burst_size: Option<u64>,
    /// Seconds a bucket may sit unused before eviction.
    pub bucket_max_age: u64,
    /// Seconds between eviction sweeps.
    pub cleanup_interval: u64,
    /// Snapshot file. `None` or an empty path disables persistence.
    pub persistence_file: Option<PathBuf>,
    /// Seconds between periodic snapshots.
    pub save_interval: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            backend_limits: HashMap::new(),
            client_limits: HashMap::new(),
            burst_size: None,
            bucket_max_age: DEFAULT_BUCKET_MAX_AGE_SECS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_SECS,
            persistence_file: None,
            save_interval: DEFAULT_SAVE_INTERVAL_SECS,
        }
    }
}

impl LimiterConfig {
    pub fn with_default_limit(mut self, limit: u64) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_backend_limit(mut self, backend: impl Into<String>, limit: u64) -> Self {
        self.backend_limits.insert(backend.into(), limit);
        self
    }

    pub fn with_client_limit(mut self, client: impl Into<String>, limit: u64) -> Self {
        self.client_limits.insert(client.into(), limit);
        self
    }

    pub fn with_burst_size(mut self, burst: u64) -> Self {
        self.burst_size = Some(burst);
        self
    }

    pub fn with_bucket_max_age(mut self, max_age: Duration) -> Self {
        self.bucket_max_age = max_age.as_secs();
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval.as_secs();
        self
    }

    pub fn with_persistence_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_file = Some(path.into());
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval.as_secs();
        self
    }

    /// Reject zero limits, zero burst, and zero intervals.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.default_limit == 0 {
            return Err(LimiterError::must_be_positive("defaultLimit"));
        }
        if let Some(backend) = self.backend_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(LimiterError::InvalidConfiguration {
                field: "backendLimits",
                reason: format!("limit for backend `{}` must be greater than 0", backend.0),
            });
        }
        if let Some(client) = self.client_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(LimiterError::InvalidConfiguration {
                field: "clientLimits",
                reason: format!("limit for client `{}` must be greater than 0", client.0),
            });
        }
        if self.burst_size == Some(0) {
            return Err(LimiterError::must_be_positive("burstSize"));
        }
        if self.bucket_max_age == 0 {
            return Err(LimiterError::must_be_positive("bucketMaxAge"));
        }
        if self.cleanup_interval == 0 {
            return Err(LimiterError::must_be_positive("cleanupInterval"));
        }
        if self.persistence_path().is_some() && self.save_interval == 0 {
            return Err(LimiterError::must_be_positive("saveInterval"));
        }
        Ok(())
    }

    /// Configured burst, or 10x the default limit.
    pub fn burst_capacity(&self) -> u64 {
        self.burst_size
            .unwrap_or_else(|| self.default_limit.saturating_mul(DEFAULT_BURST_MULTIPLIER))
    }

    /// The snapshot path, if persistence is enabled.
    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence_file.as_deref().filter(|path| !path.as_os_str().is_empty())
    }

    pub fn bucket_max_age(&self) -> Duration {
        Duration::from_secs(self.bucket_max_age)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval)
    }

    /// The limit portion of the config.
    pub fn limit_table(&self) -> LimitTable {
        LimitTable {
            default_limit: self.default_limit,
            backend_limits: self.backend_limits.clone(),
            client_limits: self.client_limits.clone(),
        }
    }
}
