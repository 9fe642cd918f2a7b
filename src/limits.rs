//! Limit resolution and identity keys.
//!
//! `LiveLimits` gives lock-free reads of the current [`LimitTable`] via
//! `ArcSwap`; a swap only affects buckets created afterwards.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Backend name used when the caller has none.
pub const DEFAULT_BACKEND: &str = "default";

/// Compose the registry key for a client talking to a backend.
///
/// ```
/// assert_eq!(bytebucket::bucket_key("10.0.0.1", "api"), "10.0.0.1:api");
/// assert_eq!(bytebucket::bucket_key("10.0.0.1", ""), "10.0.0.1:default");
/// ```
pub fn bucket_key(client: &str, backend: &str) -> String {
    format!("{client}:{}", backend_or_default(backend))
}

fn backend_or_default(backend: &str) -> &str {
    if backend.is_empty() {
        DEFAULT_BACKEND
    } else {
        backend
    }
}

/// Bytes-per-second limits: a default plus per-backend and per-client overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitTable {
    pub default_limit: u64,
    pub backend_limits: HashMap<String, u64>,
    pub client_limits: HashMap<String, u64>,
}

impl LimitTable {
    pub fn new(default_limit: u64) -> Self {
        Self { default_limit, backend_limits: HashMap::new(), client_limits: HashMap::new() }
    }

    /// Client override, else backend override, else the default.
    ///
    /// An empty backend is looked up as [`DEFAULT_BACKEND`].
    pub fn resolve(&self, client: &str, backend: &str) -> u64 {
        self.client_limits
            .get(client)
            .or_else(|| self.backend_limits.get(backend_or_default(backend)))
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Shared, swappable limit table.
#[derive(Debug, Clone)]
pub struct LiveLimits {
    inner: Arc<ArcSwap<LimitTable>>,
}

impl LiveLimits {
    pub fn new(table: LimitTable) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(table)) }
    }

    /// Snapshot the current table (cheap clone of Arc).
    pub fn get(&self) -> Arc<LimitTable> {
        self.inner.load_full()
    }

    pub fn set(&self, table: LimitTable) {
        self.inner.store(Arc::new(table));
    }

    pub fn resolve(&self, client: &str, backend: &str) -> u64 {
        self.inner.load().resolve(client, backend)
    }
}
