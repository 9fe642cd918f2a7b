//! Error types for the limiter core
use std::io;
use std::path::PathBuf;

/// Everything that can go wrong in bucket construction and persistence.
///
/// None of these are fatal to a running process: configuration errors fail the
/// call that attempted construction, persistence errors are logged by the
/// background tasks and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// A rate, capacity, interval, or override was zero.
    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },

    /// Filesystem failure while writing a snapshot.
    #[error("failed to persist buckets to {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The snapshot on disk could not be parsed or held impossible values.
    #[error("corrupt bucket snapshot at {}: {reason}", path.display())]
    CorruptPersistenceData { path: PathBuf, reason: String },
}

impl LimiterError {
    pub(crate) fn must_be_positive(field: &'static str) -> Self {
        LimiterError::InvalidConfiguration { field, reason: "must be greater than 0".into() }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LimiterError::Persistence { path: path.into(), source }
    }

    /// Check if this error came from bad configuration
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }

    /// Check if this error came from a failed write
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }

    /// Check if this error came from an unreadable snapshot
    pub fn is_corrupt_data(&self) -> bool {
        matches!(self, Self::CorruptPersistenceData { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn invalid_configuration_display_names_field() {
        let err = LimiterError::must_be_positive("capacity");
        let msg = err.to_string();
        assert!(msg.contains("capacity"));
        assert!(msg.contains("greater than 0"));
        assert!(err.is_invalid_configuration());
        assert!(!err.is_persistence());
    }

    #[test]
    fn persistence_error_exposes_io_source() {
        let err = LimiterError::persistence(
            "/var/lib/buckets.json",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/var/lib/buckets.json"));
        assert!(err.is_persistence());
        let source = err.source().expect("io source");
        assert_eq!(source.to_string(), "denied");
    }

    #[test]
    fn corrupt_data_has_no_source() {
        let err = LimiterError::CorruptPersistenceData {
            path: PathBuf::from("state.json"),
            reason: "expected value at line 1 column 1".into(),
        };
        assert!(err.is_corrupt_data());
        assert!(err.source().is_none());
        assert!(err.to_string().contains("line 1"));
    }
}
