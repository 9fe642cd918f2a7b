use std::fmt;

/// Which persistence operation an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceOp {
    Save,
    Load,
}

/// Events emitted by the evictor and the persistence task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// An eviction sweep finished.
    Evicted {
        /// Entries removed for being idle past the threshold
        removed: usize,
        /// Entries still registered after the sweep
        retained: usize,
    },
    /// A snapshot was written.
    Saved {
        /// Number of buckets in the snapshot
        entries: usize,
    },
    /// A snapshot was restored at startup.
    Loaded {
        /// Number of buckets restored
        entries: usize,
    },
    /// A save or load failed; the limiter keeps running.
    PersistenceFailed {
        operation: PersistenceOp,
        /// Rendered error
        error: String,
    },
}

impl fmt::Display for PersistenceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceOp::Save => write!(f, "save"),
            PersistenceOp::Load => write!(f, "load"),
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Evicted { removed, retained } => {
                write!(f, "Evicted(removed={}, retained={})", removed, retained)
            }
            LimiterEvent::Saved { entries } => write!(f, "Saved(entries={})", entries),
            LimiterEvent::Loaded { entries } => write!(f, "Loaded(entries={})", entries),
            LimiterEvent::PersistenceFailed { operation, error } => {
                write!(f, "PersistenceFailed({}: {})", operation, error)
            }
        }
    }
}
