//! Telemetry for the limiter's background work.
//!
//! The evictor and the persistence task report what they did as
//! [`LimiterEvent`]s. Events flow through a [`TelemetrySink`], which is just a
//! `tower::Service<LimiterEvent>`, so sinks compose with standard tower
//! combinators.
//!
//! ```rust
//! use bytebucket::telemetry::{LimiterEvent, MemorySink, emit_best_effort};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = MemorySink::new();
//! emit_best_effort(sink.clone(), LimiterEvent::Saved { entries: 3 }).await;
//! assert_eq!(sink.events(), vec![LimiterEvent::Saved { entries: 3 }]);
//! # }
//! ```

mod events;
mod sinks;

pub use events::{LimiterEvent, PersistenceOp};
pub use sinks::{LogSink, MemorySink, NullSink};

/// A telemetry sink that consumes limiter events.
pub trait TelemetrySink:
    tower::Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry must never fail eviction or persistence: if a sink is not ready
/// or returns an error, the event is dropped.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}
