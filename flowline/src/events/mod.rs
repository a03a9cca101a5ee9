//! Advisory event notification.
//!
//! The pipeline publishes progress events to an [`EventSink`]. Events are
//! purely informational; nothing in the engine depends on their delivery.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A batch moved past a node.
pub const TRACE_ADVANCED: &str = "flow.trace.advanced";
/// Contexts were parked at a gate or async node.
pub const TRACE_PAUSED: &str = "flow.trace.paused";
/// Contexts were archived at an end node.
pub const TRACE_ARCHIVED: &str = "flow.trace.archived";
/// Contexts reached ERROR.
pub const TRACE_FAILED: &str = "flow.trace.failed";
/// A retry was scheduled for a batch.
pub const RETRY_SCHEDULED: &str = "flow.context.retry_scheduled";
/// A held lock was revoked.
pub const LOCK_LOST: &str = "flow.lock.lost";
