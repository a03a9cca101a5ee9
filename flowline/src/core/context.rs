//! The per-instance flow context token.

use super::{FlowData, FlowStatus};
use crate::errors::{FlowError, FlowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The runtime token that carries business data through a flow.
///
/// A new context is created for every node a unit of input visits; the
/// context it was derived from is recorded in `previous`. Contexts are never
/// deleted, they end up `Archived` or `Error`. The data is owned by whichever
/// worker currently holds the lock for `(stream_id, position, to_batch)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(bound = "T: FlowData")]
pub struct FlowContext<T: FlowData> {
    /// Unique id of this context.
    pub id: Uuid,
    /// The compiled graph this context belongs to.
    pub stream_id: String,
    /// The end-to-end execution this context is part of.
    pub trace_id: Uuid,
    /// The node id the context currently occupies.
    pub position: String,
    /// Lifecycle status.
    pub status: FlowStatus,
    /// Business payload.
    pub data: T,
    /// Correlation id of the group this context is processed with.
    pub to_batch: Option<Uuid>,
    /// The context this one was derived from.
    pub previous: Option<Uuid>,
    /// Failure description once the context failed.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last persisted modification.
    pub updated_at: DateTime<Utc>,
}

impl<T: FlowData> FlowContext<T> {
    /// Creates a pending context at `position`.
    #[must_use]
    pub fn new(
        stream_id: impl Into<String>,
        trace_id: Uuid,
        position: impl Into<String>,
        data: T,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            stream_id: stream_id.into(),
            trace_id,
            position: position.into(),
            status: FlowStatus::Pending,
            data,
            to_batch: None,
            previous: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the batch correlation id.
    #[must_use]
    pub fn with_batch(mut self, to_batch: Uuid) -> Self {
        self.to_batch = Some(to_batch);
        self
    }

    /// Derives a pending successor at `position`, inheriting trace and batch.
    #[must_use]
    pub fn derive(&self, position: impl Into<String>, data: T) -> Self {
        let mut next = Self::new(self.stream_id.clone(), self.trace_id, position, data);
        next.to_batch = self.to_batch;
        next.previous = Some(self.id);
        next
    }

    /// Moves the context to `next`, enforcing the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidTransition`] if the move is not allowed.
    pub fn transition(&mut self, next: FlowStatus) -> FlowResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                context_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the context failed with `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot enter `status` from its current one.
    pub fn fail(&mut self, status: FlowStatus, message: impl Into<String>) -> FlowResult<()> {
        self.transition(status)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Returns the key this context is grouped and locked under.
    #[must_use]
    pub fn batch_key(&self) -> BatchKey {
        BatchKey {
            stream_id: self.stream_id.clone(),
            position: self.position.clone(),
            to_batch: self.to_batch,
        }
    }
}

/// Identifies the group of contexts a worker processes together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    /// The stream id.
    pub stream_id: String,
    /// The node id.
    pub position: String,
    /// The batch correlation id.
    pub to_batch: Option<Uuid>,
}

impl BatchKey {
    /// Creates a new batch key.
    #[must_use]
    pub fn new(
        stream_id: impl Into<String>,
        position: impl Into<String>,
        to_batch: Option<Uuid>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            position: position.into(),
            to_batch,
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_batch {
            Some(batch) => write!(f, "{}/{}/{}", self.stream_id, self.position, batch),
            None => write!(f, "{}/{}/-", self.stream_id, self.position),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> FlowContext<serde_json::Value> {
        FlowContext::new("demo:1", Uuid::new_v4(), "state1", json!({"url": "a.com"}))
    }

    #[test]
    fn test_new_context_is_pending_without_batch() {
        let ctx = context();
        assert_eq!(ctx.status, FlowStatus::Pending);
        assert!(ctx.to_batch.is_none());
        assert!(ctx.previous.is_none());
    }

    #[test]
    fn test_derive_keeps_trace_and_batch() {
        let batch = Uuid::new_v4();
        let ctx = context().with_batch(batch);
        let next = ctx.derive("state2", json!({"url": "b.com"}));

        assert_ne!(next.id, ctx.id);
        assert_eq!(next.trace_id, ctx.trace_id);
        assert_eq!(next.to_batch, Some(batch));
        assert_eq!(next.previous, Some(ctx.id));
        assert_eq!(next.position, "state2");
        assert_eq!(next.status, FlowStatus::Pending);
    }

    #[test]
    fn test_transition_enforces_lifecycle() {
        let mut ctx = context();
        assert!(ctx.transition(FlowStatus::Archived).is_err());
        ctx.transition(FlowStatus::Processing).unwrap();
        ctx.fail(FlowStatus::Error, "boom").unwrap();

        assert_eq!(ctx.status, FlowStatus::Error);
        assert_eq!(ctx.error.as_deref(), Some("boom"));
        assert!(matches!(
            ctx.transition(FlowStatus::Pending),
            Err(FlowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_batch_key_display() {
        let batch = Uuid::new_v4();
        let key = BatchKey::new("demo:1", "join", Some(batch));
        assert_eq!(key.to_string(), format!("demo:1/join/{batch}"));
        assert_eq!(BatchKey::new("demo:1", "join", None).to_string(), "demo:1/join/-");
    }
}
