use crate::core::BatchKey;
use crate::errors::FlowResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry bookkeeping for one batch.
///
/// Records are keyed by the batch id so that every context retried together
/// shares one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// The batch being retried.
    pub batch_id: Uuid,
    /// Stream of the failed contexts.
    pub stream_id: String,
    /// Node the contexts failed at.
    pub position: String,
    /// Number of retries scheduled so far.
    pub retry_count: u32,
    /// Earliest time the scheduler may re-inject the batch.
    pub next_retry_at: DateTime<Utc>,
    /// Last failure message.
    pub last_error: Option<String>,
}

impl RetryRecord {
    /// Creates a record for a first retry, due immediately.
    #[must_use]
    pub fn new(batch_id: Uuid, stream_id: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            batch_id,
            stream_id: stream_id.into(),
            position: position.into(),
            retry_count: 1,
            next_retry_at: Utc::now(),
            last_error: None,
        }
    }

    /// Sets the due time.
    #[must_use]
    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = at;
        self
    }

    /// Sets the failure message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Returns the key of the contexts this record reschedules.
    #[must_use]
    pub fn batch_key(&self) -> BatchKey {
        BatchKey::new(self.stream_id.clone(), self.position.clone(), Some(self.batch_id))
    }

    /// Returns true once the record may be picked up.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now
    }
}

/// Storage for retry records.
#[async_trait]
pub trait RetryRepo: Send + Sync {
    /// Loads the record of a batch.
    async fn get_by_id(&self, batch_id: Uuid) -> FlowResult<Option<RetryRecord>>;

    /// Creates the record with a count of 1, or bumps the stored count and
    /// replaces its due time and error. Returns the new count.
    async fn increment(&self, record: RetryRecord) -> FlowResult<u32>;

    /// Returns true if the batch has already been retried `max` times. A
    /// batch without a record has been retried zero times.
    async fn is_max_retry_count(&self, batch_id: Uuid, max: u32) -> FlowResult<bool> {
        let retried = self
            .get_by_id(batch_id)
            .await?
            .map_or(0, |record| record.retry_count);
        Ok(retried >= max)
    }

    /// Removes the record of a batch.
    async fn delete(&self, batch_id: Uuid) -> FlowResult<usize>;

    /// Returns up to `limit` records due at `now`, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> FlowResult<Vec<RetryRecord>>;
}
