//! In-memory stores for tests and single-process deployments.

use super::{FlowContextRepo, RetryRecord, RetryRepo};
use crate::core::{BatchKey, FlowContext, FlowData, FlowStatus};
use crate::errors::FlowResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug)]
struct Rows<T: FlowData> {
    rows: Vec<FlowContext<T>>,
    index: HashMap<Uuid, usize>,
}

impl<T: FlowData> Rows<T> {
    fn insert(&mut self, ctx: &FlowContext<T>) -> bool {
        if self.index.contains_key(&ctx.id) {
            return false;
        }
        self.index.insert(ctx.id, self.rows.len());
        self.rows.push(ctx.clone());
        true
    }

    fn apply(
        &mut self,
        ctx: &FlowContext<T>,
        apply: impl Fn(&mut FlowContext<T>, &FlowContext<T>),
    ) -> bool {
        match self.index.get(&ctx.id) {
            Some(&slot) => {
                apply(&mut self.rows[slot], ctx);
                true
            }
            None => false,
        }
    }
}

fn replace<T: FlowData>(stored: &mut FlowContext<T>, ctx: &FlowContext<T>) {
    stored.status = ctx.status;
    stored.data = ctx.data.clone();
    stored.to_batch = ctx.to_batch;
    stored.error.clone_from(&ctx.error);
    stored.updated_at = Utc::now();
}

impl<T: FlowData> Default for Rows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }
}

/// An insertion-ordered in-memory context store.
#[derive(Debug)]
pub struct InMemoryContextRepo<T: FlowData> {
    inner: RwLock<Rows<T>>,
}

impl<T: FlowData> Default for InMemoryContextRepo<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Rows::default()),
        }
    }
}

impl<T: FlowData> InMemoryContextRepo<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().rows.is_empty()
    }

    /// Returns a copy of every stored context.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FlowContext<T>> {
        self.inner.read().rows.clone()
    }

    fn select(&self, filter: impl Fn(&FlowContext<T>) -> bool) -> Vec<FlowContext<T>> {
        self.inner
            .read()
            .rows
            .iter()
            .filter(|ctx| filter(ctx))
            .cloned()
            .collect()
    }

    fn modify(
        &self,
        contexts: &[FlowContext<T>],
        apply: impl Fn(&mut FlowContext<T>, &FlowContext<T>),
    ) -> usize {
        let mut inner = self.inner.write();
        contexts.iter().filter(|ctx| inner.apply(ctx, &apply)).count()
    }
}

#[async_trait]
impl<T: FlowData> FlowContextRepo<T> for InMemoryContextRepo<T> {
    async fn save(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize> {
        let mut inner = self.inner.write();
        Ok(contexts.iter().filter(|ctx| inner.insert(ctx)).count())
    }

    async fn update(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize> {
        Ok(self.modify(contexts, replace))
    }

    async fn advance(
        &self,
        successors: &[FlowContext<T>],
        origins: &[FlowContext<T>],
        fence: &(dyn Fn() -> FlowResult<()> + Send + Sync),
    ) -> FlowResult<(usize, usize)> {
        let mut inner = self.inner.write();
        fence()?;
        let saved = successors.iter().filter(|ctx| inner.insert(ctx)).count();
        let updated = origins.iter().filter(|ctx| inner.apply(ctx, replace)).count();
        Ok((saved, updated))
    }

    async fn update_data_and_batch(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize> {
        Ok(self.modify(contexts, |stored, ctx| {
            stored.data = ctx.data.clone();
            stored.to_batch = ctx.to_batch;
            stored.updated_at = Utc::now();
        }))
    }

    async fn find(
        &self,
        stream_id: &str,
        trace_id: Option<Uuid>,
        position: &str,
        status: FlowStatus,
    ) -> FlowResult<Vec<FlowContext<T>>> {
        Ok(self.select(|ctx| {
            ctx.stream_id == stream_id
                && ctx.position == position
                && ctx.status == status
                && trace_id.map_or(true, |t| ctx.trace_id == t)
        }))
    }

    async fn find_batch(
        &self,
        key: &BatchKey,
        status: FlowStatus,
    ) -> FlowResult<Vec<FlowContext<T>>> {
        Ok(self.select(|ctx| {
            ctx.stream_id == key.stream_id
                && ctx.position == key.position
                && ctx.to_batch == key.to_batch
                && ctx.status == status
        }))
    }

    async fn find_all_by_trace(&self, trace_id: Uuid) -> FlowResult<Vec<FlowContext<T>>> {
        Ok(self.select(|ctx| ctx.trace_id == trace_id))
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> FlowResult<Vec<FlowContext<T>>> {
        Ok(self.select(|ctx| ids.contains(&ctx.id)))
    }
}

/// In-memory retry record store.
#[derive(Debug, Default)]
pub struct InMemoryRetryRepo {
    records: Mutex<HashMap<Uuid, RetryRecord>>,
}

impl InMemoryRetryRepo {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RetryRepo for InMemoryRetryRepo {
    async fn get_by_id(&self, batch_id: Uuid) -> FlowResult<Option<RetryRecord>> {
        Ok(self.records.lock().get(&batch_id).cloned())
    }

    async fn increment(&self, record: RetryRecord) -> FlowResult<u32> {
        let mut records = self.records.lock();
        let count = match records.get_mut(&record.batch_id) {
            Some(existing) => {
                existing.retry_count += 1;
                existing.next_retry_at = record.next_retry_at;
                existing.last_error = record.last_error;
                existing.retry_count
            }
            None => {
                let record = RetryRecord {
                    retry_count: 1,
                    ..record
                };
                records.insert(record.batch_id, record);
                1
            }
        };
        Ok(count)
    }

    async fn delete(&self, batch_id: Uuid) -> FlowResult<usize> {
        Ok(usize::from(self.records.lock().remove(&batch_id).is_some()))
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> FlowResult<Vec<RetryRecord>> {
        let mut due: Vec<RetryRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance_tests;
    use super::*;

    #[tokio::test]
    async fn test_context_repo_conformance() {
        conformance_tests::context_repo_suite(&InMemoryContextRepo::new()).await;
    }

    #[tokio::test]
    async fn test_retry_repo_conformance() {
        conformance_tests::retry_repo_suite(&InMemoryRetryRepo::new()).await;
    }

    #[tokio::test]
    async fn test_len_and_snapshot() {
        let repo = InMemoryContextRepo::new();
        assert!(repo.is_empty());
        let ctx = FlowContext::new("s", Uuid::new_v4(), "a", serde_json::json!({}));
        repo.save(&[ctx.clone()]).await.unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.snapshot()[0].id, ctx.id);
    }
}
