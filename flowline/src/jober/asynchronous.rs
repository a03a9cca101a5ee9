//! Jobers completed by an external actor.

use super::{Jober, JoberOutput};
use crate::core::{FlowContext, FlowData};
use crate::errors::JoberError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A unit of work handed to an external job system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: FlowData")]
pub struct AsyncJob<T: FlowData> {
    /// The parked context; pass it back to the engine's resume call.
    pub context_id: Uuid,
    /// The trace the context belongs to.
    pub trace_id: Uuid,
    /// The state node that dispatched the job.
    pub position: String,
    /// The payload to work on.
    pub data: T,
}

impl<T: FlowData> From<&FlowContext<T>> for AsyncJob<T> {
    fn from(ctx: &FlowContext<T>) -> Self {
        Self {
            context_id: ctx.id,
            trace_id: ctx.trace_id,
            position: ctx.position.clone(),
            data: ctx.data.clone(),
        }
    }
}

/// Hands jobs to an external system.
#[async_trait]
pub trait JobDispatcher<T: FlowData>: Send + Sync {
    /// Dispatches the jobs of one batch.
    async fn dispatch(&self, jobs: Vec<AsyncJob<T>>) -> Result<(), JoberError>;
}

/// Dispatches work and leaves its contexts parked until resumed.
pub struct AsyncJober<T: FlowData> {
    name: String,
    dispatcher: Arc<dyn JobDispatcher<T>>,
}

impl<T: FlowData> AsyncJober<T> {
    /// Creates an async jober.
    #[must_use]
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn JobDispatcher<T>>) -> Self {
        Self {
            name: name.into(),
            dispatcher,
        }
    }
}

impl<T: FlowData> fmt::Debug for AsyncJober<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncJober").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for AsyncJober<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        let jobs = contexts.iter().map(AsyncJob::from).collect();
        self.dispatcher.dispatch(jobs).await?;
        Ok(JoberOutput::Dispatched)
    }

    fn is_async(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDispatcher;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_dispatches_one_job_per_context() {
        let dispatcher = Arc::new(RecordingDispatcher::<Value>::new());
        let jober = AsyncJober::new("ocr", dispatcher.clone());
        let ctx = FlowContext::new("s:1", Uuid::new_v4(), "ocr", json!({"doc": 7}));

        let out = jober.execute(std::slice::from_ref(&ctx)).await.unwrap();
        assert_eq!(out, JoberOutput::Dispatched);
        assert!(Jober::<Value>::is_async(&jober));

        let jobs = dispatcher.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].context_id, ctx.id);
        assert_eq!(jobs[0].data, json!({"doc": 7}));
    }

    #[tokio::test]
    async fn test_dispatch_failure_propagates() {
        let dispatcher =
            Arc::new(RecordingDispatcher::<Value>::failing(JoberError::retryable("broker down")));
        let jober = AsyncJober::new("ocr", dispatcher);
        let ctx = FlowContext::new("s:1", Uuid::new_v4(), "ocr", json!({}));

        let err = jober.execute(&[ctx]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
