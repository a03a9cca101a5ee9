//! Registry of compiled pipelines keyed by stream id.

use super::{AdvanceOutcome, FlowPipeline, FlowServices, PipelineBuilder, TraceStatus};
use crate::core::FlowData;
use crate::errors::{FlowError, FlowResult};
use crate::graph::FlowDefinition;
use crate::persistence::RetryRecord;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Routes offers, resumes and retries to the pipeline owning a stream.
pub struct FlowEngine<T: FlowData> {
    services: FlowServices<T>,
    pipelines: DashMap<String, Arc<FlowPipeline<T>>>,
}

impl<T: FlowData> FlowEngine<T> {
    /// Creates an engine whose pipelines share `services`.
    #[must_use]
    pub fn new(services: FlowServices<T>) -> Self {
        Self {
            services,
            pipelines: DashMap::new(),
        }
    }

    /// Returns the shared services.
    #[must_use]
    pub fn services(&self) -> &FlowServices<T> {
        &self.services
    }

    /// Starts a builder for `definition` against the shared services.
    #[must_use]
    pub fn builder(&self, definition: FlowDefinition) -> PipelineBuilder<T> {
        PipelineBuilder::new(definition, self.services.clone())
    }

    /// Registers a compiled pipeline, replacing any with the same stream id.
    pub fn register(&self, pipeline: FlowPipeline<T>) -> Arc<FlowPipeline<T>> {
        let pipeline = Arc::new(pipeline);
        let stream_id = pipeline.stream_id().to_string();
        if self.pipelines.insert(stream_id.clone(), pipeline.clone()).is_some() {
            info!(stream_id = %stream_id, "Pipeline replaced");
        } else {
            info!(stream_id = %stream_id, "Pipeline registered");
        }
        pipeline
    }

    /// Returns the pipeline for a stream.
    #[must_use]
    pub fn pipeline(&self, stream_id: &str) -> Option<Arc<FlowPipeline<T>>> {
        self.pipelines.get(stream_id).map(|p| p.value().clone())
    }

    /// Returns the registered stream ids, sorted.
    #[must_use]
    pub fn streams(&self) -> Vec<String> {
        let mut streams: Vec<_> = self.pipelines.iter().map(|p| p.key().clone()).collect();
        streams.sort();
        streams
    }

    fn require(&self, stream_id: &str) -> FlowResult<Arc<FlowPipeline<T>>> {
        self.pipeline(stream_id)
            .ok_or_else(|| FlowError::StreamNotFound(stream_id.to_string()))
    }

    /// Starts a trace on the named stream.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::StreamNotFound`] for unknown streams, otherwise
    /// whatever [`FlowPipeline::offer`] returns.
    pub async fn offer(&self, stream_id: &str, payloads: Vec<T>) -> FlowResult<Uuid> {
        self.require(stream_id)?.offer(payloads).await
    }

    /// Resumes parked contexts, whatever stream they belong to.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ContextNotFound`] for unknown ids and
    /// [`FlowError::StreamNotFound`] if a context's stream is not registered.
    pub async fn resume(&self, ids: &[Uuid], merge: T) -> FlowResult<()> {
        let found = self.services.contexts.find_by_ids(ids).await?;
        let mut by_stream: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for id in ids {
            let ctx = found
                .iter()
                .find(|c| c.id == *id)
                .ok_or(FlowError::ContextNotFound(*id))?;
            by_stream.entry(ctx.stream_id.clone()).or_default().push(*id);
        }

        for (stream_id, group) in by_stream {
            self.require(&stream_id)?.resume(&group, merge.clone()).await?;
        }
        Ok(())
    }

    /// Completes the async job of one context with its result.
    ///
    /// # Errors
    ///
    /// Same as [`FlowEngine::resume`].
    pub async fn complete(&self, context_id: Uuid, result: T) -> FlowResult<()> {
        self.resume(&[context_id], result).await
    }

    /// Summarizes a trace.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::TraceNotFound`] if no context belongs to it.
    pub async fn trace_status(&self, trace_id: Uuid) -> FlowResult<TraceStatus> {
        let contexts = self.services.contexts.find_all_by_trace(trace_id).await?;
        let Some(first) = contexts.first() else {
            return Err(FlowError::TraceNotFound(trace_id));
        };
        self.require(&first.stream_id)?.trace_status(trace_id).await
    }

    /// Re-injects the batch described by a retry record.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::StreamNotFound`] if the record's stream is not
    /// registered.
    pub async fn retry(&self, record: &RetryRecord) -> FlowResult<AdvanceOutcome> {
        self.require(&record.stream_id)?
            .reinject(&record.batch_key())
            .await
    }
}

impl<T: FlowData> fmt::Debug for FlowEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowEngine")
            .field("streams", &self.streams())
            .finish_non_exhaustive()
    }
}
