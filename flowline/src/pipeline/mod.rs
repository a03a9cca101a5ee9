//! The push-driven pipeline runtime.
//!
//! A [`FlowDefinition`] is compiled by [`PipelineBuilder`] into a
//! [`FlowPipeline`]: one runtime stage per node, each bound to its executor.
//! Data enters through [`FlowPipeline::offer`], is persisted as contexts at
//! the start node, and is pushed from node to node under the position lock
//! until an end node archives it, a gate or async node parks it, or a
//! failure moves it to RETRYABLE or ERROR.
//!
//! [`FlowEngine`] keeps compiled pipelines by stream id and routes resume
//! and retry calls to the right one.
//!
//! [`FlowDefinition`]: crate::graph::FlowDefinition

mod builder;
mod engine;
mod flow;
mod outcome;


pub use builder::PipelineBuilder;
pub use engine::FlowEngine;
pub use flow::FlowPipeline;
pub use outcome::{AdvanceOutcome, TraceStatus};

use crate::config::EngineConfig;
use crate::core::{FlowContext, FlowData};
use crate::errors::FlowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::lock::{FlowLocks, LocalLocks};
use crate::persistence::{FlowContextRepo, InMemoryContextRepo, InMemoryRetryRepo, RetryRepo};
use std::fmt;
use std::sync::Arc;

/// Called by end nodes with the contexts they archived.
pub type CompletionHandler<T> = Arc<dyn Fn(&[FlowContext<T>]) + Send + Sync>;

/// Called with contexts that reached ERROR and the failure that put them there.
pub type ErrorHandler<T> = Arc<dyn Fn(&[FlowContext<T>], &FlowError) + Send + Sync>;

/// The collaborators a pipeline runs against.
pub struct FlowServices<T: FlowData> {
    /// Context store.
    pub contexts: Arc<dyn FlowContextRepo<T>>,
    /// Retry record store.
    pub retries: Arc<dyn RetryRepo>,
    /// Position locks.
    pub locks: Arc<dyn FlowLocks>,
    /// Advisory event sink.
    pub events: Arc<dyn EventSink>,
    /// Engine configuration.
    pub config: EngineConfig,
}

impl<T: FlowData> FlowServices<T> {
    /// Creates services from explicit collaborators.
    #[must_use]
    pub fn new(
        contexts: Arc<dyn FlowContextRepo<T>>,
        retries: Arc<dyn RetryRepo>,
        locks: Arc<dyn FlowLocks>,
    ) -> Self {
        Self {
            contexts,
            retries,
            locks,
            events: Arc::new(NoOpEventSink),
            config: EngineConfig::default(),
        }
    }

    /// In-memory stores with local locks.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryContextRepo::new()),
            Arc::new(InMemoryRetryRepo::new()),
            Arc::new(LocalLocks::new()),
        )
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the lock backend.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<dyn FlowLocks>) -> Self {
        self.locks = locks;
        self
    }
}

impl<T: FlowData> Clone for FlowServices<T> {
    fn clone(&self) -> Self {
        Self {
            contexts: self.contexts.clone(),
            retries: self.retries.clone(),
            locks: self.locks.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: FlowData> fmt::Debug for FlowServices<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
