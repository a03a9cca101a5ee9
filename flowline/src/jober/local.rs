//! In-process jobers.

use super::{Jober, JoberOutput};
use crate::core::{FlowContext, FlowData};
use crate::errors::JoberError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Passes data through unchanged. Bound to state nodes with no jober.
#[derive(Debug, Clone)]
pub struct EchoJober {
    name: String,
}

impl Default for EchoJober {
    fn default() -> Self {
        Self::named("echo")
    }
}

impl EchoJober {
    /// Creates an echo jober.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an echo jober with a custom name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for EchoJober {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        Ok(JoberOutput::Mapped(contexts.iter().map(|c| c.data.clone()).collect()))
    }
}

type MapFn<T> = dyn Fn(&FlowContext<T>) -> Result<T, JoberError> + Send + Sync;
type ProduceFn<T> = dyn Fn(&FlowContext<T>) -> Result<Vec<T>, JoberError> + Send + Sync;

enum Transform<T: FlowData> {
    Map(Arc<MapFn<T>>),
    Produce(Arc<ProduceFn<T>>),
}

/// A synchronous closure applied to each context of the batch.
pub struct LocalJober<T: FlowData> {
    name: String,
    transform: Transform<T>,
}

impl<T: FlowData> LocalJober<T> {
    /// One output payload per context.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&FlowContext<T>) -> Result<T, JoberError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            transform: Transform::Map(Arc::new(f)),
        }
    }

    /// Any number of output payloads per context (fan-out).
    pub fn produce<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&FlowContext<T>) -> Result<Vec<T>, JoberError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            transform: Transform::Produce(Arc::new(f)),
        }
    }
}

impl<T: FlowData> fmt::Debug for LocalJober<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.transform {
            Transform::Map(_) => "map",
            Transform::Produce(_) => "produce",
        };
        f.debug_struct("LocalJober")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for LocalJober<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        match &self.transform {
            Transform::Map(f) => contexts
                .iter()
                .map(|ctx| f(ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(JoberOutput::Mapped),
            Transform::Produce(f) => contexts
                .iter()
                .map(|ctx| f(ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(JoberOutput::Produced),
        }
    }
}
