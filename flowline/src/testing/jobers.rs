//! Scripted jobers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::{BatchKey, FlowContext, FlowData};
use crate::errors::JoberError;
use crate::jober::{AsyncJob, JobDispatcher, Jober, JoberOutput};

fn echo<T: FlowData>(contexts: &[FlowContext<T>]) -> JoberOutput<T> {
    JoberOutput::Mapped(contexts.iter().map(|c| c.data.clone()).collect())
}

/// Fails with a retryable error a fixed number of times, then echoes.
#[derive(Debug)]
pub struct FlakyJober {
    name: String,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyJober {
    /// Creates a jober failing its first `failures` calls.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            name: "flaky".to_string(),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a jober that never succeeds.
    #[must_use]
    pub fn always() -> Self {
        Self::new(usize::MAX)
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for FlakyJober {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(JoberError::retryable(format!("transient failure #{}", call + 1)));
        }
        Ok(echo(contexts))
    }
}

/// Always fails with the configured error.
#[derive(Debug)]
pub struct FailingJober {
    name: String,
    error: JoberError,
    calls: AtomicUsize,
}

impl FailingJober {
    /// Creates a jober failing fatally with `message`.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::with_error(JoberError::fatal(message))
    }

    /// Creates a jober failing with `error`.
    #[must_use]
    pub fn with_error(error: JoberError) -> Self {
        Self {
            name: "failing".to_string(),
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for FailingJober {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Echoes its input while counting calls and contexts.
#[derive(Debug)]
pub struct CountingJober {
    name: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    contexts: AtomicUsize,
}

impl CountingJober {
    /// Creates a counting jober.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: None,
            calls: AtomicUsize::new(0),
            contexts: AtomicUsize::new(0),
        }
    }

    /// Sleeps for `delay` on every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the number of contexts seen across all calls.
    #[must_use]
    pub fn contexts_seen(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for CountingJober {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.fetch_add(contexts.len(), Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(echo(contexts))
    }
}

/// Blocks its first call until opened, then echoes.
///
/// Lets a test act while a worker holds a position lock.
#[derive(Debug)]
pub struct GatedJober {
    name: String,
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
    keys: Mutex<Vec<BatchKey>>,
}

impl Default for GatedJober {
    fn default() -> Self {
        Self::new()
    }
}

impl GatedJober {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "gated".to_string(),
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    /// Waits until the first call is blocked inside the jober.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the blocked call continue.
    pub fn open(&self) {
        self.release.notify_one();
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the batch key of every call, in call order.
    #[must_use]
    pub fn keys(&self) -> Vec<BatchKey> {
        self.keys.lock().clone()
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for GatedJober {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        if let Some(first) = contexts.first() {
            self.keys.lock().push(first.batch_key());
        }
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(echo(contexts))
    }
}

/// Records dispatched async jobs instead of sending them anywhere.
#[derive(Debug)]
pub struct RecordingDispatcher<T: FlowData> {
    jobs: Mutex<Vec<AsyncJob<T>>>,
    failure: Option<JoberError>,
}

impl<T: FlowData> Default for RecordingDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FlowData> RecordingDispatcher<T> {
    /// Creates a dispatcher accepting every job.
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            failure: None,
        }
    }

    /// Creates a dispatcher rejecting every batch with `error`.
    #[must_use]
    pub fn failing(error: JoberError) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    /// Returns the jobs dispatched so far.
    #[must_use]
    pub fn jobs(&self) -> Vec<AsyncJob<T>> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl<T: FlowData> JobDispatcher<T> for RecordingDispatcher<T> {
    async fn dispatch(&self, jobs: Vec<AsyncJob<T>>) -> Result<(), JoberError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.jobs.lock().extend(jobs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn batch() -> Vec<FlowContext<Value>> {
        vec![FlowContext::new("t:1", Uuid::new_v4(), "a", json!({"n": 1}))]
    }

    #[tokio::test]
    async fn test_flaky_then_echo() {
        let jober = FlakyJober::new(2);
        for _ in 0..2 {
            let err = Jober::<Value>::execute(&jober, &batch()).await.unwrap_err();
            assert!(err.is_retryable());
        }
        let out = Jober::<Value>::execute(&jober, &batch()).await.unwrap();
        assert_eq!(out, JoberOutput::Mapped(vec![json!({"n": 1})]));
        assert_eq!(jober.calls(), 3);
    }

    #[tokio::test]
    async fn test_counting() {
        let jober = CountingJober::new("count");
        Jober::<Value>::execute(&jober, &batch()).await.unwrap();
        assert_eq!(jober.calls(), 1);
        assert_eq!(jober.contexts_seen(), 1);
    }

    #[tokio::test]
    async fn test_gated_blocks_first_call_only() {
        let jober = std::sync::Arc::new(GatedJober::new());
        let first = {
            let jober = jober.clone();
            tokio::spawn(async move { Jober::<Value>::execute(&*jober, &batch()).await })
        };
        jober.entered().await;
        assert!(!first.is_finished());
        jober.open();
        first.await.unwrap().unwrap();

        Jober::<Value>::execute(&*jober, &batch()).await.unwrap();
        assert_eq!(jober.calls(), 2);
        assert_eq!(jober.keys().len(), 2);
    }
}
