//! Remote invocation through a broker.
//!
//! A [`GeneralJober`] holds an ordered list of candidate target names. Each
//! execution resolves the candidates through a [`Broker`] and calls them in
//! order, moving to the next candidate on a transient failure. The list can
//! be replaced at runtime without touching the flow definition.

use super::{Jober, JoberOutput};
use crate::core::{FlowContext, FlowData};
use crate::errors::{FailureKind, JoberError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure reported by a remote invoker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    /// The target could not be reached.
    #[error("target unavailable: {0}")]
    Unavailable(String),
    /// The target refused work for lack of capacity.
    #[error("target out of capacity: {0}")]
    Exhausted(String),
    /// The call did not finish in time.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),
    /// The arguments were rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The target failed permanently.
    #[error("remote failure: {0}")]
    Failed(String),
}

impl InvokeError {
    /// Classifies the failure.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unavailable(_) | Self::Exhausted(_) | Self::Timeout(_) => FailureKind::Retryable,
            Self::InvalidInput(_) | Self::Failed(_) => FailureKind::Fatal,
        }
    }

    fn into_jober_error(self, target: &str) -> JoberError {
        JoberError {
            kind: self.kind(),
            message: format!("{target}: {self}"),
        }
    }
}

/// A callable remote target supplied by the hosting platform.
#[async_trait]
pub trait Invoker<T: FlowData>: Send + Sync {
    /// Invokes the target with the batch payloads; returns one result per
    /// argument.
    async fn invoke(&self, args: Vec<T>) -> Result<Vec<T>, InvokeError>;

    /// Produces a fallback result after `error`, if the target has one.
    async fn fallback(&self, _args: Vec<T>, _error: InvokeError) -> Option<Vec<T>> {
        None
    }
}

/// Resolves logical target names to invokers.
pub trait Broker<T: FlowData>: Send + Sync {
    /// Looks up a target.
    fn resolve(&self, name: &str) -> Option<Arc<dyn Invoker<T>>>;
}

/// An explicit name-to-invoker registry.
pub struct InvokerRegistry<T: FlowData> {
    invokers: DashMap<String, Arc<dyn Invoker<T>>>,
}

impl<T: FlowData> Default for InvokerRegistry<T> {
    fn default() -> Self {
        Self {
            invokers: DashMap::new(),
        }
    }
}

impl<T: FlowData> InvokerRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a target.
    pub fn register(&self, name: impl Into<String>, invoker: Arc<dyn Invoker<T>>) {
        self.invokers.insert(name.into(), invoker);
    }

    /// Removes a target. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.invokers.remove(name).is_some()
    }

    /// Returns registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.invokers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl<T: FlowData> fmt::Debug for InvokerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokerRegistry")
            .field("targets", &self.names())
            .finish()
    }
}

impl<T: FlowData> Broker<T> for InvokerRegistry<T> {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Invoker<T>>> {
        self.invokers.get(name).map(|e| e.value().clone())
    }
}

/// Calls remote targets resolved through a broker.
pub struct GeneralJober<T: FlowData> {
    name: String,
    broker: Arc<dyn Broker<T>>,
    targets: RwLock<Arc<Vec<String>>>,
    version: AtomicU64,
    timeout: Duration,
}

impl<T: FlowData> GeneralJober<T> {
    /// Creates a jober calling `targets` in order.
    #[must_use]
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker<T>>, targets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            broker,
            targets: RwLock::new(Arc::new(targets)),
            version: AtomicU64::new(1),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the current candidate targets.
    #[must_use]
    pub fn targets(&self) -> Arc<Vec<String>> {
        self.targets.read().clone()
    }

    /// Returns the target list version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Replaces the candidate targets; in-flight calls keep the old list.
    /// Returns the new version.
    pub fn retarget(&self, targets: Vec<String>) -> u64 {
        let mut current = self.targets.write();
        *current = Arc::new(targets);
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn call(&self, invoker: &dyn Invoker<T>, args: Vec<T>) -> Result<Vec<T>, InvokeError> {
        match tokio::time::timeout(self.timeout, invoker.invoke(args)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout(self.timeout)),
        }
    }

    fn check_len(
        &self,
        target: &str,
        expected: usize,
        results: Vec<T>,
    ) -> Result<JoberOutput<T>, JoberError> {
        if results.len() == expected {
            Ok(JoberOutput::Mapped(results))
        } else {
            Err(JoberError::fatal(format!(
                "{}: target {target} returned {} results for {expected} arguments",
                self.name,
                results.len()
            )))
        }
    }
}

impl<T: FlowData> fmt::Debug for GeneralJober<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneralJober")
            .field("name", &self.name)
            .field("targets", &self.targets())
            .field("version", &self.version())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: FlowData> Jober<T> for GeneralJober<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError> {
        let args: Vec<T> = contexts.iter().map(|c| c.data.clone()).collect();
        let targets = self.targets();
        if targets.is_empty() {
            return Err(JoberError::fatal(format!("{}: no targets configured", self.name)));
        }

        let mut last_failure: Option<(String, Arc<dyn Invoker<T>>, InvokeError)> = None;
        let mut unresolved = Vec::new();

        for target in targets.iter() {
            let Some(invoker) = self.broker.resolve(target) else {
                unresolved.push(target.clone());
                continue;
            };

            match self.call(invoker.as_ref(), args.clone()).await {
                Ok(results) => {
                    debug!(jober = %self.name, target, "Remote invocation succeeded");
                    return self.check_len(target, args.len(), results);
                }
                Err(error) if error.kind() == FailureKind::Retryable => {
                    warn!(
                        jober = %self.name,
                        target,
                        error = %error,
                        "Remote target failed, trying next candidate"
                    );
                    last_failure = Some((target.clone(), invoker, error));
                }
                Err(error) => {
                    if let Some(results) = invoker.fallback(args.clone(), error.clone()).await {
                        return self.check_len(target, args.len(), results);
                    }
                    return Err(error.into_jober_error(target));
                }
            }
        }

        match last_failure {
            Some((target, invoker, error)) => {
                if let Some(results) = invoker.fallback(args.clone(), error.clone()).await {
                    return self.check_len(&target, args.len(), results);
                }
                Err(error.into_jober_error(&target))
            }
            None => Err(JoberError::retryable(format!(
                "{}: no registered target among {}",
                self.name,
                unresolved.join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use serde_json::{json, Value};
    use uuid::Uuid;

    mock! {
        pub Remote {}

        #[async_trait]
        impl Invoker<Value> for Remote {
            async fn invoke(&self, args: Vec<Value>) -> Result<Vec<Value>, InvokeError>;
            async fn fallback(&self, args: Vec<Value>, error: InvokeError) -> Option<Vec<Value>>;
        }
    }

    fn contexts() -> Vec<FlowContext<Value>> {
        vec![FlowContext::new("s:1", Uuid::new_v4(), "call", json!({"q": 1}))]
    }

    fn jober(registry: &Arc<InvokerRegistry<Value>>, targets: &[&str]) -> GeneralJober<Value> {
        let broker: Arc<dyn Broker<Value>> = registry.clone();
        GeneralJober::new("remote", broker, targets.iter().map(ToString::to_string).collect())
    }

    #[tokio::test]
    async fn test_first_target_answers() {
        let mut remote = MockRemote::new();
        remote
            .expect_invoke()
            .times(1)
            .returning(|args| Ok(args.into_iter().map(|_| json!({"ok": true})).collect()));

        let registry = Arc::new(InvokerRegistry::new());
        registry.register("a", Arc::new(remote));

        let out = jober(&registry, &["a"]).execute(&contexts()).await.unwrap();
        assert_eq!(out, JoberOutput::Mapped(vec![json!({"ok": true})]));
    }

    #[tokio::test]
    async fn test_fails_over_on_retryable_error() {
        let mut down = MockRemote::new();
        down.expect_invoke()
            .times(1)
            .returning(|_| Err(InvokeError::Unavailable("connection refused".into())));
        let mut up = MockRemote::new();
        up.expect_invoke().times(1).returning(Ok);

        let registry = Arc::new(InvokerRegistry::new());
        registry.register("down", Arc::new(down));
        registry.register("up", Arc::new(up));

        let out = jober(&registry, &["missing", "down", "up"])
            .execute(&contexts())
            .await
            .unwrap();
        assert_eq!(out, JoberOutput::Mapped(vec![json!({"q": 1})]));
    }

    #[tokio::test]
    async fn test_all_targets_down_is_retryable() {
        let mut down = MockRemote::new();
        down.expect_invoke()
            .returning(|_| Err(InvokeError::Exhausted("queue full".into())));
        down.expect_fallback().times(1).returning(|_, _| None);

        let registry = Arc::new(InvokerRegistry::new());
        registry.register("down", Arc::new(down));

        let err = jober(&registry, &["down"]).execute(&contexts()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("queue full"));
    }

    #[tokio::test]
    async fn test_fatal_error_uses_fallback() {
        let mut remote = MockRemote::new();
        remote
            .expect_invoke()
            .returning(|_| Err(InvokeError::InvalidInput("q must be a string".into())));
        remote
            .expect_fallback()
            .times(1)
            .returning(|args, error| {
                assert_eq!(error, InvokeError::InvalidInput("q must be a string".into()));
                Some(args.into_iter().map(|_| json!({"fallback": true})).collect())
            });

        let registry = Arc::new(InvokerRegistry::new());
        registry.register("a", Arc::new(remote));

        let out = jober(&registry, &["a", "never-called"]).execute(&contexts()).await.unwrap();
        assert_eq!(out, JoberOutput::Mapped(vec![json!({"fallback": true})]));
    }

    #[tokio::test]
    async fn test_fatal_error_without_fallback() {
        let mut remote = MockRemote::new();
        remote
            .expect_invoke()
            .returning(|_| Err(InvokeError::Failed("500".into())));
        remote.expect_fallback().returning(|_, _| None);

        let registry = Arc::new(InvokerRegistry::new());
        registry.register("a", Arc::new(remote));

        let err = jober(&registry, &["a"]).execute(&contexts()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Fatal);
    }

    #[tokio::test]
    async fn test_unresolved_targets_are_retryable() {
        let registry = Arc::new(InvokerRegistry::new());
        let err = jober(&registry, &["ghost"]).execute(&contexts()).await.unwrap_err();
        assert!(err.is_retryable());

        let err = jober(&registry, &[]).execute(&contexts()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_result_count_mismatch_is_fatal() {
        let mut remote = MockRemote::new();
        remote.expect_invoke().returning(|_| Ok(vec![]));
        let registry = Arc::new(InvokerRegistry::new());
        registry.register("a", Arc::new(remote));

        let err = jober(&registry, &["a"]).execute(&contexts()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Fatal);
    }

    #[tokio::test]
    async fn test_retarget_between_calls() {
        let mut old = MockRemote::new();
        old.expect_invoke().times(1).returning(|_| Ok(vec![json!("old")]));
        let mut new = MockRemote::new();
        new.expect_invoke().times(1).returning(|_| Ok(vec![json!("new")]));

        let registry = Arc::new(InvokerRegistry::new());
        registry.register("old", Arc::new(old));
        registry.register("new", Arc::new(new));

        let jober = jober(&registry, &["old"]);
        assert_eq!(
            jober.execute(&contexts()).await.unwrap(),
            JoberOutput::Mapped(vec![json!("old")])
        );

        assert_eq!(jober.retarget(vec!["new".into()]), 2);
        assert_eq!(jober.targets().as_slice(), ["new".to_string()]);
        assert_eq!(
            jober.execute(&contexts()).await.unwrap(),
            JoberOutput::Mapped(vec![json!("new")])
        );
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl Invoker<Value> for Slow {
        async fn invoke(&self, args: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(args)
        }
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let registry = Arc::new(InvokerRegistry::new());
        registry.register("slow", Arc::new(Slow));

        let err = jober(&registry, &["slow"])
            .with_timeout(Duration::from_millis(20))
            .execute(&contexts())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("timed out"));
        assert_eq!(registry.names(), vec!["slow".to_string()]);
    }
}
