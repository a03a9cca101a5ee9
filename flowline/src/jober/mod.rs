//! Task execution adapters.
//!
//! A [`Jober`] runs the unit of work attached to a state node over the batch
//! of contexts processed together. It never raises anything but a
//! [`JoberError`], whose [`FailureKind`] decides between retry and ERROR.
//!
//! [`FailureKind`]: crate::errors::FailureKind

mod asynchronous;
mod general;
mod local;

pub use asynchronous::{AsyncJob, AsyncJober, JobDispatcher};
pub use general::{Broker, GeneralJober, InvokeError, Invoker, InvokerRegistry};
pub use local::{EchoJober, LocalJober};

use crate::core::{FlowContext, FlowData};
use crate::errors::JoberError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a jober produced for its batch.
#[derive(Debug, Clone, PartialEq)]
pub enum JoberOutput<T> {
    /// One payload per input context, in input order.
    Mapped(Vec<T>),
    /// Zero or more payloads per input context, in input order (fan-out).
    Produced(Vec<Vec<T>>),
    /// Work was handed to an external job; the contexts stay parked until
    /// a completion call resumes them.
    Dispatched,
}

/// The unit of work attached to a state node.
#[async_trait]
pub trait Jober<T: FlowData>: Send + Sync + Debug {
    /// Returns the jober name.
    fn name(&self) -> &str;

    /// Runs the work for a batch of contexts.
    async fn execute(&self, contexts: &[FlowContext<T>]) -> Result<JoberOutput<T>, JoberError>;

    /// Returns true if the jober completes through an external resume.
    fn is_async(&self) -> bool {
        false
    }
}

/// An atomically swappable jober reference.
///
/// Each swap bumps a version so operators can tell which executor a node
/// ran with.
#[derive(Debug)]
pub struct JoberSlot<T: FlowData> {
    current: RwLock<Arc<dyn Jober<T>>>,
    version: AtomicU64,
}

impl<T: FlowData> JoberSlot<T> {
    /// Creates a slot holding `jober`.
    #[must_use]
    pub fn new(jober: Arc<dyn Jober<T>>) -> Self {
        Self {
            current: RwLock::new(jober),
            version: AtomicU64::new(1),
        }
    }

    /// Returns the current jober.
    #[must_use]
    pub fn load(&self) -> Arc<dyn Jober<T>> {
        self.current.read().clone()
    }

    /// Replaces the jober and returns the previous one.
    pub fn swap(&self, jober: Arc<dyn Jober<T>>) -> Arc<dyn Jober<T>> {
        let mut current = self.current.write();
        self.version.fetch_add(1, Ordering::SeqCst);
        std::mem::replace(&mut *current, jober)
    }

    /// Returns the number of jobers this slot has held.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_swap() {
        let slot: JoberSlot<serde_json::Value> = JoberSlot::new(Arc::new(EchoJober::new()));
        assert_eq!(slot.version(), 1);
        assert_eq!(slot.load().name(), "echo");

        let previous = slot.swap(Arc::new(EchoJober::named("echo-v2")));
        assert_eq!(previous.name(), "echo");
        assert_eq!(slot.load().name(), "echo-v2");
        assert_eq!(slot.version(), 2);
    }
}
