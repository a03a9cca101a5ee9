//! Position locks.
//!
//! Before a worker mutates the contexts grouped under a [`BatchKey`] it must
//! hold the lock for that key. Locks are scoped per position and batch, not
//! per trace, so independent branches of one trace progress in parallel.
//!
//! [`LocalLocks`] serves a single process. [`DistributedLocks`] delegates to
//! a [`LockCoordinator`] shared by many processes; when the coordinator
//! revokes a held lock the holder's [`LockToken`] is invalidated and every
//! subscribed listener is told, so the in-flight update can be abandoned.
//!
//! [`BatchKey`]: crate::core::BatchKey

mod distributed;
mod local;
mod token;

pub use distributed::{DistributedLocks, InMemoryCoordinator, LockCoordinator, RevocationListener};
pub use local::LocalLocks;
pub use token::{LockSignal, LockToken};

use crate::core::BatchKey;
use crate::errors::FlowResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Callback fired with the key and reason when a held lock is revoked.
pub type LockListener = Arc<dyn Fn(&BatchKey, &str) + Send + Sync>;

/// Exclusive per-key ownership.
#[async_trait]
pub trait FlowLocks: Send + Sync {
    /// Acquires the lock for `key`, waiting at most `wait`.
    ///
    /// Returns `None` if the key stayed held by someone else.
    async fn acquire(&self, key: &BatchKey, wait: Duration) -> FlowResult<Option<LockToken>>;

    /// Releases a held lock. Releasing a revoked lock is a no-op.
    async fn release(&self, token: LockToken) -> FlowResult<()>;

    /// Registers a listener for forced revocations.
    fn subscribe(&self, listener: LockListener);
}
