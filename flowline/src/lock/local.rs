//! Single-process locks.

use super::{FlowLocks, LockListener, LockSignal, LockToken};
use crate::core::BatchKey;
use crate::errors::FlowResult;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug)]
struct Held {
    owner: Uuid,
    signal: Arc<LockSignal>,
}

/// An in-memory lock table.
#[derive(Default)]
pub struct LocalLocks {
    held: DashMap<BatchKey, Held>,
    released: Notify,
    listeners: RwLock<Vec<LockListener>>,
}

impl LocalLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently held.
    #[must_use]
    pub fn is_held(&self, key: &BatchKey) -> bool {
        self.held.contains_key(key)
    }

    /// Returns the number of held keys.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Forcibly takes a lock away from its holder.
    ///
    /// Returns false if the key was not held.
    pub fn revoke(&self, key: &BatchKey, reason: &str) -> bool {
        let Some((key, held)) = self.held.remove(key) else {
            return false;
        };
        warn!(lock = %key, reason, "Local lock revoked");
        held.signal.invalidate(reason);
        for listener in self.listeners.read().iter() {
            listener(&key, reason);
        }
        self.released.notify_waiters();
        true
    }

    fn try_acquire(&self, key: &BatchKey) -> Option<LockToken> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let owner = Uuid::new_v4();
                let signal = Arc::new(LockSignal::new());
                slot.insert(Held {
                    owner,
                    signal: signal.clone(),
                });
                Some(LockToken::new(key.clone(), owner, signal))
            }
        }
    }
}

impl std::fmt::Debug for LocalLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLocks")
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FlowLocks for LocalLocks {
    async fn acquire(&self, key: &BatchKey, wait: Duration) -> FlowResult<Option<LockToken>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a release in between wakes us.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(token) = self.try_acquire(key) {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn release(&self, token: LockToken) -> FlowResult<()> {
        let removed = self
            .held
            .remove_if(token.key(), |_, held| held.owner == token.owner())
            .is_some();
        if removed {
            self.released.notify_waiters();
        }
        Ok(())
    }

    fn subscribe(&self, listener: LockListener) {
        self.listeners.write().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> BatchKey {
        BatchKey::new("s:1", "state1", Some(Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = LocalLocks::new();
        let key = key();

        let token = locks.acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        assert!(locks.is_held(&key));
        assert!(locks.acquire(&key, Duration::ZERO).await.unwrap().is_none());

        locks.release(token).await.unwrap();
        assert!(!locks.is_held(&key));
        assert!(locks.acquire(&key, Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = LocalLocks::new();
        let a = locks.acquire(&key(), Duration::ZERO).await.unwrap();
        let b = locks.acquire(&key(), Duration::ZERO).await.unwrap();
        assert!(a.is_some() && b.is_some());
        assert_eq!(locks.held_count(), 2);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = Arc::new(LocalLocks::new());
        let key = key();
        let token = locks.acquire(&key, Duration::ZERO).await.unwrap().unwrap();

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move { locks.acquire(&key, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(token).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let locks = LocalLocks::new();
        let key = key();
        let _held = locks.acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        let denied = locks.acquire(&key, Duration::from_millis(30)).await.unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn test_stale_release_does_not_free_new_owner() {
        let locks = LocalLocks::new();
        let key = key();
        let stale = locks.acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        assert!(locks.revoke(&key, "operator"));

        let _fresh = locks.acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        locks.release(stale).await.unwrap();
        assert!(locks.is_held(&key));
    }

    #[tokio::test]
    async fn test_revoke_invalidates_and_notifies() {
        let locks = LocalLocks::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        locks.subscribe(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let key = key();
        let token = locks.acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        assert!(locks.revoke(&key, "operator"));
        assert!(!token.is_valid());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!locks.revoke(&key, "again"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_acquirers_single_winner() {
        let locks = Arc::new(LocalLocks::new());
        let key = key();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire(&key, Duration::ZERO).await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
