//! Locks coordinated across processes.

use super::{FlowLocks, LockListener, LockSignal, LockToken};
use crate::core::BatchKey;
use crate::errors::FlowResult;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback fired with a lock path and the session that lost it.
pub type RevocationListener = Arc<dyn Fn(&str, Uuid) + Send + Sync>;

/// An external lock service owning session-scoped lock paths.
///
/// Locks are not reentrant: a session that already holds a path is refused
/// a second time.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Takes `path` for `session` if it is free.
    async fn try_lock(&self, path: &str, session: Uuid) -> FlowResult<bool>;

    /// Frees `path` if `session` holds it.
    async fn unlock(&self, path: &str, session: Uuid) -> FlowResult<bool>;

    /// Registers a listener for forced revocations.
    fn on_revoked(&self, listener: RevocationListener);
}

/// A coordinator living in process memory, for tests and demos.
///
/// Sessions can be expired to simulate a lost connection to a real lock
/// service: every path held by the session is freed and revocation
/// listeners fire.
#[derive(Default)]
pub struct InMemoryCoordinator {
    owners: Mutex<HashMap<String, Uuid>>,
    listeners: RwLock<Vec<RevocationListener>>,
}

impl InMemoryCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session holding `path`.
    #[must_use]
    pub fn owner_of(&self, path: &str) -> Option<Uuid> {
        self.owners.lock().get(path).copied()
    }

    /// Expires `session`, revoking all of its paths. Returns how many.
    pub fn expire_session(&self, session: Uuid) -> usize {
        let revoked: Vec<String> = {
            let mut owners = self.owners.lock();
            let paths: Vec<String> = owners
                .iter()
                .filter(|(_, owner)| **owner == session)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                owners.remove(path);
            }
            paths
        };
        for path in &revoked {
            self.notify(path, session);
        }
        revoked.len()
    }

    /// Revokes a single path from whoever holds it.
    pub fn revoke(&self, path: &str) -> bool {
        let owner = self.owners.lock().remove(path);
        match owner {
            Some(session) => {
                self.notify(path, session);
                true
            }
            None => false,
        }
    }

    fn notify(&self, path: &str, session: Uuid) {
        for listener in self.listeners.read().iter() {
            listener(path, session);
        }
    }
}

impl std::fmt::Debug for InMemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCoordinator")
            .field("held", &self.owners.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockCoordinator for InMemoryCoordinator {
    async fn try_lock(&self, path: &str, session: Uuid) -> FlowResult<bool> {
        let mut owners = self.owners.lock();
        if owners.contains_key(path) {
            return Ok(false);
        }
        owners.insert(path.to_string(), session);
        Ok(true)
    }

    async fn unlock(&self, path: &str, session: Uuid) -> FlowResult<bool> {
        let mut owners = self.owners.lock();
        if owners.get(path) == Some(&session) {
            owners.remove(path);
            return Ok(true);
        }
        Ok(false)
    }

    fn on_revoked(&self, listener: RevocationListener) {
        self.listeners.write().push(listener);
    }
}

struct HeldPath {
    key: BatchKey,
    signal: Arc<LockSignal>,
}

/// Locks held through a [`LockCoordinator`] on behalf of one worker session.
pub struct DistributedLocks {
    coordinator: Arc<dyn LockCoordinator>,
    session: Uuid,
    namespace: String,
    poll_interval: Duration,
    held: Arc<DashMap<String, HeldPath>>,
    listeners: Arc<RwLock<Vec<LockListener>>>,
}

impl DistributedLocks {
    /// Opens a new session on `coordinator`.
    #[must_use]
    pub fn new(coordinator: Arc<dyn LockCoordinator>, namespace: impl Into<String>) -> Self {
        let session = Uuid::new_v4();
        let held: Arc<DashMap<String, HeldPath>> = Arc::new(DashMap::new());
        let listeners: Arc<RwLock<Vec<LockListener>>> = Arc::new(RwLock::new(Vec::new()));

        {
            let held = held.clone();
            let listeners = listeners.clone();
            coordinator.on_revoked(Arc::new(move |path: &str, owner: Uuid| {
                if owner != session {
                    return;
                }
                let Some((_, lost)) = held.remove(path) else {
                    return;
                };
                let reason = format!("lock {path} revoked from session {session}");
                warn!(lock = %lost.key, %session, "Distributed lock revoked");
                lost.signal.invalidate(reason.clone());
                for listener in listeners.read().iter() {
                    listener(&lost.key, &reason);
                }
            }));
        }

        Self {
            coordinator,
            session,
            namespace: namespace.into(),
            poll_interval: Duration::from_millis(10),
            held,
            listeners,
        }
    }

    /// Sets how often a waiting acquire polls the coordinator.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns this worker's session id.
    #[must_use]
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Returns the coordinator path for `key`.
    #[must_use]
    pub fn path_for(&self, key: &BatchKey) -> String {
        let digest = Sha256::digest(key.to_string().as_bytes());
        format!("/{}/locks/{}", self.namespace, hex::encode(&digest[..16]))
    }

    async fn try_acquire(&self, key: &BatchKey, path: &str) -> FlowResult<Option<LockToken>> {
        if !self.coordinator.try_lock(path, self.session).await? {
            return Ok(None);
        }
        let signal = Arc::new(LockSignal::new());
        self.held.insert(
            path.to_string(),
            HeldPath {
                key: key.clone(),
                signal: signal.clone(),
            },
        );
        debug!(lock = %key, path, "Distributed lock acquired");
        Ok(Some(LockToken::new(key.clone(), self.session, signal)))
    }
}

impl std::fmt::Debug for DistributedLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLocks")
            .field("session", &self.session)
            .field("namespace", &self.namespace)
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FlowLocks for DistributedLocks {
    async fn acquire(&self, key: &BatchKey, wait: Duration) -> FlowResult<Option<LockToken>> {
        let path = self.path_for(key);
        let deadline = Instant::now() + wait;
        loop {
            if let Some(token) = self.try_acquire(key, &path).await? {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn release(&self, token: LockToken) -> FlowResult<()> {
        let path = self.path_for(token.key());
        let ours = self
            .held
            .remove_if(&path, |_, held| Arc::ptr_eq(&held.signal, token.signal()))
            .is_some();
        if ours {
            self.coordinator.unlock(&path, self.session).await?;
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

    fn workers(n: usize) -> (Arc<InMemoryCoordinator>, Vec<DistributedLocks>) {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let locks = (0..n)
            .map(|_| DistributedLocks::new(coordinator.clone(), "flowline"))
            .collect();
        (coordinator, locks)
    }

    #[tokio::test]
    async fn test_exclusive_across_sessions() {
        let (coordinator, workers) = workers(2);
        let key = key();

        let token = workers[0].acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        assert!(workers[1].acquire(&key, Duration::ZERO).await.unwrap().is_none());
        assert_eq!(coordinator.owner_of(&workers[0].path_for(&key)), Some(workers[0].session()));

        workers[0].release(token).await.unwrap();
        assert!(workers[1].acquire(&key, Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_not_reentrant_within_a_session() {
        let (_, workers) = workers(1);
        let key = key();
        let _token = workers[0].acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        assert!(workers[0].acquire(&key, Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiting_acquire_polls_until_free() {
        let (_, mut workers) = workers(2);
        let second = Arc::new(workers.pop().unwrap().with_poll_interval(Duration::from_millis(5)));
        let first = workers.pop().unwrap();
        let key = key();
        let token = first.acquire(&key, Duration::ZERO).await.unwrap().unwrap();

        let waiter = {
            let second = second.clone();
            let key = key.clone();
            tokio::spawn(async move { second.acquire(&key, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.release(token).await.unwrap();
        assert!(waiter.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_expiry_invalidates_tokens() {
        let (coordinator, workers) = workers(2);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        workers[0].subscribe(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let a = workers[0].acquire(&key(), Duration::ZERO).await.unwrap().unwrap();
        let b = workers[0].acquire(&key(), Duration::ZERO).await.unwrap().unwrap();
        let other = workers[1].acquire(&key(), Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(coordinator.expire_session(workers[0].session()), 2);
        assert!(!a.is_valid());
        assert!(!b.is_valid());
        assert!(other.is_valid());
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // The lost key is free for another session; releasing the stale token is harmless.
        assert!(workers[1].acquire(a.key(), Duration::ZERO).await.unwrap().is_some());
        workers[0].release(a).await.unwrap();
        assert_eq!(coordinator.owner_of(&workers[1].path_for(b.key())), None);
    }

    #[tokio::test]
    async fn test_single_path_revocation() {
        let (coordinator, workers) = workers(1);
        let key = key();
        let token = workers[0].acquire(&key, Duration::ZERO).await.unwrap().unwrap();
        assert!(coordinator.revoke(&workers[0].path_for(&key)));
        assert!(token.ensure_valid().is_err());
        assert!(!coordinator.revoke(&workers[0].path_for(&key)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_sessions_single_winner() {
        let (_, workers) = workers(8);
        let key = key();
        let mut handles = Vec::new();
        for worker in workers {
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                worker.acquire(&key, Duration::ZERO).await.unwrap().is_some()
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
