//! Lock ownership tokens and their invalidation signal.

use crate::core::BatchKey;
use crate::errors::{FlowError, FlowResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

type InvalidationCallback = Box<dyn Fn(&str) + Send + Sync>;

/// One-shot signal raised when a held lock is forcibly taken away.
///
/// Only the first reason is kept. Callbacks registered after the signal was
/// raised run immediately.
#[derive(Default)]
pub struct LockSignal {
    invalidated: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<InvalidationCallback>>,
}

impl LockSignal {
    /// Creates a raised-never signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    pub fn invalidate(&self, reason: impl Into<String>) {
        if self
            .invalidated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let reason = reason.into();
        *self.reason.write() = Some(reason.clone());

        for callback in self.callbacks.read().iter() {
            let call = std::panic::AssertUnwindSafe(|| callback(&reason));
            if let Err(e) = std::panic::catch_unwind(call) {
                warn!("Lock invalidation callback panicked: {:?}", e);
            }
        }
    }

    /// Registers a callback receiving the invalidation reason.
    pub fn on_invalidated<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Some(reason) = self.reason() {
            callback(&reason);
        } else {
            self.callbacks.write().push(Box::new(callback));
        }
    }

    /// Returns true once raised.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Returns the first invalidation reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }
}

impl std::fmt::Debug for LockSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSignal")
            .field("invalidated", &self.is_invalidated())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Proof of ownership of one lock key.
#[derive(Debug, Clone)]
pub struct LockToken {
    key: BatchKey,
    owner: Uuid,
    signal: Arc<LockSignal>,
}

impl LockToken {
    /// Creates a token for `key` owned by `owner`.
    #[must_use]
    pub fn new(key: BatchKey, owner: Uuid, signal: Arc<LockSignal>) -> Self {
        Self { key, owner, signal }
    }

    /// Returns the locked key.
    #[must_use]
    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    /// Returns the owner id.
    #[must_use]
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Returns the invalidation signal.
    #[must_use]
    pub fn signal(&self) -> &Arc<LockSignal> {
        &self.signal
    }

    /// Returns true while the lock has not been revoked.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.signal.is_invalidated()
    }

    /// Checks the lock before a commit.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::LockLost`] once the lock was revoked.
    pub fn ensure_valid(&self) -> FlowResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(FlowError::LockLost {
                key: self.key.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn token() -> LockToken {
        LockToken::new(
            BatchKey::new("s:1", "state1", Some(Uuid::new_v4())),
            Uuid::new_v4(),
            Arc::new(LockSignal::new()),
        )
    }

    #[test]
    fn test_token_valid_until_invalidated() {
        let token = token();
        assert!(token.ensure_valid().is_ok());

        token.signal().invalidate("session expired");
        assert!(!token.is_valid());
        assert!(matches!(token.ensure_valid(), Err(FlowError::LockLost { .. })));
        assert_eq!(token.signal().reason().as_deref(), Some("session expired"));
    }

    #[test]
    fn test_first_reason_wins_and_callbacks_fire_once() {
        let signal = LockSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        signal.on_invalidated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signal.invalidate("first");
        signal.invalidate("second");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let signal = LockSignal::new();
        signal.invalidate("gone");

        let seen = Arc::new(RwLock::new(None));
        let slot = seen.clone();
        signal.on_invalidated(move |reason| *slot.write() = Some(reason.to_string()));
        assert_eq!(seen.read().as_deref(), Some("gone"));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let signal = LockSignal::new();
        signal.on_invalidated(|_| panic!("listener bug"));
        signal.invalidate("revoked");
        assert!(signal.is_invalidated());
    }
}
