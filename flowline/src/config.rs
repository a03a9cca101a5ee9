//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document or an empty
//! environment yields a working configuration.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// What to do with contexts whose lock was revoked mid-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLostPolicy {
    /// Leave the contexts in their last committed state and surface the
    /// loss to the caller.
    #[default]
    Abandon,
    /// Return the contexts to PENDING under a fresh lock and advance them
    /// again.
    Requeue,
}

impl FromStr for LockLostPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abandon" => Ok(Self::Abandon),
            "requeue" => Ok(Self::Requeue),
            other => Err(format!("unknown lock-lost policy '{other}'")),
        }
    }
}

/// Lock acquisition settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long internal emission waits for a contended lock.
    pub wait_ms: u64,
    /// How often distributed acquisition polls while waiting.
    pub poll_interval_ms: u64,
    /// Handling of revoked locks.
    pub lost_policy: LockLostPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: 5000,
            poll_interval_ms: 10,
            lost_policy: LockLostPolicy::Abandon,
        }
    }
}

impl LockConfig {
    /// Returns the acquisition wait.
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    /// Returns the polling interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry policy for task failures.
    pub retry: RetryConfig,
    /// Lock settings.
    pub lock: LockConfig,
    /// Per-call timeout for remote jobers.
    pub remote_timeout_ms: u64,
    /// Retry scheduler polling interval.
    pub scheduler_interval_ms: u64,
    /// Maximum retry records re-injected per scheduler tick.
    pub scheduler_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
            remote_timeout_ms: 30_000,
            scheduler_interval_ms: 1_000,
            scheduler_batch: 100,
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `FLOWLINE_*` variables over the defaults.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] but reading from `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        apply(&lookup, "FLOWLINE_MAX_RETRIES", &mut config.retry.max_retries);
        apply(&lookup, "FLOWLINE_RETRY_BASE_DELAY_MS", &mut config.retry.base_delay_ms);
        apply(&lookup, "FLOWLINE_RETRY_MAX_DELAY_MS", &mut config.retry.max_delay_ms);
        apply(&lookup, "FLOWLINE_LOCK_WAIT_MS", &mut config.lock.wait_ms);
        apply(&lookup, "FLOWLINE_LOCK_POLL_MS", &mut config.lock.poll_interval_ms);
        apply(&lookup, "FLOWLINE_LOCK_LOST_POLICY", &mut config.lock.lost_policy);
        apply(&lookup, "FLOWLINE_REMOTE_TIMEOUT_MS", &mut config.remote_timeout_ms);
        apply(&lookup, "FLOWLINE_SCHEDULER_INTERVAL_MS", &mut config.scheduler_interval_ms);
        apply(&lookup, "FLOWLINE_SCHEDULER_BATCH", &mut config.scheduler_batch);
        config
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the lock settings.
    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the lock-lost policy.
    #[must_use]
    pub fn with_lock_lost_policy(mut self, policy: LockLostPolicy) -> Self {
        self.lock.lost_policy = policy;
        self
    }

    /// Sets the lock acquisition wait.
    #[must_use]
    pub fn with_lock_wait_ms(mut self, wait_ms: u64) -> Self {
        self.lock.wait_ms = wait_ms;
        self
    }

    /// Sets the remote call timeout.
    #[must_use]
    pub fn with_remote_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.remote_timeout_ms = timeout_ms;
        self
    }

    /// Sets the scheduler polling interval.
    #[must_use]
    pub fn with_scheduler_interval_ms(mut self, interval_ms: u64) -> Self {
        self.scheduler_interval_ms = interval_ms;
        self
    }

    /// Returns the remote call timeout.
    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Returns the scheduler polling interval.
    #[must_use]
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }
}

fn apply<V>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut V)
where
    V: FromStr,
    V::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(e) => warn!(key, value = %raw, error = %e, "Ignoring invalid configuration value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.lock.wait(), Duration::from_secs(5));
        assert_eq!(config.lock.lost_policy, LockLostPolicy::Abandon);
        assert_eq!(config.remote_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("FLOWLINE_MAX_RETRIES", "5"),
            ("FLOWLINE_LOCK_LOST_POLICY", "Requeue"),
            ("FLOWLINE_REMOTE_TIMEOUT_MS", "not-a-number"),
            ("FLOWLINE_SCHEDULER_INTERVAL_MS", " 250 "),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|key| vars.get(key).map(ToString::to_string));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.lock.lost_policy, LockLostPolicy::Requeue);
        assert_eq!(config.remote_timeout_ms, 30_000);
        assert_eq!(config.scheduler_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_json() {
        let raw = r#"{"lock": {"lost_policy": "requeue"}, "retry": {"max_retries": 1}}"#;
        let config: EngineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.lock.lost_policy, LockLostPolicy::Requeue);
        assert_eq!(config.lock.wait_ms, 5000);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.scheduler_batch, 100);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_retry(RetryConfig::immediate(2))
            .with_lock_wait_ms(50)
            .with_lock_lost_policy(LockLostPolicy::Requeue)
            .with_remote_timeout_ms(100)
            .with_scheduler_interval_ms(20);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.lock.wait(), Duration::from_millis(50));
        assert_eq!(config.remote_timeout(), Duration::from_millis(100));
    }
}
