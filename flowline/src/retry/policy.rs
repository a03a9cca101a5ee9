//! Backoff and jitter for scheduled retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(retry - 1)
    #[default]
    Exponential,
    /// delay = base * retry
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to spread retries of many batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, previous * 3))
    Decorrelated,
}

/// How task failures are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed per batch before its contexts are forced to ERROR.
    pub max_retries: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Immediate retries, for tests and demos.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self::new()
            .with_max_retries(max_retries)
            .with_base_delay_ms(0)
            .with_jitter(JitterStrategy::None)
    }

    fn backoff(&self, retry: u32) -> u64 {
        let base = self.base_delay_ms;
        let step = retry.max(1);
        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(step - 1)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(step)),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }

    /// Returns the delay before the `retry`-th retry (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let floor = self.base_delay_ms.min(self.max_delay_ms);
        let previous = if retry <= 1 { floor } else { self.backoff(retry - 1) };
        let ceiling = previous.saturating_mul(3).min(self.max_delay_ms);
        let millis = self
            .jitter_strategy
            .apply(delay, floor, ceiling, &mut rand::thread_rng());
        Duration::from_millis(millis)
    }
}

impl JitterStrategy {
    fn apply(self, delay: u64, floor: u64, ceiling: u64, rng: &mut impl Rng) -> u64 {
        match self {
            Self::None => delay,
            Self::Full => rng.gen_range(0..=delay),
            Self::Equal => delay / 2 + rng.gen_range(0..=delay - delay / 2),
            Self::Decorrelated => rng.gen_range(floor..=ceiling.max(floor)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::Full);
    }

    #[test]
    fn test_exponential_without_jitter() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));

        let constant = linear.with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(7), Duration::from_millis(100));
    }

    #[test]
    fn test_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        assert_eq!(config.delay_for(20), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_bounds() {
        let full = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        let equal = full.clone().with_jitter(JitterStrategy::Equal);
        let decorrelated = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000)
            .with_jitter(JitterStrategy::Decorrelated);

        for _ in 0..20 {
            assert!(full.delay_for(1) <= Duration::from_millis(100));
            let d = equal.delay_for(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
            let d = decorrelated.delay_for(3);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_immediate() {
        let config = RetryConfig::immediate(5);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.delay_for(4), Duration::ZERO);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_retries": 7, "jitter_strategy": "none"}"#).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
        assert_eq!(config.base_delay_ms, 1000);
    }
}
