//! Retry policy and the scheduler that re-injects retryable batches.
//!
//! A retryable task failure moves its contexts to `RETRYABLE` and bumps the
//! retry record of their batch; the record carries the time the batch becomes
//! due. [`RetryScheduler`] polls for due records and hands them back to the
//! engine, which returns the contexts to `PENDING` and advances them again.

mod policy;
mod scheduler;

pub use policy::{BackoffStrategy, JitterStrategy, RetryConfig};
pub use scheduler::{RetryScheduler, SchedulerHandle};
