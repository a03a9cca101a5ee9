//! The context and retry-record persistence contracts.
//!
//! The store is the single source of truth for context status: the pipeline
//! re-reads what it needs under the position lock and never trusts an
//! in-memory copy across calls. Every write reports the number of rows it
//! touched so that callers can detect a store that silently dropped a write.

mod memory;
mod repo;
mod retry;
#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(test)]
mod conformance_tests;

pub use memory::{InMemoryContextRepo, InMemoryRetryRepo};
pub use repo::FlowContextRepo;
pub use retry::{RetryRecord, RetryRepo};
#[cfg(feature = "sqlite")]
pub use sqlite::{connect_pool, SqliteContextRepo, SqliteRetryRepo};
