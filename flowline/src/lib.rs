//! # Flowline
//!
//! A push-driven workflow execution engine with persistent flow contexts.
//!
//! Flowline compiles a declarative graph of nodes and transitions into a
//! live pipeline and drives many concurrent flow instances through it:
//!
//! - **Graph model**: state, condition, gate, parallel and end nodes with
//!   ordered, guarded transitions, validated once at build time
//! - **Persistent contexts**: every step of every instance is a stored
//!   [`FlowContext`](core::FlowContext); any worker can pick up any context
//! - **Exclusive advancement**: per-position locks, local or distributed,
//!   with revocation notification
//! - **Failure classification**: retryable failures are rescheduled with
//!   backoff, fatal ones end in ERROR
//! - **Pluggable work**: local, remote (with failover) and async jobers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowline::prelude::*;
//! use serde_json::json;
//!
//! let definition = FlowDefinition::builder("orders", "1")
//!     .node(FlowNode::state("price").to("check"))
//!     .node(
//!         FlowNode::condition("check")
//!             .when(Guard::gt("total", 100), "review")
//!             .otherwise("done"),
//!     )
//!     .node(FlowNode::gate("review").to("done"))
//!     .node(FlowNode::end("done"))
//!     .build()?;
//!
//! let engine = FlowEngine::new(FlowServices::in_memory());
//! engine.register(engine.builder(definition).build()?);
//!
//! let trace = engine.offer("orders:1", vec![json!({"total": 250})]).await?;
//! assert_eq!(engine.trace_status(trace).await?, TraceStatus::Paused);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod jober;
pub mod lock;
pub mod observability;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, LockConfig, LockLostPolicy};
    pub use crate::core::{BatchKey, FlowContext, FlowData, FlowStatus};
    pub use crate::errors::{
        DefinitionError, DefinitionErrorInfo, FailureKind, FlowError, FlowResult, JoberError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{FanIn, FlowDefinition, FlowEvent, FlowNode, Guard, NodeKind};
    pub use crate::jober::{
        AsyncJober, EchoJober, GeneralJober, Jober, JoberOutput, LocalJober,
    };
    pub use crate::lock::{DistributedLocks, FlowLocks, LocalLocks};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::persistence::{
        FlowContextRepo, InMemoryContextRepo, InMemoryRetryRepo, RetryRepo,
    };
    pub use crate::pipeline::{
        AdvanceOutcome, FlowEngine, FlowPipeline, FlowServices, PipelineBuilder, TraceStatus,
    };
    pub use crate::retry::{RetryConfig, RetryScheduler};
}
