//! Observability utilities.

mod tracing;

pub use tracing::{batch_span, init_tracing, LogFormat};
