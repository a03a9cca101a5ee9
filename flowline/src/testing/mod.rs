//! Testing utilities for flowline pipelines.
//!
//! This module provides:
//! - Jobers with scripted behavior (flaky, failing, counting, gated)
//! - A dispatcher that records async jobs
//! - Ready-made flow definitions for the common graph shapes

mod jobers;
mod scenarios;

pub use jobers::{CountingJober, FailingJober, FlakyJober, GatedJober, RecordingDispatcher};
pub use scenarios::{branch_flow, fan_in_flow, gate_flow, linear_flow, parallel_flow};
