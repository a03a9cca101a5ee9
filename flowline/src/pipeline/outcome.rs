use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of one attempt to advance the contexts under a batch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Contexts were taken and moved on, archived or failed.
    Advanced {
        /// Contexts taken from PENDING.
        processed: usize,
        /// Successor contexts created downstream.
        emitted: usize,
        /// Contexts moved to RETRYABLE or ERROR.
        failed: usize,
    },
    /// A fan-in node is still below its threshold.
    Waiting {
        /// Contexts present.
        arrived: usize,
        /// Threshold.
        required: usize,
    },
    /// Contexts are parked at a gate or async node.
    Parked {
        /// Parked contexts.
        count: usize,
    },
    /// Nothing pending under the key.
    Idle,
    /// Another worker holds the key.
    LockDenied,
}

impl AdvanceOutcome {
    /// Returns true if the attempt committed a transition.
    #[must_use]
    pub fn is_advanced(&self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}

/// Summary of all contexts of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Some contexts are pending, processing or waiting for a retry.
    Running,
    /// Nothing is running and some contexts wait for a resume.
    Paused,
    /// Nothing is running or parked and some contexts failed.
    Failed,
    /// Every context was archived.
    Archived,
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Failed => write!(f, "failed"),
            Self::Archived => write!(f, "archived"),
        }
    }
}
