//! Error types for the flowline engine.
//!
//! The taxonomy separates defects that are caught when a definition is
//! compiled from failures that happen while contexts are being advanced.
//! Task failures never escape the pipeline as errors: they are converted into
//! context statuses at the transform boundary. Everything else in this module
//! aborts the current worker's attempt.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias used across the crate.
pub type FlowResult<T> = Result<T, FlowError>;

/// The main error type for flowline operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The flow definition is malformed.
    #[error("{0}")]
    Definition(#[from] DefinitionError),

    /// A condition node had no matching branch and no catch-all.
    #[error("No guard matched at condition node '{node}' for context {context_id}")]
    GuardExhausted {
        /// The condition node.
        node: String,
        /// The context that could not be routed.
        context_id: Uuid,
    },

    /// A task failed with a transient error.
    #[error("Retryable task failure at '{node}': {message}")]
    TaskRetryable {
        /// The node whose jober failed.
        node: String,
        /// Failure description.
        message: String,
    },

    /// A task failed permanently.
    #[error("Fatal task failure at '{node}': {message}")]
    TaskFatal {
        /// The node whose jober failed.
        node: String,
        /// Failure description.
        message: String,
    },

    /// A held lock was revoked before the update could be committed.
    #[error("Lock lost for '{key}'")]
    LockLost {
        /// The revoked lock key.
        key: String,
    },

    /// Another worker holds the lock.
    #[error("Lock denied for '{key}'")]
    LockDenied {
        /// The contended lock key.
        key: String,
    },

    /// The store reported fewer affected rows than expected.
    #[error(
        "Persistence inconsistency during {operation}: expected {expected} rows, affected {actual}"
    )]
    PersistenceInconsistency {
        /// The store operation.
        operation: String,
        /// Rows the caller expected to touch.
        expected: usize,
        /// Rows the store reported as touched.
        actual: usize,
    },

    /// A context id did not resolve to a stored context.
    #[error("Flow context not found: {0}")]
    ContextNotFound(Uuid),

    /// A resume targeted a context that is not parked at a gate or async task.
    #[error("Flow context {context_id} is not parked (status {status} at '{position}')")]
    NotParked {
        /// The context id.
        context_id: Uuid,
        /// Its current position.
        position: String,
        /// Its current status.
        status: String,
    },

    /// A resume targeted a context that has already been resumed.
    #[error("Flow context {0} was already resumed")]
    AlreadyResumed(Uuid),

    /// No context belongs to the trace.
    #[error("Trace not found: {0}")]
    TraceNotFound(Uuid),

    /// No compiled pipeline is registered for the stream.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// A status transition violated the context lifecycle.
    #[error("Invalid status transition for {context_id}: {from} -> {to}")]
    InvalidTransition {
        /// The context id.
        context_id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Returns true for failures that another attempt may overcome.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TaskRetryable { .. } | Self::LockDenied { .. })
    }

    /// Builds a persistence error unless the affected count matches.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::PersistenceInconsistency`] on a mismatch.
    pub fn check_affected(operation: &str, expected: usize, actual: usize) -> FlowResult<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::PersistenceInconsistency {
                operation: operation.to_string(),
                expected,
                actual,
            })
        }
    }
}

/// Diagnostic metadata attached to a definition error.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DefinitionErrorInfo {
    /// Error code (e.g., "FLOW-DEF-UNREACHABLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl DefinitionErrorInfo {
    /// Creates new definition error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a flow definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DefinitionError {
    /// The error message.
    pub message: String,
    /// The nodes involved in the error.
    pub nodes: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<DefinitionErrorInfo>,
}

impl DefinitionError {
    /// Creates a new definition error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the nodes involved.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: DefinitionErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|i| i.code.as_str())
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient: the remote target was unavailable or out of capacity.
    Retryable,
    /// Permanent: bad input or a programming defect.
    Fatal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// The only error a jober may report.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} task failure: {message}")]
pub struct JoberError {
    /// How the failure should be handled.
    pub kind: FailureKind,
    /// Failure description.
    pub message: String,
}

impl JoberError {
    /// Creates a retryable failure.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    /// Creates a fatal failure.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }

    /// Returns true if the failure is transient.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    /// Converts into the pipeline-level error for the given node.
    #[must_use]
    pub fn into_flow_error(self, node: impl Into<String>) -> FlowError {
        match self.kind {
            FailureKind::Retryable => FlowError::TaskRetryable {
                node: node.into(),
                message: self.message,
            },
            FailureKind::Fatal => FlowError::TaskFatal {
                node: node.into(),
                message: self.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_info() {
        let err = DefinitionError::new("bad target")
            .with_nodes(vec!["a".to_string()])
            .with_error_info(
                DefinitionErrorInfo::new("FLOW-DEF-UNKNOWN_TARGET", "target missing")
                    .with_fix_hint("declare the node")
                    .with_context_entry("target", "b"),
            );

        assert_eq!(err.to_string(), "bad target");
        assert_eq!(err.code(), Some("FLOW-DEF-UNKNOWN_TARGET"));
        assert_eq!(err.nodes, vec!["a".to_string()]);
    }

    #[test]
    fn test_definition_error_converts() {
        let err: FlowError = DefinitionError::new("broken").into();
        assert!(matches!(err, FlowError::Definition(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_jober_error_classification() {
        let transient = JoberError::retryable("target down");
        assert!(transient.is_retryable());
        assert!(matches!(
            transient.into_flow_error("state1"),
            FlowError::TaskRetryable { .. }
        ));

        let fatal = JoberError::fatal("bad input");
        assert!(!fatal.is_retryable());
        assert!(matches!(fatal.into_flow_error("state1"), FlowError::TaskFatal { .. }));
    }

    #[test]
    fn test_check_affected() {
        assert!(FlowError::check_affected("update", 2, 2).is_ok());
        let err = FlowError::check_affected("update", 2, 1).unwrap_err();
        assert!(matches!(
            err,
            FlowError::PersistenceInconsistency { expected: 2, actual: 1, .. }
        ));
    }

    #[test]
    fn test_failure_kind_serialize() {
        let json = serde_json::to_string(&FailureKind::Retryable).unwrap();
        assert_eq!(json, r#""retryable""#);
    }
}
