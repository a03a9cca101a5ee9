//! Flow context status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle status of a flow context.
///
/// Within one attempt a context moves `Pending -> Processing` and then to one
/// of `Archived`, `Error` or `Retryable`. A retryable context re-enters
/// `Pending` when the retry scheduler picks it up. A processing context may
/// also be requeued to `Pending` after its lock was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Waiting at its position to be processed.
    #[default]
    Pending,
    /// Owned by the worker holding the position lock.
    Processing,
    /// Finished; terminal.
    Archived,
    /// Failed permanently; terminal.
    Error,
    /// Failed transiently; waiting for the retry scheduler.
    Retryable,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "ARCHIVED" => Ok(Self::Archived),
            "ERROR" => Ok(Self::Error),
            "RETRYABLE" => Ok(Self::Retryable),
            other => Err(format!("unknown flow status '{other}'")),
        }
    }
}

impl FlowStatus {
    /// Returns the persisted representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Archived => "ARCHIVED",
            Self::Error => "ERROR",
            Self::Retryable => "RETRYABLE",
        }
    }

    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived | Self::Error)
    }

    /// Returns true if moving to `next` respects the lifecycle.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Archived)
                | (Self::Processing, Self::Error)
                | (Self::Processing, Self::Retryable)
                | (Self::Processing, Self::Pending)
                | (Self::Retryable, Self::Pending)
                | (Self::Retryable, Self::Error)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_roundtrip() {
        for status in [
            FlowStatus::Pending,
            FlowStatus::Processing,
            FlowStatus::Archived,
            FlowStatus::Error,
            FlowStatus::Retryable,
        ] {
            assert_eq!(status.to_string().parse::<FlowStatus>(), Ok(status));
        }
        assert!("DONE".parse::<FlowStatus>().is_err());
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(FlowStatus::Archived.is_terminal());
        assert!(FlowStatus::Error.is_terminal());
        assert!(!FlowStatus::Pending.is_terminal());
        assert!(!FlowStatus::Retryable.is_terminal());
    }

    #[test]
    fn test_status_transitions() {
        assert!(FlowStatus::Pending.can_transition_to(FlowStatus::Processing));
        assert!(FlowStatus::Processing.can_transition_to(FlowStatus::Retryable));
        assert!(FlowStatus::Retryable.can_transition_to(FlowStatus::Pending));
        assert!(FlowStatus::Retryable.can_transition_to(FlowStatus::Error));

        assert!(!FlowStatus::Pending.can_transition_to(FlowStatus::Archived));
        assert!(!FlowStatus::Archived.can_transition_to(FlowStatus::Pending));
        assert!(!FlowStatus::Error.can_transition_to(FlowStatus::Processing));
        assert!(!FlowStatus::Processing.can_transition_to(FlowStatus::Processing));
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&FlowStatus::Retryable).unwrap();
        assert_eq!(json, r#""RETRYABLE""#);
    }
}
