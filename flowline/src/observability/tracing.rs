//! Subscriber installation and span helpers for flowline.
//!
//! Every log line the engine writes carries `stream_id`, `position` and
//! `to_batch`, either as event fields or through the span opened by
//! [`batch_span`] around each locked step.

use crate::core::BatchKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns false if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    installed.is_ok()
}

/// Opens the span a worker holds while it owns `key`.
#[must_use]
pub fn batch_span(key: &BatchKey) -> Span {
    tracing::debug_span!(
        "flow.step",
        stream_id = %key.stream_id,
        position = %key.position,
        to_batch = ?key.to_batch,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "text");
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = init_tracing(LogFormat::Text);
        // A second install never succeeds once any subscriber is global.
        assert!(!init_tracing(LogFormat::Json));
        let _ = first;
    }

    #[test]
    fn test_batch_span_does_not_panic_without_subscriber() {
        let key = BatchKey::new("s:1", "a", None);
        let span = batch_span(&key);
        let _entered = span.enter();
    }
}
