//! Global tracing subscriber setup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::errors::{Result, VdpflowError};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = VdpflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(VdpflowError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Installs the global subscriber with `RUST_LOG` or [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns [`VdpflowError::Config`] if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    init_tracing_with_filter(format, DEFAULT_FILTER)
}

/// Installs the global subscriber, falling back to `default_filter` when
/// `RUST_LOG` is unset or invalid.
///
/// # Errors
///
/// Returns [`VdpflowError::Config`] if a global subscriber is already set.
pub fn init_tracing_with_filter(format: LogFormat, default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    installed.map_err(|err| VdpflowError::Config(format!("tracing subscriber: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "pretty");
    }

    #[test]
    fn test_second_init_is_an_error() {
        // The first call may lose to another test; the second never wins.
        let _ = init_tracing(LogFormat::Json);
        assert!(init_tracing(LogFormat::Pretty).is_err());
    }
}
