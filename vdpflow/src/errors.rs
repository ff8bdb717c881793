//! Error types for the vdpflow orchestration layer.
//!
//! Errors fall into the families the orchestrator reacts to differently:
//! transient backend trouble, exhausted backends, failed compensations,
//! data-integrity problems and validation errors detected before any saga
//! starts. Each error reports a [`FailureKind`] that the DLQ classifier uses.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for vdpflow operations.
#[derive(Debug, Error)]
pub enum VdpflowError {
    /// Malformed input detected before a saga was created.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A network error or timeout talking to a backend.
    #[error("Transient error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// A single backend answered but the answer was unusable.
    #[error("Backend '{backend}' failed: {message}")]
    Backend {
        /// Backend name.
        backend: String,
        /// Description of the failure.
        message: String,
    },

    /// Every configured backend was skipped or failed.
    #[error("All backends unavailable (attempted: {})", attempted.join(", "))]
    BackendUnavailable {
        /// Backends that were attempted or skipped, in priority order.
        attempted: Vec<String>,
    },

    /// A forward saga step failed.
    #[error("Step '{step_id}' failed: {message}")]
    StepFailed {
        /// The failing step.
        step_id: String,
        /// Description of the failure.
        message: String,
    },

    /// A compensating action failed.
    #[error("Compensation for step '{step_id}' failed: {message}")]
    CompensationFailed {
        /// The step whose compensation failed.
        step_id: String,
        /// Description of the failure.
        message: String,
    },

    /// Stored data is inconsistent and needs a human.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Another saga is already running for this content key.
    #[error("Content key '{content_key}' is already in flight")]
    InFlight {
        /// The busy content key.
        content_key: String,
    },

    /// A pipeline item was asked to make an illegal stage move.
    #[error("Invalid transition for '{content_key}': {from} -> {to}")]
    InvalidTransition {
        /// The item's content key.
        content_key: String,
        /// Current stage or state.
        from: String,
        /// Requested stage or state.
        to: String,
    },

    /// A pipeline item does not exist.
    #[error("Pipeline item not found: {0}")]
    NotFound(String),

    /// The operation was abandoned by its caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for VdpflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl VdpflowError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    #[must_use]
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates a step failure.
    #[must_use]
    pub fn step_failed(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    /// Creates a compensation failure.
    #[must_use]
    pub fn compensation_failed(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CompensationFailed {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    /// Returns the failure family used for dead-letter classification.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { .. } | Self::Backend { .. } | Self::Cancelled(_) => {
                FailureKind::Transient
            }
            Self::BackendUnavailable { .. } => FailureKind::BackendUnavailable,
            Self::CompensationFailed { .. } => FailureKind::CompensationFailed,
            Self::DataIntegrity(_) => FailureKind::DataIntegrity,
            Self::Validation(_) | Self::Config(_) | Self::Serialization(_) => {
                FailureKind::Validation
            }
            Self::StepFailed { message, .. } => FailureKind::from_reason(message),
            Self::InFlight { .. }
            | Self::InvalidTransition { .. }
            | Self::NotFound(_)
            | Self::Io(_) => FailureKind::Unknown,
        }
    }

    /// Returns true if the router may move on and try another backend.
    ///
    /// Exhausting every backend is not retryable at this level; whether the
    /// item is re-enqueued later is decided by the DLQ classifier.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        if let Self::Validation(err) = self {
            map.insert("code".to_string(), serde_json::json!(err.code));
            if let Some(ref hint) = err.fix_hint {
                map.insert("fix_hint".to_string(), serde_json::json!(hint));
            }
        }
        map
    }
}

/// Failure family, as seen by the dead-letter classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout or network trouble.
    Transient,
    /// Every backend was exhausted.
    BackendUnavailable,
    /// A compensating action failed.
    CompensationFailed,
    /// Inconsistent stored data.
    DataIntegrity,
    /// Permanent input problem unrelated to infrastructure.
    Validation,
    /// Anything else.
    Unknown,
}

impl FailureKind {
    /// Guesses the failure family from a free-form reason string.
    #[must_use]
    pub fn from_reason(reason: &str) -> Self {
        let reason = reason.to_ascii_lowercase();
        if reason.contains("compensation_failed") || reason.contains("compensation failed") {
            Self::CompensationFailed
        } else if reason.contains("all backends unavailable") {
            Self::BackendUnavailable
        } else if reason.contains("integrity") {
            Self::DataIntegrity
        } else if reason.contains("timeout")
            || reason.contains("timed out")
            || reason.contains("network")
            || reason.contains("connection")
        {
            Self::Transient
        } else if reason.contains("validation") || reason.contains("malformed") {
            Self::Validation
        } else {
            Self::Unknown
        }
    }

    /// Returns true for failures worth retrying automatically.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transient | Self::BackendUnavailable)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::BackendUnavailable => write!(f, "backend_unavailable"),
            Self::CompensationFailed => write!(f, "compensation_failed"),
            Self::DataIntegrity => write!(f, "data_integrity"),
            Self::Validation => write!(f, "validation"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error raised when input is rejected before any saga is created.
#[derive(Debug, Clone, Error)]
#[error("Validation failed [{code}]: {message}")]
pub struct ValidationError {
    /// Machine-readable error code (e.g. "INGEST-001-EMPTY-KEY").
    pub code: String,
    /// The error message.
    pub message: String,
    /// The offending field, if any.
    pub field: Option<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            fix_hint: None,
        }
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("message".to_string(), serde_json::json!(self.message));
        if let Some(ref field) = self.field {
            map.insert("field".to_string(), serde_json::json!(field));
        }
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        map
    }
}

/// Result alias used across the crate.
pub type Result<T, E = VdpflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_creation() {
        let err = ValidationError::new("INGEST-001", "empty key")
            .with_field("content_key")
            .with_fix_hint("Provide a non-empty content key");

        assert_eq!(err.code, "INGEST-001");
        assert_eq!(err.field.as_deref(), Some("content_key"));
        assert!(err.to_string().contains("INGEST-001"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(VdpflowError::transient("socket closed").kind(), FailureKind::Transient);
        assert_eq!(
            VdpflowError::BackendUnavailable { attempted: vec!["a".into()] }.kind(),
            FailureKind::BackendUnavailable
        );
        assert_eq!(
            VdpflowError::compensation_failed("upload", "bucket gone").kind(),
            FailureKind::CompensationFailed
        );
        assert_eq!(
            VdpflowError::Validation(ValidationError::new("X", "bad")).kind(),
            FailureKind::Validation
        );
        assert_eq!(
            VdpflowError::step_failed("extract", "request timed out").kind(),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_backend_unavailable_message() {
        let err = VdpflowError::BackendUnavailable {
            attempted: vec!["primary".to_string(), "secondary".to_string()],
        };
        assert!(err.to_string().contains("All backends unavailable"));
        assert!(err.to_string().contains("primary, secondary"));
    }

    #[test]
    fn test_failure_kind_from_reason() {
        assert_eq!(FailureKind::from_reason("Gateway Timeout"), FailureKind::Transient);
        assert_eq!(FailureKind::from_reason("network unreachable"), FailureKind::Transient);
        assert_eq!(
            FailureKind::from_reason("compensation_failed"),
            FailureKind::CompensationFailed
        );
        assert_eq!(
            FailureKind::from_reason("malformed source content"),
            FailureKind::Validation
        );
        assert_eq!(FailureKind::from_reason("who knows"), FailureKind::Unknown);
    }

    #[test]
    fn test_retryable() {
        assert!(VdpflowError::transient("x").is_retryable());
        assert!(!VdpflowError::BackendUnavailable { attempted: vec![] }.is_retryable());
        assert!(!VdpflowError::DataIntegrity("dup".into()).is_retryable());
    }

    #[test]
    fn test_error_to_dict() {
        let err = VdpflowError::Validation(
            ValidationError::new("INGEST-002", "bad platform").with_fix_hint("use youtube"),
        );
        let dict = err.to_dict();
        assert_eq!(dict.get("kind").unwrap(), "validation");
        assert_eq!(dict.get("code").unwrap(), "INGEST-002");
        assert_eq!(dict.get("retryable").unwrap(), false);
    }
}
