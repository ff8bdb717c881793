//! Dead-letter classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::errors::{FailureKind, VdpflowError};
use crate::resilience::BackoffConfig;
use crate::utils::iso_timestamp;

/// Reason recorded for a failed compensating action.
pub const COMPENSATION_FAILED_REASON: &str = "compensation_failed";

/// How a dead-lettered item is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqPolicy {
    /// Re-enqueue after a backoff delay.
    Retry,
    /// Park for a human.
    Manual,
    /// Drop, the input can never succeed.
    Discard,
}

impl fmt::Display for DlqPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Manual => write!(f, "manual"),
            Self::Discard => write!(f, "discard"),
        }
    }
}

/// A dead-letter record, exactly as published to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqMessage {
    /// Item key.
    pub content_key: String,
    /// Attempts made before this failure.
    pub retry_count: u32,
    /// When the failure was recorded (RFC 3339).
    pub failed_at: String,
    /// Human-readable failure reason.
    pub error_reason: String,
    /// Assigned policy.
    pub dlq_policy: DlqPolicy,
}

/// Input to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqRequest {
    /// Item key.
    pub content_key: String,
    /// Attempts made before this failure.
    pub retry_count: u32,
    /// Failure reason.
    pub error_reason: String,
    /// Failure family.
    pub kind: FailureKind,
}

impl DlqRequest {
    /// Creates a request from a free-form reason, guessing its family.
    #[must_use]
    pub fn new(content_key: impl Into<String>, retry_count: u32, error_reason: impl Into<String>) -> Self {
        let error_reason = error_reason.into();
        Self {
            content_key: content_key.into(),
            retry_count,
            kind: FailureKind::from_reason(&error_reason),
            error_reason,
        }
    }

    /// Creates a request from a typed error.
    #[must_use]
    pub fn from_error(content_key: impl Into<String>, retry_count: u32, error: &VdpflowError) -> Self {
        Self {
            content_key: content_key.into(),
            retry_count,
            error_reason: error.to_string(),
            kind: error.kind(),
        }
    }

    /// Creates a request for a failed compensation.
    #[must_use]
    pub fn compensation_failed(content_key: impl Into<String>, retry_count: u32) -> Self {
        Self {
            content_key: content_key.into(),
            retry_count,
            error_reason: COMPENSATION_FAILED_REASON.to_string(),
            kind: FailureKind::CompensationFailed,
        }
    }
}

/// Classifier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Retries allowed for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Re-enqueue delay schedule.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Unrecovered keys tracked for the recovery rate; the oldest are
    /// forgotten beyond this.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_outstanding() -> usize {
    10_000
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

impl DlqConfig {
    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Caps the unrecovered keys kept for the recovery rate.
    #[must_use]
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqDecision {
    /// The record to publish.
    pub message: DlqMessage,
    /// Failure family the decision was based on.
    pub kind: FailureKind,
    /// Delay before re-enqueueing, for `retry` only.
    pub retry_after: Option<Duration>,
}

impl DlqDecision {
    /// Returns the assigned policy.
    #[must_use]
    pub fn policy(&self) -> DlqPolicy {
        self.message.dlq_policy
    }

    /// Forces the decision to `manual`.
    #[must_use]
    pub fn into_manual(mut self) -> Self {
        self.message.dlq_policy = DlqPolicy::Manual;
        self.retry_after = None;
        self
    }
}

/// Assigns a handling policy to terminal failures.
///
/// - transient or backend-unavailable, budget left: `retry`
/// - transient or backend-unavailable, budget spent: `manual`
/// - compensation failure or data integrity: `manual`
/// - validation: `discard`
/// - anything unrecognised: `manual`
#[derive(Debug, Clone, Default)]
pub struct DlqClassifier {
    config: DlqConfig,
}

impl DlqClassifier {
    /// Creates a classifier.
    #[must_use]
    pub fn new(config: DlqConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    /// Classifies one failure. Pure apart from reading the clock.
    #[must_use]
    pub fn classify(&self, request: &DlqRequest) -> DlqDecision {
        let policy = match request.kind {
            FailureKind::Transient | FailureKind::BackendUnavailable => {
                if request.retry_count < self.config.max_retries {
                    DlqPolicy::Retry
                } else {
                    DlqPolicy::Manual
                }
            }
            FailureKind::CompensationFailed
            | FailureKind::DataIntegrity
            | FailureKind::Unknown => DlqPolicy::Manual,
            FailureKind::Validation => DlqPolicy::Discard,
        };

        let retry_after = (policy == DlqPolicy::Retry)
            .then(|| self.config.backoff.delay_for_attempt(request.retry_count));

        DlqDecision {
            message: DlqMessage {
                content_key: request.content_key.clone(),
                retry_count: request.retry_count,
                failed_at: iso_timestamp(),
                error_reason: request.error_reason.clone(),
                dlq_policy: policy,
            },
            kind: request.kind,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_timestamp;
    use pretty_assertions::assert_eq;

    fn classifier() -> DlqClassifier {
        DlqClassifier::new(DlqConfig::default().with_max_retries(3))
    }

    #[test]
    fn test_transient_within_budget_retries_with_backoff() {
        let decision = classifier().classify(&DlqRequest::new("youtube:abc", 1, "upstream timeout"));

        assert_eq!(decision.policy(), DlqPolicy::Retry);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_backoff_grows_with_retry_count() {
        let c = classifier();
        let first = c.classify(&DlqRequest::new("k", 0, "network reset")).retry_after;
        let third = c.classify(&DlqRequest::new("k", 2, "network reset")).retry_after;
        assert_eq!(first, Some(Duration::from_secs(1)));
        assert_eq!(third, Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_transient_budget_spent_goes_manual() {
        let decision = classifier().classify(&DlqRequest::new("k", 3, "timeout"));
        assert_eq!(decision.policy(), DlqPolicy::Manual);
        assert_eq!(decision.retry_after, None);
    }

    #[test]
    fn test_backend_unavailable_follows_budget() {
        let err = VdpflowError::BackendUnavailable {
            attempted: vec!["primary".into(), "secondary".into()],
        };
        let c = classifier();
        assert_eq!(c.classify(&DlqRequest::from_error("k", 0, &err)).policy(), DlqPolicy::Retry);
        assert_eq!(c.classify(&DlqRequest::from_error("k", 5, &err)).policy(), DlqPolicy::Manual);
    }

    #[test]
    fn test_compensation_failure_is_never_retried() {
        let decision = classifier().classify(&DlqRequest::compensation_failed("k", 0));
        assert_eq!(decision.policy(), DlqPolicy::Manual);
        assert_eq!(decision.message.error_reason, "compensation_failed");
    }

    #[test]
    fn test_data_integrity_is_manual() {
        let err = VdpflowError::DataIntegrity("duplicate warehouse row".into());
        let decision = classifier().classify(&DlqRequest::from_error("k", 0, &err));
        assert_eq!(decision.policy(), DlqPolicy::Manual);
    }

    #[test]
    fn test_validation_is_discarded() {
        let decision = classifier().classify(&DlqRequest::new("k", 0, "malformed source content"));
        assert_eq!(decision.policy(), DlqPolicy::Discard);
    }

    #[test]
    fn test_message_wire_format() {
        let decision = classifier().classify(&DlqRequest::new("tiktok:42", 2, "timeout"));
        let json = serde_json::to_value(&decision.message).unwrap();
        let obj = json.as_object().unwrap();

        let mut keys: Vec<_> = obj.keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["content_key", "dlq_policy", "error_reason", "failed_at", "retry_count"]
        );
        assert_eq!(json["dlq_policy"], "retry");
        assert!(parse_timestamp(json["failed_at"].as_str().unwrap()).is_ok());
    }
}
