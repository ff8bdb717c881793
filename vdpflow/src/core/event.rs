//! Typed outbox events.
//!
//! Saga steps and pipeline stage transitions are reported as
//! [`OutboxEvent`]s; external log and metrics collaborators consume them
//! through an [`EventSink`](crate::events::EventSink).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::PipelineStage;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A forward saga step completed.
    #[serde(rename = "saga.step_completed")]
    StepCompleted,
    /// A compensation ran successfully.
    #[serde(rename = "saga.step_compensated")]
    StepCompensated,
    /// A compensation failed and was dead-lettered.
    #[serde(rename = "saga.compensation_failed")]
    CompensationFailed,
    /// Every step of a saga completed.
    #[serde(rename = "saga.completed")]
    SagaCompleted,
    /// A saga finished its compensation run.
    #[serde(rename = "saga.compensated")]
    SagaCompensated,
    /// A pipeline item entered a stage.
    #[serde(rename = "pipeline.stage_transition")]
    StageTransition,
    /// A pipeline item moved to the failed state.
    #[serde(rename = "pipeline.item_failed")]
    ItemFailed,
    /// A pipeline item completed `finalize`.
    #[serde(rename = "pipeline.item_finalized")]
    ItemFinalized,
    /// The consensus gate produced a decision.
    #[serde(rename = "consensus.decided")]
    ConsensusDecided,
}

impl EventType {
    /// The dotted wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StepCompleted => "saga.step_completed",
            Self::StepCompensated => "saga.step_compensated",
            Self::CompensationFailed => "saga.compensation_failed",
            Self::SagaCompleted => "saga.completed",
            Self::SagaCompensated => "saga.compensated",
            Self::StageTransition => "pipeline.stage_transition",
            Self::ItemFailed => "pipeline.item_failed",
            Self::ItemFinalized => "pipeline.item_finalized",
            Self::ConsensusDecided => "consensus.decided",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published to the outbox.
///
/// The serialized form always carries `correlation_id`, `step_or_stage`
/// and an RFC 3339 `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// The event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Correlation id of the item or change request.
    pub correlation_id: String,
    /// Saga step id or pipeline stage name.
    pub step_or_stage: String,
    /// When the event occurred (RFC 3339).
    pub timestamp: String,
    /// Owning saga, for saga events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<String>,
    /// Free-form detail (error reason, decision, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OutboxEvent {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(
        event_type: EventType,
        correlation_id: impl Into<String>,
        step_or_stage: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            correlation_id: correlation_id.into(),
            step_or_stage: step_or_stage.into(),
            timestamp: crate::utils::iso_timestamp(),
            saga_id: None,
            detail: None,
        }
    }

    /// Attaches the owning saga id.
    #[must_use]
    pub fn with_saga(mut self, saga_id: impl Into<String>) -> Self {
        self.saga_id = Some(saga_id.into());
        self
    }

    /// Attaches detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Creates a "saga.step_completed" event.
    #[must_use]
    pub fn step_completed(saga_id: &str, correlation_id: &str, step_id: &str) -> Self {
        Self::new(EventType::StepCompleted, correlation_id, step_id).with_saga(saga_id)
    }

    /// Creates a "saga.step_compensated" event.
    #[must_use]
    pub fn step_compensated(saga_id: &str, correlation_id: &str, step_id: &str) -> Self {
        Self::new(EventType::StepCompensated, correlation_id, step_id).with_saga(saga_id)
    }

    /// Creates a "pipeline.stage_transition" event.
    #[must_use]
    pub fn stage_transition(correlation_id: &str, stage: PipelineStage) -> Self {
        Self::new(EventType::StageTransition, correlation_id, stage.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = OutboxEvent::step_completed("saga-1", "corr-1", "gcs-upload");
        assert_eq!(event.event_type, EventType::StepCompleted);
        assert_eq!(event.saga_id.as_deref(), Some("saga-1"));
        assert_eq!(event.step_or_stage, "gcs-upload");
        assert!(crate::utils::parse_timestamp(&event.timestamp).is_ok());
    }

    #[test]
    fn test_event_wire_format() {
        let event = OutboxEvent::stage_transition("corr-9", PipelineStage::LoadBq);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "pipeline.stage_transition");
        assert_eq!(json["correlation_id"], "corr-9");
        assert_eq!(json["step_or_stage"], "load_bq");
        assert!(json.get("saga_id").is_none());
    }

    #[test]
    fn test_event_type_display_matches_serde() {
        for event_type in [EventType::SagaCompensated, EventType::ConsensusDecided] {
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{event_type}\""));
        }
    }
}
