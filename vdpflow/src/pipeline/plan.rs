//! The seam between the state machine and per-stage work.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::item::PipelineItem;
use crate::cancellation::CancellationToken;
use crate::core::PipelineStage;
use crate::errors::Result;
use crate::saga::SagaStep;

/// What a stage plan may read about the item being processed.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Item key.
    pub content_key: String,
    /// Source platform.
    pub platform: String,
    /// Correlation id.
    pub correlation_id: String,
    /// Attempt number.
    pub retry_count: u32,
    /// Item metadata.
    pub metadata: BTreeMap<String, String>,
    /// Outputs of earlier saga steps, keyed by step id.
    pub artifacts: serde_json::Map<String, serde_json::Value>,
    /// Cancels backend calls made by the stage.
    pub token: Arc<CancellationToken>,
}

impl StageContext {
    /// Builds the context for `item`.
    #[must_use]
    pub fn for_item(item: &PipelineItem, token: Arc<CancellationToken>) -> Self {
        Self {
            content_key: item.content_key.clone(),
            platform: item.platform.clone(),
            correlation_id: item.correlation_id.clone(),
            retry_count: item.retry_count,
            metadata: item.metadata.clone(),
            artifacts: item.artifacts.clone(),
            token,
        }
    }

    /// A metadata value.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// An earlier step output.
    #[must_use]
    pub fn artifact(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.artifacts.get(step_id)
    }

    /// A string field of an earlier step output.
    #[must_use]
    pub fn artifact_str(&self, step_id: &str, field: &str) -> Option<&str> {
        self.artifact(step_id)
            .and_then(|v| v.get(field))
            .and_then(serde_json::Value::as_str)
    }
}

/// Supplies the saga steps for each stage.
///
/// A stage with no steps completes immediately.
pub trait StagePlan: Send + Sync {
    /// Saga steps for `stage`, in execution order.
    ///
    /// # Errors
    ///
    /// Returns an error if the context lacks something the stage needs;
    /// the stage then fails without running a saga.
    fn steps(&self, stage: PipelineStage, ctx: &StageContext) -> Result<Vec<SagaStep>>;
}
