//! Pipeline items and their stage bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{ItemStatus, PipelineStage};
use crate::errors::{Result, VdpflowError};
use crate::utils::{content_key, iso_timestamp};

/// One recorded failure of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Stage that failed.
    pub stage: PipelineStage,
    /// Failure reason.
    pub reason: String,
    /// Attempt number the failure happened on.
    pub retry_count: u32,
    /// When it failed (RFC 3339).
    pub at: String,
}

/// A content item moving through the pipeline.
///
/// `current_stage` only moves forward, one stage at a time. A failed item
/// stays on the stage that failed until it is restarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineItem {
    /// `platform:content_id`.
    pub content_key: String,
    /// Source platform.
    pub platform: String,
    /// Correlation id shared by every event of this item.
    pub correlation_id: String,
    /// Stage in progress, or the stage that failed.
    pub current_stage: PipelineStage,
    /// Lifecycle status.
    #[serde(default)]
    pub status: ItemStatus,
    /// Free-form item metadata (source URL, language...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Failures, oldest first.
    #[serde(default)]
    pub errors: Vec<ItemError>,
    /// Restarts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Outputs of completed saga steps, keyed by step id.
    #[serde(default)]
    pub artifacts: serde_json::Map<String, serde_json::Value>,
    /// Creation time (RFC 3339).
    pub created_at: String,
    /// Last change (RFC 3339).
    pub updated_at: String,
}

impl PipelineItem {
    /// Creates an item at the `ingest` stage.
    #[must_use]
    pub fn new(platform: &str, content_id: &str, correlation_id: impl Into<String>) -> Self {
        let now = iso_timestamp();
        Self {
            content_key: content_key(platform, content_id),
            platform: platform.to_ascii_lowercase(),
            correlation_id: correlation_id.into(),
            current_stage: PipelineStage::Ingest,
            status: ItemStatus::Running,
            metadata: BTreeMap::new(),
            errors: Vec::new(),
            retry_count: 0,
            artifacts: serde_json::Map::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Moves to the next stage.
    ///
    /// # Errors
    ///
    /// Fails if the item is not running or already at `finalize`.
    pub fn advance(&mut self) -> Result<PipelineStage> {
        let next = match (self.status, self.current_stage.next()) {
            (ItemStatus::Running, Some(next)) => next,
            (_, next) => {
                return Err(self.invalid(next.map_or("(none)", PipelineStage::as_str)));
            }
        };
        self.current_stage = next;
        self.touch();
        Ok(next)
    }

    /// Marks the item as finished at `finalize`.
    ///
    /// # Errors
    ///
    /// Fails unless the item is running at `finalize`.
    pub fn complete(&mut self) -> Result<()> {
        if self.status != ItemStatus::Running || !self.current_stage.is_terminal() {
            return Err(self.invalid("completed"));
        }
        self.status = ItemStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Marks the item failed on its current stage.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.errors.push(ItemError {
            stage: self.current_stage,
            reason: reason.into(),
            retry_count: self.retry_count,
            at: iso_timestamp(),
        });
        self.status = ItemStatus::Failed;
        self.touch();
    }

    /// Puts a failed item back to running on the stage that failed.
    ///
    /// # Errors
    ///
    /// Fails unless the item is failed.
    pub fn restart(&mut self) -> Result<()> {
        if self.status != ItemStatus::Failed {
            return Err(self.invalid("restart"));
        }
        self.status = ItemStatus::Running;
        self.retry_count += 1;
        self.touch();
        Ok(())
    }

    /// Records saga step outputs.
    pub fn record_artifacts<I>(&mut self, outputs: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        self.artifacts.extend(outputs);
        self.touch();
    }

    /// The latest failure reason.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(|e| e.reason.as_str())
    }

    fn touch(&mut self) {
        self.updated_at = iso_timestamp();
    }

    fn invalid(&self, to: &str) -> VdpflowError {
        VdpflowError::InvalidTransition {
            content_key: self.content_key.clone(),
            from: format!("{}/{}", self.current_stage, self.status),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item() {
        let item = PipelineItem::new("YouTube", "abc123", "corr-1");
        assert_eq!(item.content_key, "youtube:abc123");
        assert_eq!(item.platform, "youtube");
        assert_eq!(item.current_stage, PipelineStage::Ingest);
        assert_eq!(item.status, ItemStatus::Running);
    }

    #[test]
    fn test_advance_through_all_stages() {
        let mut item = PipelineItem::new("youtube", "a", "c");
        let mut seen = vec![item.current_stage];
        while let Ok(stage) = item.advance() {
            seen.push(stage);
        }
        assert_eq!(seen, PipelineStage::ORDERED.to_vec());
        assert!(item.advance().is_err());

        item.complete().unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[test]
    fn test_complete_requires_finalize() {
        let mut item = PipelineItem::new("youtube", "a", "c");
        assert!(matches!(
            item.complete(),
            Err(VdpflowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_failed_item_cannot_advance() {
        let mut item = PipelineItem::new("youtube", "a", "c");
        item.advance().unwrap();
        item.fail("all backends unavailable");

        assert!(item.advance().is_err());
        assert_eq!(item.current_stage, PipelineStage::FetchMedia);
        assert_eq!(item.errors[0].stage, PipelineStage::FetchMedia);
        assert_eq!(item.last_error(), Some("all backends unavailable"));
    }

    #[test]
    fn test_restart_keeps_stage() {
        let mut item = PipelineItem::new("tiktok", "9", "c");
        item.advance().unwrap();
        item.advance().unwrap();
        item.fail("timeout");
        item.restart().unwrap();

        assert_eq!(item.status, ItemStatus::Running);
        assert_eq!(item.current_stage, PipelineStage::VdpExtract);
        assert_eq!(item.retry_count, 1);
        assert!(item.restart().is_err());
    }
}
