//! Pipeline stage and item status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the fixed, ordered stages a content item moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Item accepted and recorded.
    Ingest,
    /// Source media fetched and uploaded to storage.
    FetchMedia,
    /// Structured extraction by the backend service.
    VdpExtract,
    /// Extraction result enriched with item metadata.
    EnrichComplete,
    /// Record loaded into the data warehouse.
    LoadBq,
    /// Bookkeeping; the only terminal success stage.
    Finalize,
}

impl PipelineStage {
    /// All stages in execution order.
    pub const ORDERED: [Self; 6] = [
        Self::Ingest,
        Self::FetchMedia,
        Self::VdpExtract,
        Self::EnrichComplete,
        Self::LoadBq,
        Self::Finalize,
    ];

    /// Position of the stage in [`Self::ORDERED`].
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Ingest => 0,
            Self::FetchMedia => 1,
            Self::VdpExtract => 2,
            Self::EnrichComplete => 3,
            Self::LoadBq => 4,
            Self::Finalize => 5,
        }
    }

    /// The stage after this one, or `None` for `finalize`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ORDERED.get(self.index() + 1).copied()
    }

    /// Returns true for the terminal success stage.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalize)
    }

    /// The wire name of the stage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::FetchMedia => "fetch_media",
            Self::VdpExtract => "vdp_extract",
            Self::EnrichComplete => "enrich_complete",
            Self::LoadBq => "load_bq",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDERED
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown pipeline stage '{s}'"))
    }
}

/// Lifecycle status of a pipeline item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// The item is moving through the stages.
    #[default]
    Running,
    /// `finalize` completed.
    Completed,
    /// A stage saga was compensated; the item stopped.
    Failed,
}

impl ItemStatus {
    /// Returns true if the item will not move without an explicit restart.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(PipelineStage::Ingest.next(), Some(PipelineStage::FetchMedia));
        assert_eq!(PipelineStage::LoadBq.next(), Some(PipelineStage::Finalize));
        assert_eq!(PipelineStage::Finalize.next(), None);
        for (i, stage) in PipelineStage::ORDERED.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn test_stage_display_and_parse() {
        assert_eq!(PipelineStage::VdpExtract.to_string(), "vdp_extract");
        assert_eq!("load_bq".parse::<PipelineStage>().unwrap(), PipelineStage::LoadBq);
        assert!("upload".parse::<PipelineStage>().is_err());
    }

    #[test]
    fn test_stage_serde_matches_display() {
        let json = serde_json::to_string(&PipelineStage::EnrichComplete).unwrap();
        assert_eq!(json, "\"enrich_complete\"");
    }

    #[test]
    fn test_item_status_terminal() {
        assert!(!ItemStatus::Running.is_terminal());
        assert!(ItemStatus::Completed.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
    }
}
