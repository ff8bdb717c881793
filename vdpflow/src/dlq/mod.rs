//! Dead-letter handling for failures that exceed automated recovery.
//!
//! This module provides:
//! - `DlqClassifier` assigning `retry`, `manual` or `discard`
//! - `DeadLetterQueue` with statistics and isolation mode
//! - Sinks for the JSON dead-letter record

mod classifier;
mod queue;
mod sink;

pub use classifier::{
    DlqClassifier, DlqConfig, DlqDecision, DlqMessage, DlqPolicy, DlqRequest,
    COMPENSATION_FAILED_REASON,
};
pub use queue::{DeadLetterQueue, DlqStats};
pub use sink::{DlqSink, InMemoryDlqSink, JsonLinesDlqSink, LoggingDlqSink};
