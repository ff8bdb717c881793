//! Dead-letter sinks.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::classifier::{DlqMessage, DlqPolicy};
use crate::errors::Result;

/// Destination for dead-letter records.
///
/// The JSON shape of [`DlqMessage`] is the contract; storage is up to the
/// implementation.
#[async_trait]
pub trait DlqSink: Send + Sync {
    /// Persists one record.
    async fn publish(&self, message: &DlqMessage) -> Result<()>;
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct InMemoryDlqSink {
    messages: RwLock<Vec<DlqMessage>>,
}

impl InMemoryDlqSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<DlqMessage> {
        self.messages.read().clone()
    }

    /// Records with the given policy.
    #[must_use]
    pub fn with_policy(&self, policy: DlqPolicy) -> Vec<DlqMessage> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.dlq_policy == policy)
            .cloned()
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

#[async_trait]
impl DlqSink for InMemoryDlqSink {
    async fn publish(&self, message: &DlqMessage) -> Result<()> {
        self.messages.write().push(message.clone());
        Ok(())
    }
}

/// Logs records through tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDlqSink;

#[async_trait]
impl DlqSink for LoggingDlqSink {
    async fn publish(&self, message: &DlqMessage) -> Result<()> {
        warn!(
            content_key = %message.content_key,
            retry_count = message.retry_count,
            failed_at = %message.failed_at,
            error_reason = %message.error_reason,
            dlq_policy = %message.dlq_policy,
            "Dead-lettered item"
        );
        Ok(())
    }
}

/// Appends one JSON record per line to a file.
#[derive(Debug)]
pub struct JsonLinesDlqSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesDlqSink {
    /// Creates a sink writing to `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DlqSink for JsonLinesDlqSink {
    async fn publish(&self, message: &DlqMessage) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str, policy: DlqPolicy) -> DlqMessage {
        DlqMessage {
            content_key: key.to_string(),
            retry_count: 0,
            failed_at: crate::utils::iso_timestamp(),
            error_reason: "timeout".to_string(),
            dlq_policy: policy,
        }
    }

    #[tokio::test]
    async fn test_in_memory_sink() {
        let sink = InMemoryDlqSink::new();
        sink.publish(&message("a", DlqPolicy::Retry)).await.unwrap();
        sink.publish(&message("b", DlqPolicy::Manual)).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.with_policy(DlqPolicy::Manual)[0].content_key, "b");
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesDlqSink::new(dir.path().join("dlq.jsonl"));

        sink.publish(&message("youtube:1", DlqPolicy::Retry)).await.unwrap();
        sink.publish(&message("youtube:2", DlqPolicy::Discard)).await.unwrap();

        let contents = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let records: Vec<DlqMessage> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].content_key, "youtube:2");
        assert_eq!(records[1].dlq_policy, DlqPolicy::Discard);
    }

    #[tokio::test]
    async fn test_json_lines_sink_missing_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesDlqSink::new(dir.path().join("missing").join("dlq.jsonl"));
        assert!(sink.publish(&message("k", DlqPolicy::Manual)).await.is_err());
    }
}
