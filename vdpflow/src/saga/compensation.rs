//! Declarative compensating actions.
//!
//! Every executor must tolerate the same action twice: applying it again
//! after it already took effect leaves state unchanged. [`IdempotentCompensator`]
//! enforces this within one saga for executors that cannot guarantee it
//! themselves.

use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::PipelineStage;
use crate::errors::Result;

/// What a compensating action undoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationKind {
    /// Delete an uploaded media object.
    RollbackUpload,
    /// Delete a row loaded into the warehouse.
    DeleteBqRecord,
    /// Remove temporary files.
    CleanupTemp,
}

impl CompensationKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RollbackUpload => "rollback_upload",
            Self::DeleteBqRecord => "delete_bq_record",
            Self::CleanupTemp => "cleanup_temp",
        }
    }
}

impl fmt::Display for CompensationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compensating action consumed by a [`CompensationExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    /// Stage whose work is undone.
    pub stage: PipelineStage,
    /// What to do.
    pub action: CompensationKind,
    /// Action parameters (object URI, record id, temp path...).
    #[serde(default)]
    pub params: serde_json::Value,
}

impl CompensationAction {
    /// Creates an action.
    #[must_use]
    pub fn new(stage: PipelineStage, action: CompensationKind, params: serde_json::Value) -> Self {
        Self {
            stage,
            action,
            params,
        }
    }

    /// Deletes the uploaded object at `uri`.
    #[must_use]
    pub fn rollback_upload(uri: &str) -> Self {
        Self::new(
            PipelineStage::FetchMedia,
            CompensationKind::RollbackUpload,
            serde_json::json!({ "uri": uri }),
        )
    }

    /// Deletes the warehouse row for `content_key` from `table`.
    #[must_use]
    pub fn delete_bq_record(table: &str, content_key: &str) -> Self {
        Self::new(
            PipelineStage::LoadBq,
            CompensationKind::DeleteBqRecord,
            serde_json::json!({ "table": table, "content_key": content_key }),
        )
    }

    /// Removes temporary files under `path` left by `stage`.
    #[must_use]
    pub fn cleanup_temp(stage: PipelineStage, path: &str) -> Self {
        Self::new(
            stage,
            CompensationKind::CleanupTemp,
            serde_json::json!({ "path": path }),
        )
    }

    /// Returns a string parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(serde_json::Value::as_str)
    }

    /// Stable key identifying this exact action.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        let params = serde_json::to_string(&self.params).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.stage.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(self.action.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(params.as_bytes());
        let digest = hasher.finalize();
        format!("comp:{}", hex::encode(&digest[..16]))
    }
}

/// Executes compensating actions.
#[async_trait]
pub trait CompensationExecutor: Send + Sync {
    /// Applies `action`. Must be safe to call again with the same action.
    async fn execute(&self, action: &CompensationAction) -> Result<()>;
}

#[async_trait]
impl<E: CompensationExecutor + ?Sized> CompensationExecutor for Arc<E> {
    async fn execute(&self, action: &CompensationAction) -> Result<()> {
        (**self).execute(action).await
    }
}

/// Skips actions that already succeeded once.
///
/// Scope one instance to one saga: a retried attempt gets a fresh instance,
/// so its compensations run again even when their parameters repeat. Failed
/// actions are not remembered.
#[derive(Debug, Default)]
pub struct IdempotentCompensator<E> {
    inner: E,
    applied: DashSet<String>,
}

impl<E> IdempotentCompensator<E> {
    /// Wraps `inner`.
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            applied: DashSet::new(),
        }
    }

    /// Returns the wrapped executor.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Returns true if `action` already succeeded.
    #[must_use]
    pub fn was_applied(&self, action: &CompensationAction) -> bool {
        self.applied.contains(&action.idempotency_key())
    }
}

#[async_trait]
impl<E: CompensationExecutor> CompensationExecutor for IdempotentCompensator<E> {
    async fn execute(&self, action: &CompensationAction) -> Result<()> {
        let key = action.idempotency_key();
        if self.applied.contains(&key) {
            debug!(action = %action.action, key = %key, "Compensation already applied, skipping");
            return Ok(());
        }
        self.inner.execute(action).await?;
        self.applied.insert(key);
        Ok(())
    }
}
