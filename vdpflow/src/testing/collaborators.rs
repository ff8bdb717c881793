//! Recording fakes for storage, warehouse and compensation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::errors::{Result, VdpflowError};
use crate::pipeline::{MediaStore, Warehouse};
use crate::saga::{CompensationAction, CompensationExecutor, CompensationKind};

/// Media store that keeps objects in memory and records every call.
#[derive(Debug, Default)]
pub struct RecordingMediaStore {
    failing_ops: Mutex<HashSet<String>>,
    objects: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    cleaned: Mutex<Vec<String>>,
    ops: Mutex<Vec<String>>,
}

impl RecordingMediaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every call of `op` (`download`, `upload`, `store_artifact`,
    /// `delete`, `cleanup_temp`).
    #[must_use]
    pub fn failing_on(self, op: &str) -> Self {
        self.failing_ops.lock().insert(op.to_string());
        self
    }

    /// Stops failing `op`.
    pub fn heal(&self, op: &str) {
        self.failing_ops.lock().remove(op);
    }

    /// Objects currently stored.
    #[must_use]
    pub fn objects(&self) -> Vec<String> {
        self.objects.lock().clone()
    }

    /// Delete calls, in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Cleaned temp paths, in order.
    #[must_use]
    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().clone()
    }

    /// Every operation, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    fn enter(&self, op: &str) -> Result<()> {
        self.ops.lock().push(op.to_string());
        if self.failing_ops.lock().contains(op) {
            return Err(VdpflowError::transient(format!("{op} failed: storage timeout")));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStore for RecordingMediaStore {
    async fn download(&self, content_key: &str, _source_url: &str) -> Result<String> {
        self.enter("download")?;
        Ok(format!("/tmp/vdp/{}", content_key.replace(':', "_")))
    }

    async fn upload(&self, content_key: &str, _temp_path: &str) -> Result<String> {
        self.enter("upload")?;
        let uri = format!("gs://vdp-media/{}.mp4", content_key.replace(':', "/"));
        self.objects.lock().push(uri.clone());
        Ok(uri)
    }

    async fn store_artifact(&self, content_key: &str, name: &str, _body: &serde_json::Value) -> Result<String> {
        self.enter("store_artifact")?;
        let uri = format!("gs://vdp-artifacts/{}/{name}", content_key.replace(':', "/"));
        self.objects.lock().push(uri.clone());
        Ok(uri)
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.enter("delete")?;
        self.objects.lock().retain(|o| o != uri);
        self.deleted.lock().push(uri.to_string());
        Ok(())
    }

    async fn cleanup_temp(&self, path: &str) -> Result<()> {
        self.enter("cleanup_temp")?;
        self.cleaned.lock().push(path.to_string());
        Ok(())
    }
}

/// Warehouse that counts rows per key.
#[derive(Debug, Default)]
pub struct RecordingWarehouse {
    rows: Mutex<BTreeMap<String, u64>>,
    failing_loads: AtomicUsize,
    duplicating: AtomicBool,
    deleted: Mutex<Vec<String>>,
}

impl RecordingWarehouse {
    /// Creates an empty warehouse.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` loads.
    #[must_use]
    pub fn with_failing_loads(self, n: usize) -> Self {
        self.failing_loads.store(n, Ordering::SeqCst);
        self
    }

    /// Writes every load twice, breaking row-count verification.
    #[must_use]
    pub fn duplicating(self) -> Self {
        self.duplicating.store(true, Ordering::SeqCst);
        self
    }

    /// Delete calls as `table/key`, in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Keys with at least one row.
    #[must_use]
    pub fn loaded_keys(&self) -> Vec<String> {
        self.rows
            .lock()
            .iter()
            .filter(|&(_, &n)| n > 0)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn row_key(table: &str, content_key: &str) -> String {
        format!("{table}/{content_key}")
    }
}

#[async_trait]
impl Warehouse for RecordingWarehouse {
    async fn load(&self, table: &str, content_key: &str, _row: &serde_json::Value) -> Result<()> {
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(VdpflowError::transient("warehouse connection timeout"));
        }
        let copies = if self.duplicating.load(Ordering::SeqCst) { 2 } else { 1 };
        *self
            .rows
            .lock()
            .entry(Self::row_key(table, content_key))
            .or_default() += copies;
        Ok(())
    }

    async fn count(&self, table: &str, content_key: &str) -> Result<u64> {
        Ok(self
            .rows
            .lock()
            .get(&Self::row_key(table, content_key))
            .copied()
            .unwrap_or(0))
    }

    async fn delete_record(&self, table: &str, content_key: &str) -> Result<()> {
        let key = Self::row_key(table, content_key);
        self.rows.lock().remove(&key);
        self.deleted.lock().push(key);
        Ok(())
    }
}

/// Compensation executor that records actions instead of applying them.
#[derive(Debug, Default)]
pub struct RecordingCompensator {
    executed: Mutex<Vec<CompensationAction>>,
    failing: Mutex<HashSet<CompensationKind>>,
}

impl RecordingCompensator {
    /// Creates a compensator that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every action of `kind`.
    #[must_use]
    pub fn failing_on(self, kind: CompensationKind) -> Self {
        self.failing.lock().insert(kind);
        self
    }

    /// Successfully executed actions, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<CompensationAction> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl CompensationExecutor for RecordingCompensator {
    async fn execute(&self, action: &CompensationAction) -> Result<()> {
        if self.failing.lock().contains(&action.action) {
            return Err(VdpflowError::transient(format!("{} failed", action.action)));
        }
        self.executed.lock().push(action.clone());
        Ok(())
    }
}
