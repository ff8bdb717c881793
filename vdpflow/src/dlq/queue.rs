//! The dead-letter queue: classification, publication and statistics.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::classifier::{DlqClassifier, DlqConfig, DlqDecision, DlqPolicy, DlqRequest};
use super::sink::{DlqSink, InMemoryDlqSink};
use crate::errors::FailureKind;

/// Aggregate dead-letter statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    /// Entries recorded.
    pub failed_jobs: u64,
    /// Entries per failure family.
    pub error_types: BTreeMap<FailureKind, u64>,
    /// Entries per policy.
    pub policies: BTreeMap<DlqPolicy, u64>,
    /// `failed_at` of the newest entry.
    pub last_error: Option<String>,
    /// Reason of the newest entry.
    pub last_error_reason: Option<String>,
    /// Entries later marked recovered.
    pub recovered: u64,
    /// Recovered entries as a percentage of all entries.
    pub recovery_rate: f64,
}

/// Keys whose latest entry may still recover, oldest first.
#[derive(Debug, Default)]
struct Outstanding {
    seq: u64,
    by_key: HashMap<String, u64>,
    by_age: BTreeMap<u64, String>,
}

impl Outstanding {
    fn touch(&mut self, key: &str, capacity: usize) {
        self.remove(key);
        self.seq += 1;
        self.by_key.insert(key.to_string(), self.seq);
        self.by_age.insert(self.seq, key.to_string());
        while self.by_key.len() > capacity.max(1) {
            let Some((_, oldest)) = self.by_age.pop_first() else {
                break;
            };
            self.by_key.remove(&oldest);
            debug!(content_key = %oldest, "Forgetting oldest unrecovered dead-letter key");
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.by_key.remove(key) {
            Some(seq) => {
                self.by_age.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.by_key.len()
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    stats: DlqStats,
    outstanding: Outstanding,
}

/// Classifies terminal failures and publishes them to a sink.
///
/// While isolated, every new entry is parked as `manual` regardless of its
/// classification.
pub struct DeadLetterQueue {
    classifier: DlqClassifier,
    max_outstanding: usize,
    sink: Arc<dyn DlqSink>,
    isolated: AtomicBool,
    inner: Mutex<StatsInner>,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("classifier", &self.classifier)
            .field("isolated", &self.is_isolated())
            .finish_non_exhaustive()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DlqConfig::default(), Arc::new(InMemoryDlqSink::new()))
    }
}

impl DeadLetterQueue {
    /// Creates a queue.
    #[must_use]
    pub fn new(config: DlqConfig, sink: Arc<dyn DlqSink>) -> Self {
        Self {
            max_outstanding: config.max_outstanding,
            classifier: DlqClassifier::new(config),
            sink,
            isolated: AtomicBool::new(false),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    /// Returns the classifier.
    #[must_use]
    pub fn classifier(&self) -> &DlqClassifier {
        &self.classifier
    }

    /// Classifies, records and publishes one failure.
    ///
    /// Sink errors are logged; the entry still counts in the statistics and
    /// the decision is still returned.
    pub async fn submit(&self, request: DlqRequest) -> DlqDecision {
        let mut decision = self.classifier.classify(&request);
        if self.is_isolated() && decision.policy() != DlqPolicy::Manual {
            decision = decision.into_manual();
        }

        {
            let mut inner = self.inner.lock();
            let stats = &mut inner.stats;
            stats.failed_jobs += 1;
            *stats.error_types.entry(decision.kind).or_default() += 1;
            *stats.policies.entry(decision.policy()).or_default() += 1;
            stats.last_error = Some(decision.message.failed_at.clone());
            stats.last_error_reason = Some(decision.message.error_reason.clone());
            refresh_recovery_rate(stats);
            // Discarded items never come back, so they cannot recover.
            let key = &decision.message.content_key;
            if decision.policy() == DlqPolicy::Discard {
                inner.outstanding.remove(key);
            } else {
                inner.outstanding.touch(key, self.max_outstanding);
            }
        }

        warn!(
            content_key = %decision.message.content_key,
            retry_count = decision.message.retry_count,
            kind = %decision.kind,
            dlq_policy = %decision.policy(),
            error_reason = %decision.message.error_reason,
            "Item dead-lettered"
        );

        if let Err(err) = self.sink.publish(&decision.message).await {
            error!(
                content_key = %decision.message.content_key,
                error = %err,
                "Failed to publish dead-letter record"
            );
        }

        decision
    }

    /// Marks a dead-lettered item as recovered.
    ///
    /// Returns false if the key has no outstanding entry.
    pub fn mark_recovered(&self, content_key: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.outstanding.remove(content_key) {
            return false;
        }
        inner.stats.recovered += 1;
        refresh_recovery_rate(&mut inner.stats);
        info!(content_key = %content_key, "Dead-lettered item recovered");
        true
    }

    /// Forces every new entry to `manual` until [`release`](Self::release).
    pub fn isolate(&self) {
        if !self.isolated.swap(true, Ordering::SeqCst) {
            warn!("Dead-letter queue isolated, all new entries parked for manual handling");
        }
    }

    /// Ends isolation.
    pub fn release(&self) {
        if self.isolated.swap(false, Ordering::SeqCst) {
            info!("Dead-letter queue released from isolation");
        }
    }

    /// Returns true while isolated.
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::SeqCst)
    }

    /// Returns a statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> DlqStats {
        self.inner.lock().stats.clone()
    }

    /// Number of dead-lettered keys that may still recover.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.len()
    }
}

#[allow(clippy::cast_precision_loss)]
fn refresh_recovery_rate(stats: &mut DlqStats) {
    stats.recovery_rate = if stats.failed_jobs == 0 {
        0.0
    } else {
        stats.recovered as f64 / stats.failed_jobs as f64 * 100.0
    };
}
