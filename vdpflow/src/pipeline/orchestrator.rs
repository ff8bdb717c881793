//! The pipeline state machine.
//!
//! Drives each item through the ordered stages, one saga per stage. A stage
//! completes only when its saga completes; a compensated saga fails the item
//! on that stage. This is the only place item failures are recorded.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::item::PipelineItem;
use super::plan::{StageContext, StagePlan};
use super::repository::ItemRepository;
use super::single_flight::{FlightMode, SingleFlight};
use crate::cancellation::CancellationToken;
use crate::core::{EventType, ItemStatus, OutboxEvent};
use crate::dlq::{DeadLetterQueue, DlqDecision, DlqPolicy, DlqRequest};
use crate::errors::{Result, ValidationError, VdpflowError};
use crate::events::{noop_sink, EventSink};
use crate::saga::SagaTransaction;
use crate::utils::{content_key, generate_uuid};

/// Platforms accepted at ingest.
pub const SUPPORTED_PLATFORMS: [&str; 3] = ["youtube", "instagram", "tiktok"];

/// A request to start processing a content item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Source platform.
    pub platform: String,
    /// Platform content id.
    pub content_id: String,
    /// Public URL of the content.
    pub source_url: String,
    /// Content language.
    #[serde(default)]
    pub language: Option<String>,
    /// Extra metadata copied onto the item.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl IngestRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(platform: impl Into<String>, content_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            content_id: content_id.into(),
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    /// Sets the language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let platform = self.platform.trim().to_ascii_lowercase();
        if !SUPPORTED_PLATFORMS.contains(&platform.as_str()) {
            return Err(ValidationError::new(
                "INGEST-002-PLATFORM",
                format!("unsupported platform '{}'", self.platform),
            )
            .with_field("platform")
            .with_fix_hint(format!("use one of: {}", SUPPORTED_PLATFORMS.join(", "))));
        }

        let id = self.content_id.trim();
        if id.is_empty() || id.contains(':') || id.chars().any(char::is_whitespace) {
            return Err(ValidationError::new(
                "INGEST-001-CONTENT-ID",
                format!("invalid content id '{}'", self.content_id),
            )
            .with_field("content_id"));
        }

        let url = self.source_url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ValidationError::new(
                "INGEST-003-SOURCE-URL",
                "source_url must be an http(s) URL",
            )
            .with_field("source_url"));
        }
        Ok(())
    }
}

/// A failed run, with the dead-letter decision for its triggering error.
struct RunFailure {
    error: VdpflowError,
    decision: Option<DlqDecision>,
}

impl From<VdpflowError> for RunFailure {
    fn from(error: VdpflowError) -> Self {
        Self {
            error,
            decision: None,
        }
    }
}

/// Processes pipeline items.
pub struct PipelineOrchestrator {
    plan: Arc<dyn StagePlan>,
    repository: Arc<dyn ItemRepository>,
    dlq: Arc<DeadLetterQueue>,
    sink: Arc<dyn EventSink>,
    flights: SingleFlight,
    flight_mode: FlightMode,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("dlq", &self.dlq)
            .field("in_flight", &self.flights.len())
            .field("flight_mode", &self.flight_mode)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        plan: Arc<dyn StagePlan>,
        repository: Arc<dyn ItemRepository>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            plan,
            repository,
            dlq,
            sink: noop_sink(),
            flights: SingleFlight::new(),
            flight_mode: FlightMode::Reject,
        }
    }

    /// Publishes item and saga events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the behavior for requests on a busy content key.
    #[must_use]
    pub fn with_flight_mode(mut self, mode: FlightMode) -> Self {
        self.flight_mode = mode;
        self
    }

    /// The dead-letter queue.
    #[must_use]
    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// Validates and records a new item at `ingest`. No saga runs.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::Validation`] for malformed or duplicate input.
    pub async fn ingest(&self, request: IngestRequest) -> Result<PipelineItem> {
        request.validate()?;
        let key = content_key(request.platform.trim(), request.content_id.trim());
        if self.repository.get(&key).await?.is_some() {
            return Err(ValidationError::new(
                "INGEST-004-DUPLICATE",
                format!("item '{key}' already exists"),
            )
            .with_field("content_id")
            .into());
        }

        let mut item = PipelineItem::new(
            request.platform.trim(),
            request.content_id.trim(),
            generate_uuid().to_string(),
        )
        .with_metadata("source_url", request.source_url.trim());
        if let Some(language) = request.language {
            item = item.with_metadata("language", language);
        }
        item.metadata.extend(request.metadata);

        self.repository.put(item.clone()).await?;
        self.sink
            .publish(OutboxEvent::stage_transition(&item.correlation_id, item.current_stage))
            .await;
        info!(content_key = %item.content_key, correlation_id = %item.correlation_id, "Item ingested");
        Ok(item)
    }

    /// Loads an item.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::NotFound`] for unknown keys.
    pub async fn get(&self, content_key: &str) -> Result<PipelineItem> {
        self.repository
            .get(content_key)
            .await?
            .ok_or_else(|| VdpflowError::NotFound(content_key.to_string()))
    }

    /// Lists every item.
    ///
    /// # Errors
    ///
    /// Propagates repository errors.
    pub async fn list(&self) -> Result<Vec<PipelineItem>> {
        self.repository.list().await
    }

    /// Runs the remaining stages of an item once.
    ///
    /// A completed item is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the item, [`VdpflowError::InFlight`]
    /// when the key is busy in reject mode, or
    /// [`VdpflowError::InvalidTransition`] for an item that already failed.
    pub async fn process(&self, content_key: &str, token: Arc<CancellationToken>) -> Result<PipelineItem> {
        let _flight = self.flights.claim(content_key, self.flight_mode).await?;
        let mut item = self.runnable(content_key).await?;
        if item.status == ItemStatus::Completed {
            return Ok(item);
        }
        self.run_stages(&mut item, &token)
            .await
            .map(|()| item)
            .map_err(|failure| failure.error)
    }

    /// Runs an item, re-enqueueing it while the DLQ policy is `retry`.
    ///
    /// Each retry waits the classifier's backoff, then restarts the item on
    /// the stage that failed with `retry_count + 1`.
    ///
    /// # Errors
    ///
    /// Returns the last error once the policy is not `retry`, or
    /// [`VdpflowError::Cancelled`] if `token` fires during a backoff.
    pub async fn process_with_retry(&self, content_key: &str, token: Arc<CancellationToken>) -> Result<PipelineItem> {
        let _flight = self.flights.claim(content_key, self.flight_mode).await?;
        let mut item = self.runnable(content_key).await?;
        if item.status == ItemStatus::Completed {
            return Ok(item);
        }

        loop {
            let failure = match self.run_stages(&mut item, &token).await {
                Ok(()) => return Ok(item),
                Err(failure) => failure,
            };

            let retry_after = failure
                .decision
                .as_ref()
                .filter(|d| d.policy() == DlqPolicy::Retry)
                .and_then(|d| d.retry_after);
            let Some(delay) = retry_after else {
                return Err(failure.error);
            };

            info!(
                content_key = %item.content_key,
                retry_count = item.retry_count,
                delay = ?delay,
                "Re-enqueueing item after backoff"
            );
            tokio::select! {
                () = token.cancelled() => {
                    return Err(VdpflowError::Cancelled(
                        token.reason().unwrap_or_else(|| "retry backoff".to_string()),
                    ));
                }
                () = tokio::time::sleep(delay) => {}
            }

            item.restart()?;
            self.repository.put(item.clone()).await?;
        }
    }

    /// Restarts a failed item on the stage that failed, e.g. after a
    /// manual fix.
    ///
    /// # Errors
    ///
    /// Fails if the key is busy, unknown or the item has not failed.
    pub async fn restart(&self, content_key: &str) -> Result<PipelineItem> {
        let _flight = self.flights.try_acquire(content_key)?;
        let mut item = self.get(content_key).await?;
        item.restart()?;
        self.repository.put(item.clone()).await?;
        info!(content_key = %content_key, retry_count = item.retry_count, stage = %item.current_stage, "Item restarted");
        Ok(item)
    }

    /// Processes several items concurrently, each with retries.
    pub async fn process_batch(
        &self,
        content_keys: &[String],
        token: Arc<CancellationToken>,
    ) -> Vec<(String, Result<PipelineItem>)> {
        join_all(content_keys.iter().map(|key| {
            let token = token.clone();
            async move { (key.clone(), self.process_with_retry(key, token).await) }
        }))
        .await
    }

    async fn runnable(&self, content_key: &str) -> Result<PipelineItem> {
        let item = self.get(content_key).await?;
        if item.status == ItemStatus::Failed {
            return Err(VdpflowError::InvalidTransition {
                content_key: content_key.to_string(),
                from: format!("{}/{}", item.current_stage, item.status),
                to: "process".to_string(),
            });
        }
        Ok(item)
    }

    async fn run_stages(
        &self,
        item: &mut PipelineItem,
        token: &Arc<CancellationToken>,
    ) -> std::result::Result<(), RunFailure> {
        loop {
            if token.is_cancelled() {
                warn!(content_key = %item.content_key, stage = %item.current_stage, "Processing cancelled between stages");
                return Err(VdpflowError::Cancelled(token.reason().unwrap_or_default()).into());
            }

            let stage = item.current_stage;
            let ctx = StageContext::for_item(item, token.clone());
            let steps = match self.plan.steps(stage, &ctx) {
                Ok(steps) => steps,
                Err(err) => {
                    let decision = self
                        .dlq
                        .submit(DlqRequest::from_error(&item.content_key, item.retry_count, &err))
                        .await;
                    return Err(self.fail_item(item, err, Some(decision)).await);
                }
            };

            debug!(content_key = %item.content_key, stage = %stage, steps = steps.len(), "Starting stage saga");
            let mut saga = SagaTransaction::new(&item.correlation_id, &item.content_key)
                .with_sink(self.sink.clone())
                .with_dlq(self.dlq.clone())
                .with_retry_count(item.retry_count);
            for step in steps {
                saga.push_step(step);
            }

            if let Err(err) = saga.execute().await {
                let decision = saga.dead_letters().last().cloned();
                return Err(self.fail_item(item, err, decision).await);
            }

            item.record_artifacts(saga.steps().iter().filter_map(|step| {
                step.output()
                    .map(|output| (step.step_id().to_string(), output.clone()))
            }));

            if stage.is_terminal() {
                item.complete()?;
                self.repository.put(item.clone()).await?;
                if item.retry_count > 0 {
                    self.dlq.mark_recovered(&item.content_key);
                }
                self.sink
                    .publish(OutboxEvent::new(EventType::ItemFinalized, &item.correlation_id, stage.as_str()))
                    .await;
                info!(content_key = %item.content_key, retry_count = item.retry_count, "Item finalized");
                return Ok(());
            }

            let next = item.advance()?;
            self.repository.put(item.clone()).await?;
            self.sink
                .publish(OutboxEvent::stage_transition(&item.correlation_id, next))
                .await;
            debug!(content_key = %item.content_key, stage = %next, "Stage transition");
        }
    }

    async fn fail_item(
        &self,
        item: &mut PipelineItem,
        error: VdpflowError,
        decision: Option<DlqDecision>,
    ) -> RunFailure {
        item.fail(error.to_string());
        if let Err(put_err) = self.repository.put(item.clone()).await {
            error!(content_key = %item.content_key, error = %put_err, "Failed to persist failed item");
        }
        self.sink
            .publish(
                OutboxEvent::new(EventType::ItemFailed, &item.correlation_id, item.current_stage.as_str())
                    .with_detail(error.to_string()),
            )
            .await;
        error!(
            content_key = %item.content_key,
            stage = %item.current_stage,
            retry_count = item.retry_count,
            dlq_policy = ?decision.as_ref().map(DlqDecision::policy),
            error = %error,
            "Item failed"
        );
        RunFailure { error, decision }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_validation() {
        assert!(IngestRequest::new("youtube", "abc", "https://youtu.be/abc").validate().is_ok());
        assert!(IngestRequest::new("YouTube", "abc", "https://youtu.be/abc").validate().is_ok());

        let err = IngestRequest::new("vimeo", "abc", "https://vimeo.com/abc")
            .validate()
            .unwrap_err();
        assert_eq!(err.code, "INGEST-002-PLATFORM");

        let err = IngestRequest::new("tiktok", "a:b", "https://t.co/x").validate().unwrap_err();
        assert_eq!(err.code, "INGEST-001-CONTENT-ID");

        let err = IngestRequest::new("instagram", "p1", "ftp://x").validate().unwrap_err();
        assert_eq!(err.code, "INGEST-003-SOURCE-URL");
    }
}
