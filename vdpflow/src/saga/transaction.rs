//! Saga transactions: ordered forward steps with reverse-order compensation.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::compensation::{CompensationAction, CompensationExecutor};
use crate::core::{EventType, OutboxEvent};
use crate::dlq::{DeadLetterQueue, DlqDecision, DlqRequest};
use crate::errors::{Result, VdpflowError};
use crate::events::{noop_sink, EventSink};
use crate::observability::SpanTimer;
use crate::utils::saga_id;

/// Forward action of a step. Its output is handed to the compensation.
pub type ForwardFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<serde_json::Value>> + Send>;

/// Compensating action of a step, given the forward output.
pub type CompensationFn =
    Box<dyn FnOnce(serde_json::Value) -> BoxFuture<'static, Result<()>> + Send>;

/// Saga lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Created or running forward steps.
    #[default]
    Started,
    /// Every forward step succeeded.
    Completed,
    /// Undoing completed steps.
    Compensating,
    /// Every completed step had its compensation attempted.
    Compensated,
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "STARTED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Compensating => write!(f, "COMPENSATING"),
            Self::Compensated => write!(f, "COMPENSATED"),
        }
    }
}

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not run yet.
    #[default]
    Pending,
    /// Forward action succeeded.
    Completed,
    /// Forward action failed.
    Failed,
    /// Compensation succeeded.
    Compensated,
    /// Compensation failed and was dead-lettered.
    CompensationFailed,
}

/// One step of a saga.
pub struct SagaStep {
    step_id: String,
    forward: Option<ForwardFn>,
    compensation: Option<CompensationFn>,
    status: StepStatus,
    output: Option<serde_json::Value>,
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("step_id", &self.step_id)
            .field("status", &self.status)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl SagaStep {
    /// Creates a step from a forward action and its compensation.
    pub fn new<F, FFut, C, CFut>(step_id: impl Into<String>, forward: F, compensation: C) -> Self
    where
        F: FnOnce() -> FFut + Send + 'static,
        FFut: Future<Output = Result<serde_json::Value>> + Send + 'static,
        C: FnOnce(serde_json::Value) -> CFut + Send + 'static,
        CFut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            step_id: step_id.into(),
            forward: Some(Box::new(move || Box::pin(forward()))),
            compensation: Some(Box::new(move |output| Box::pin(compensation(output)))),
            status: StepStatus::Pending,
            output: None,
        }
    }

    /// Creates a step whose compensation is a declarative action.
    pub fn with_action<F, FFut>(
        step_id: impl Into<String>,
        forward: F,
        executor: Arc<dyn CompensationExecutor>,
        action: CompensationAction,
    ) -> Self
    where
        F: FnOnce() -> FFut + Send + 'static,
        FFut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self::new(step_id, forward, move |_| async move {
            executor.execute(&action).await
        })
    }

    /// Creates a step with nothing to undo.
    pub fn irreversible<F, FFut>(step_id: impl Into<String>, forward: F) -> Self
    where
        F: FnOnce() -> FFut + Send + 'static,
        FFut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self::new(step_id, forward, |_| async { Ok(()) })
    }

    /// Step id.
    #[must_use]
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Forward output, once completed.
    #[must_use]
    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }
}

/// Outcome of a compensation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Steps compensated successfully, in the order they ran.
    pub compensated: Vec<String>,
    /// Steps whose compensation failed, in the order they ran.
    pub failed: Vec<String>,
}

impl CompensationReport {
    /// Every attempted step, in the order they ran.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.compensated.len() + self.failed.len()
    }
}

/// A saga owned by one stage-group execution of one item.
///
/// Forward steps run in insertion order. The first failure stops forward
/// execution for good and compensates every completed step in reverse
/// order, exactly once each, before the triggering error is returned.
pub struct SagaTransaction {
    saga_id: String,
    correlation_id: String,
    content_key: String,
    retry_count: u32,
    steps: Vec<SagaStep>,
    completed: Vec<usize>,
    state: SagaState,
    outbox: Vec<OutboxEvent>,
    sink: Arc<dyn EventSink>,
    dlq: Option<Arc<DeadLetterQueue>>,
    dead_letters: Vec<DlqDecision>,
}

impl fmt::Debug for SagaTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaTransaction")
            .field("saga_id", &self.saga_id)
            .field("correlation_id", &self.correlation_id)
            .field("content_key", &self.content_key)
            .field("state", &self.state)
            .field("steps", &self.steps)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl SagaTransaction {
    /// Creates an empty saga.
    #[must_use]
    pub fn new(correlation_id: impl Into<String>, content_key: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id("saga"),
            correlation_id: correlation_id.into(),
            content_key: content_key.into(),
            retry_count: 0,
            steps: Vec::new(),
            completed: Vec::new(),
            state: SagaState::Started,
            outbox: Vec::new(),
            sink: noop_sink(),
            dlq: None,
            dead_letters: Vec::new(),
        }
    }

    /// Publishes events to `sink` as well as the local outbox.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Dead-letters failures to `dlq`.
    #[must_use]
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Sets the attempt number reported to the DLQ.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Appends a step.
    pub fn add_step<F, FFut, C, CFut>(&mut self, step_id: impl Into<String>, forward: F, compensation: C) -> &mut Self
    where
        F: FnOnce() -> FFut + Send + 'static,
        FFut: Future<Output = Result<serde_json::Value>> + Send + 'static,
        C: FnOnce(serde_json::Value) -> CFut + Send + 'static,
        CFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push_step(SagaStep::new(step_id, forward, compensation))
    }

    /// Appends a prepared step.
    pub fn push_step(&mut self, step: SagaStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Saga id.
    #[must_use]
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// Correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Steps in insertion order.
    #[must_use]
    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    /// Ids of completed steps, in execution order.
    #[must_use]
    pub fn completed_steps(&self) -> Vec<&str> {
        self.completed
            .iter()
            .map(|&i| self.steps[i].step_id.as_str())
            .collect()
    }

    /// Forward output of `step_id`.
    #[must_use]
    pub fn output(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.steps
            .iter()
            .find(|s| s.step_id == step_id)
            .and_then(SagaStep::output)
    }

    /// Every event emitted so far.
    #[must_use]
    pub fn outbox(&self) -> &[OutboxEvent] {
        &self.outbox
    }

    /// Dead-letter decisions made by this saga.
    #[must_use]
    pub fn dead_letters(&self) -> &[DlqDecision] {
        &self.dead_letters
    }

    /// Runs the forward steps.
    ///
    /// # Errors
    ///
    /// Returns the first forward error after compensation has finished, or
    /// [`VdpflowError::InvalidTransition`] if the saga already ran or was
    /// compensated.
    pub async fn execute(&mut self) -> Result<()> {
        // Only STARTED -> COMPLETED and COMPENSATING -> COMPENSATED are legal.
        if self.state != SagaState::Started {
            return Err(self.invalid("execute"));
        }
        info!(saga_id = %self.saga_id, correlation_id = %self.correlation_id, steps = self.steps.len(), "Saga started");

        for idx in 0..self.steps.len() {
            let Some(forward) = self.steps[idx].forward.take() else {
                continue;
            };
            let step_id = self.steps[idx].step_id.clone();
            debug!(saga_id = %self.saga_id, step_id = %step_id, "Running saga step");

            let timer = SpanTimer::start(&step_id);
            let outcome = forward().await;
            let elapsed = timer.finish();
            match outcome {
                Ok(output) => {
                    debug!(saga_id = %self.saga_id, step_id = %step_id, elapsed = ?elapsed, "Saga step completed");
                    let step = &mut self.steps[idx];
                    step.status = StepStatus::Completed;
                    step.output = Some(output);
                    self.completed.push(idx);
                    let event = OutboxEvent::step_completed(&self.saga_id, &self.correlation_id, &step_id);
                    self.emit(event).await;
                }
                Err(err) => {
                    self.steps[idx].status = StepStatus::Failed;
                    error!(
                        saga_id = %self.saga_id,
                        correlation_id = %self.correlation_id,
                        step_id = %step_id,
                        error = %err,
                        "Saga step failed, compensating"
                    );
                    self.compensate().await;
                    self.dead_letter(DlqRequest::from_error(&self.content_key, self.retry_count, &err))
                        .await;
                    return Err(err);
                }
            }
        }

        self.state = SagaState::Completed;
        let event = OutboxEvent::new(EventType::SagaCompleted, &self.correlation_id, &self.saga_id)
            .with_saga(&self.saga_id);
        self.emit(event).await;
        info!(saga_id = %self.saga_id, correlation_id = %self.correlation_id, "Saga completed");
        Ok(())
    }

    /// Compensates every completed step in reverse order.
    ///
    /// Failures are dead-lettered as `compensation_failed` and do not stop
    /// the remaining compensations. Calling this again is a no-op.
    pub async fn compensate(&mut self) -> CompensationReport {
        let mut report = CompensationReport::default();
        if self.state == SagaState::Compensated {
            return report;
        }
        self.state = SagaState::Compensating;
        // Pending steps can never run once compensation has begun.
        for step in &mut self.steps {
            step.forward = None;
        }

        let order: Vec<usize> = self.completed.iter().rev().copied().collect();
        for idx in order {
            let Some(compensation) = self.steps[idx].compensation.take() else {
                continue;
            };
            let step_id = self.steps[idx].step_id.clone();
            let output = self.steps[idx].output.clone().unwrap_or_default();

            match compensation(output).await {
                Ok(()) => {
                    self.steps[idx].status = StepStatus::Compensated;
                    info!(saga_id = %self.saga_id, step_id = %step_id, "Step compensated");
                    let event =
                        OutboxEvent::step_compensated(&self.saga_id, &self.correlation_id, &step_id);
                    self.emit(event).await;
                    report.compensated.push(step_id);
                }
                Err(err) => {
                    self.steps[idx].status = StepStatus::CompensationFailed;
                    error!(
                        saga_id = %self.saga_id,
                        correlation_id = %self.correlation_id,
                        content_key = %self.content_key,
                        step_id = %step_id,
                        error = %err,
                        "Compensation failed, continuing with remaining steps"
                    );
                    let event = OutboxEvent::new(EventType::CompensationFailed, &self.correlation_id, &step_id)
                        .with_saga(&self.saga_id)
                        .with_detail(err.to_string());
                    self.emit(event).await;
                    self.dead_letter(DlqRequest::compensation_failed(&self.content_key, self.retry_count))
                        .await;
                    report.failed.push(step_id);
                }
            }
        }

        self.state = SagaState::Compensated;
        let event = OutboxEvent::new(EventType::SagaCompensated, &self.correlation_id, &self.saga_id)
            .with_saga(&self.saga_id);
        self.emit(event).await;
        if report.failed.is_empty() {
            info!(saga_id = %self.saga_id, compensated = report.compensated.len(), "Saga compensated");
        } else {
            warn!(
                saga_id = %self.saga_id,
                compensated = report.compensated.len(),
                failed = report.failed.len(),
                "Saga compensated with failures"
            );
        }
        report
    }

    async fn emit(&mut self, event: OutboxEvent) {
        self.outbox.push(event.clone());
        self.sink.publish(event).await;
    }

    async fn dead_letter(&mut self, request: DlqRequest) {
        if let Some(dlq) = &self.dlq {
            let decision = dlq.submit(request).await;
            self.dead_letters.push(decision);
        }
    }

    fn invalid(&self, to: &str) -> VdpflowError {
        VdpflowError::InvalidTransition {
            content_key: self.content_key.clone(),
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DlqConfig, DlqPolicy, InMemoryDlqSink};
    use crate::events::CollectingEventSink;
    use crate::testing::{failing_step, recording_step, ExecutionLog};
    use pretty_assertions::assert_eq;

    fn dlq() -> (Arc<DeadLetterQueue>, Arc<InMemoryDlqSink>) {
        let sink = Arc::new(InMemoryDlqSink::new());
        (
            Arc::new(DeadLetterQueue::new(DlqConfig::default(), sink.clone())),
            sink,
        )
    }

    #[tokio::test]
    async fn test_all_steps_complete_in_order() {
        let log = ExecutionLog::new();
        let events = Arc::new(CollectingEventSink::new());
        let mut saga = SagaTransaction::new("corr-1", "youtube:abc").with_sink(events.clone());
        for id in ["gcs-upload", "vdp-extraction", "bigquery-load"] {
            saga.push_step(recording_step(id, &log));
        }

        saga.execute().await.unwrap();

        assert_eq!(saga.state(), SagaState::Completed);
        assert_eq!(log.forward(), vec!["gcs-upload", "vdp-extraction", "bigquery-load"]);
        assert!(log.compensated().is_empty());
        assert_eq!(
            events.names_of_type(EventType::StepCompleted),
            vec!["gcs-upload", "vdp-extraction", "bigquery-load"]
        );
        assert_eq!(events.events_of_type(EventType::SagaCompleted).len(), 1);
        assert_eq!(saga.outbox().len(), 4);
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse_and_dead_letters() {
        let log = ExecutionLog::new();
        let (dlq, dlq_sink) = dlq();
        let mut saga = SagaTransaction::new("corr-2", "youtube:abc").with_dlq(dlq);
        saga.push_step(recording_step("step-0", &log));
        saga.push_step(recording_step("step-1", &log));
        saga.push_step(failing_step("step-2", &log, "extraction timeout"));
        saga.push_step(recording_step("step-3", &log));

        let err = saga.execute().await.unwrap_err();

        assert!(err.to_string().contains("extraction timeout"));
        assert_eq!(saga.state(), SagaState::Compensated);
        assert_eq!(log.forward(), vec!["step-0", "step-1", "step-2"]);
        assert_eq!(log.compensated(), vec!["step-1", "step-0"]);
        assert_eq!(saga.steps()[3].status(), StepStatus::Pending);
        assert_eq!(saga.steps()[2].status(), StepStatus::Failed);

        let entries = dlq_sink.messages();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].error_reason.contains("extraction timeout"));
        assert_eq!(entries[0].dlq_policy, DlqPolicy::Retry);
    }

    #[tokio::test]
    async fn test_compensated_saga_cannot_execute() {
        let log = ExecutionLog::new();
        let mut saga = SagaTransaction::new("corr-5", "youtube:abc");
        saga.push_step(recording_step("step-0", &log));

        let report = saga.compensate().await;
        assert_eq!(report.attempted(), 0);

        let err = saga.execute().await.unwrap_err();
        assert!(matches!(err, VdpflowError::InvalidTransition { .. }));
        assert_eq!(saga.state(), SagaState::Compensated);
        assert!(log.forward().is_empty());
        assert_eq!(saga.steps()[0].status(), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_first_step_failure_compensates_nothing() {
        let log = ExecutionLog::new();
        let mut saga = SagaTransaction::new("corr-3", "k");
        saga.push_step(failing_step("only", &log, "boom"));

        assert!(saga.execute().await.is_err());
        assert!(log.compensated().is_empty());
        assert_eq!(saga.state(), SagaState::Compensated);
    }

    #[tokio::test]
    async fn test_compensation_failure_does_not_halt_others() {
        let log = ExecutionLog::new();
        let (dlq, dlq_sink) = dlq();
        let events = Arc::new(CollectingEventSink::new());
        let mut saga = SagaTransaction::new("corr-4", "youtube:xyz")
            .with_dlq(dlq)
            .with_sink(events.clone());

        saga.push_step(recording_step("step-0", &log));
        let failing_log = log.clone();
        saga.add_step(
            "step-1",
            || async { Ok(serde_json::json!({"uri": "gs://b/x"})) },
            move |_| async move {
                failing_log.record_compensation("step-1");
                Err(VdpflowError::transient("bucket unreachable"))
            },
        );
        saga.push_step(failing_step("step-2", &log, "boom"));

        saga.execute().await.unwrap_err();

        assert_eq!(log.compensated(), vec!["step-1", "step-0"]);
        assert_eq!(saga.steps()[1].status(), StepStatus::CompensationFailed);
        assert_eq!(saga.steps()[0].status(), StepStatus::Compensated);

        let manual = dlq_sink.with_policy(DlqPolicy::Manual);
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].error_reason, "compensation_failed");
        assert_eq!(dlq_sink.len(), 2);
        assert_eq!(events.names_of_type(EventType::CompensationFailed), vec!["step-1"]);
    }

    #[tokio::test]
    async fn test_compensation_receives_forward_output() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = seen.clone();
        let mut saga = SagaTransaction::new("corr-5", "k");
        saga.add_step(
            "upload",
            || async { Ok(serde_json::json!({"uri": "gs://b/v.mp4"})) },
            move |output| async move {
                *seen_clone.lock() = Some(output);
                Ok(())
            },
        );
        saga.add_step(
            "extract",
            || async { Err(VdpflowError::transient("timeout")) },
            |_| async { Ok(()) },
        );

        saga.execute().await.unwrap_err();
        assert_eq!(
            seen.lock().clone(),
            Some(serde_json::json!({"uri": "gs://b/v.mp4"}))
        );
    }

    #[tokio::test]
    async fn test_compensate_runs_at_most_once() {
        let log = ExecutionLog::new();
        let mut saga = SagaTransaction::new("corr-6", "k");
        saga.push_step(recording_step("a", &log));
        saga.push_step(recording_step("b", &log));
        saga.execute().await.unwrap();

        let first = saga.compensate().await;
        let second = saga.compensate().await;

        assert_eq!(first.compensated, vec!["b", "a"]);
        assert_eq!(second.attempted(), 0);
        assert_eq!(log.compensated(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_execute_twice_is_rejected() {
        let mut saga = SagaTransaction::new("corr-7", "k");
        saga.execute().await.unwrap();
        assert!(matches!(
            saga.execute().await,
            Err(VdpflowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_steps_in_execution_order() {
        let log = ExecutionLog::new();
        let mut saga = SagaTransaction::new("corr-8", "k");
        saga.push_step(recording_step("x", &log));
        saga.push_step(recording_step("y", &log));
        saga.execute().await.unwrap();

        assert_eq!(saga.completed_steps(), vec!["x", "y"]);
        assert_eq!(saga.output("y"), Some(&serde_json::json!({"step": "y"})));
    }
}
