//! Saga step builders that record execution order.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::errors::VdpflowError;
use crate::saga::SagaStep;

#[derive(Debug, Default)]
struct LogInner {
    forward: Vec<String>,
    compensated: Vec<String>,
}

/// Shared record of forward and compensation calls.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    inner: Arc<Mutex<LogInner>>,
}

impl ExecutionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a forward call.
    pub fn record_forward(&self, step_id: &str) {
        self.inner.lock().forward.push(step_id.to_string());
    }

    /// Records a compensation call.
    pub fn record_compensation(&self, step_id: &str) {
        self.inner.lock().compensated.push(step_id.to_string());
    }

    /// Forward calls, in order.
    #[must_use]
    pub fn forward(&self) -> Vec<String> {
        self.inner.lock().forward.clone()
    }

    /// Compensation calls, in order.
    #[must_use]
    pub fn compensated(&self) -> Vec<String> {
        self.inner.lock().compensated.clone()
    }
}

/// A step that succeeds with `{"step": id}` and logs both directions.
#[must_use]
pub fn recording_step(step_id: &str, log: &ExecutionLog) -> SagaStep {
    let (forward_log, comp_log) = (log.clone(), log.clone());
    let (forward_id, comp_id) = (step_id.to_string(), step_id.to_string());
    SagaStep::new(
        step_id,
        move || async move {
            forward_log.record_forward(&forward_id);
            Ok(serde_json::json!({ "step": forward_id }))
        },
        move |_| async move {
            comp_log.record_compensation(&comp_id);
            Ok(())
        },
    )
}

/// A step whose forward action fails with `message`.
#[must_use]
pub fn failing_step(step_id: &str, log: &ExecutionLog, message: &str) -> SagaStep {
    let (forward_log, comp_log) = (log.clone(), log.clone());
    let (forward_id, comp_id) = (step_id.to_string(), step_id.to_string());
    let message = message.to_string();
    SagaStep::new(
        step_id,
        move || async move {
            forward_log.record_forward(&forward_id);
            Err(VdpflowError::step_failed(forward_id, message))
        },
        move |_| async move {
            comp_log.record_compensation(&comp_id);
            Ok(())
        },
    )
}
