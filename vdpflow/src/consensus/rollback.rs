//! Rollback scripts for approved changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::dlq::DeadLetterQueue;
use crate::resilience::CircuitBreaker;
use crate::saga::SagaTransaction;

/// One step of a rollback script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStep {
    /// Force the affected breakers open.
    CircuitBreakerOpen,
    /// Park new dead letters for manual handling.
    DlqIsolation,
    /// Compensate in-flight sagas.
    SagaCompensation,
}

impl RollbackStep {
    /// The script attached to every approved change.
    pub const STANDARD: [Self; 3] = [
        Self::CircuitBreakerOpen,
        Self::DlqIsolation,
        Self::SagaCompensation,
    ];

    /// Returns the step as a string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::DlqIsolation => "dlq_isolation",
            Self::SagaCompensation => "saga_compensation",
        }
    }
}

impl fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rollback acts on. Empty targets make the matching step a no-op.
#[derive(Default)]
pub struct RollbackTargets<'a> {
    /// Breakers to force open.
    pub breakers: Vec<Arc<CircuitBreaker>>,
    /// Queue to isolate.
    pub dlq: Option<Arc<DeadLetterQueue>>,
    /// Sagas to compensate.
    pub sagas: Vec<&'a mut SagaTransaction>,
}

/// Summary of an applied rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Steps applied, in order.
    pub applied: Vec<RollbackStep>,
    /// Breakers forced open.
    pub breakers_opened: Vec<String>,
    /// Whether the DLQ was isolated.
    pub dlq_isolated: bool,
    /// Saga steps compensated.
    pub steps_compensated: usize,
    /// Saga steps whose compensation failed.
    pub compensation_failures: usize,
}

/// An ordered rollback script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    /// Creates a plan from steps.
    #[must_use]
    pub fn new(steps: Vec<RollbackStep>) -> Self {
        Self { steps }
    }

    /// The standard three-step plan.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(RollbackStep::STANDARD.to_vec())
    }

    /// The steps, in order.
    #[must_use]
    pub fn steps(&self) -> &[RollbackStep] {
        &self.steps
    }

    /// Returns true for a plan with nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the steps in order against `targets`.
    ///
    /// Saga compensation is best-effort; failures are counted, not
    /// returned.
    pub async fn apply(&self, targets: RollbackTargets<'_>) -> RollbackReport {
        let RollbackTargets {
            breakers,
            dlq,
            mut sagas,
        } = targets;
        let mut report = RollbackReport::default();

        for step in &self.steps {
            match step {
                RollbackStep::CircuitBreakerOpen => {
                    for breaker in &breakers {
                        breaker.force_open();
                        report.breakers_opened.push(breaker.name().to_string());
                    }
                }
                RollbackStep::DlqIsolation => {
                    if let Some(dlq) = &dlq {
                        dlq.isolate();
                        report.dlq_isolated = true;
                    }
                }
                RollbackStep::SagaCompensation => {
                    for saga in &mut sagas {
                        let outcome = saga.compensate().await;
                        report.steps_compensated += outcome.compensated.len();
                        report.compensation_failures += outcome.failed.len();
                    }
                }
            }
            report.applied.push(*step);
        }

        if report.compensation_failures > 0 {
            warn!(
                failures = report.compensation_failures,
                "Rollback applied with compensation failures"
            );
        } else {
            info!(steps = ?report.applied, "Rollback applied");
        }
        report
    }
}
