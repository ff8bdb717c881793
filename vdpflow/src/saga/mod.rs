//! Saga transactions with compensating actions.
//!
//! A saga runs ordered forward steps. When one fails, every step that
//! already completed is compensated in reverse order, failed compensations
//! are dead-lettered, and the triggering error is returned to the caller.

mod compensation;
mod transaction;

pub use compensation::{
    CompensationAction, CompensationExecutor, CompensationKind, IdempotentCompensator,
};
pub use transaction::{
    CompensationFn, CompensationReport, ForwardFn, SagaState, SagaStep, SagaTransaction,
    StepStatus,
};
