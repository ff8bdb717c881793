//! Change-approval consensus.
//!
//! Reviewing agents submit proposals for a pipeline or backend change; the
//! gate aggregates them into a decision and, for approved changes, a
//! rollback plan. Consensus runs out-of-band and never gates individual
//! items.

mod gate;
mod rollback;

pub use gate::{AgentProposal, AgentRole, ConsensusGate, ConsensusPolicy, ConsensusResult, Decision, SloImpact};
pub use rollback::{RollbackPlan, RollbackReport, RollbackStep, RollbackTargets};
