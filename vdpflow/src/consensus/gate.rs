//! Proposal aggregation and the consensus decision.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::info;

use super::rollback::{RollbackPlan, RollbackStep};
use crate::core::{EventType, OutboxEvent};
use crate::errors::{Result, ValidationError};
use crate::events::{noop_sink, EventSink};

/// Reviewing agent roles. Several agents may review under the same role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Strategy and prioritization.
    Commander,
    /// Backend implementation.
    Implementer,
    /// Operator-facing experience.
    Ux,
}

impl AgentRole {
    /// Every role, in evaluation order.
    pub const ALL: [Self; 3] = [Self::Commander, Self::Implementer, Self::Ux];

    /// Returns the role as a string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commander => "commander",
            Self::Implementer => "implementer",
            Self::Ux => "ux",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent's proposal for a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProposal {
    /// Role the agent reviews as.
    pub role: AgentRole,
    /// Agent identity.
    pub agent_id: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Proposed actions, separated by `;`.
    pub proposal: String,
    /// Risks the agent sees.
    #[serde(default)]
    pub risks: Vec<String>,
    /// Implementation estimate; a leading integer is read as minutes.
    #[serde(default)]
    pub implementation_time: String,
    /// Changes this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl AgentProposal {
    /// Creates a proposal with no risks and no estimate.
    #[must_use]
    pub fn new(
        role: AgentRole,
        agent_id: impl Into<String>,
        confidence: f64,
        proposal: impl Into<String>,
    ) -> Self {
        Self {
            role,
            agent_id: agent_id.into(),
            confidence,
            proposal: proposal.into(),
            risks: Vec::new(),
            implementation_time: String::new(),
            dependencies: Vec::new(),
        }
    }

    /// Adds a risk.
    #[must_use]
    pub fn with_risk(mut self, risk: impl Into<String>) -> Self {
        self.risks.push(risk.into());
        self
    }

    /// Sets the implementation estimate.
    #[must_use]
    pub fn with_implementation_time(mut self, time: impl Into<String>) -> Self {
        self.implementation_time = time.into();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Estimate in minutes: the leading integer of `implementation_time`,
    /// or 0.
    #[must_use]
    pub fn estimated_minutes(&self) -> u64 {
        static LEADING_INT: OnceLock<Option<Regex>> = OnceLock::new();
        LEADING_INT
            .get_or_init(|| Regex::new(r"^\s*\+?(\d+)").ok())
            .as_ref()
            .and_then(|re| re.captures(&self.implementation_time))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    }
}

/// Outcome of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Apply the change.
    Proceed,
    /// Revise and resubmit.
    Modify,
    /// Drop the change.
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proceed => write!(f, "PROCEED"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Expected effect of a change on service-level objectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SloImpact {
    /// No risks, short change.
    Low,
    /// Average estimate above 30 minutes.
    Medium,
    /// Any risk reported, or average estimate above 60 minutes.
    High,
}

/// Decision thresholds and optional per-role weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    /// Minimum score for `PROCEED`.
    #[serde(default = "default_proceed_threshold")]
    pub proceed_threshold: f64,
    /// Minimum score for `MODIFY`.
    #[serde(default = "default_modify_threshold")]
    pub modify_threshold: f64,
    /// Role weights for the score; missing roles weigh 1.
    #[serde(default)]
    pub weights: BTreeMap<AgentRole, f64>,
}

fn default_proceed_threshold() -> f64 {
    0.85
}

fn default_modify_threshold() -> f64 {
    0.60
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            proceed_threshold: default_proceed_threshold(),
            modify_threshold: default_modify_threshold(),
            weights: BTreeMap::new(),
        }
    }
}

impl ConsensusPolicy {
    /// Creates the default policy (0.85 / 0.60, equal weights).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, proceed: f64, modify: f64) -> Self {
        self.proceed_threshold = proceed;
        self.modify_threshold = modify;
        self
    }

    /// Weighs a role's confidence.
    #[must_use]
    pub fn with_weight(mut self, role: AgentRole, weight: f64) -> Self {
        self.weights.insert(role, weight);
        self
    }

    /// Weight of `role`.
    #[must_use]
    pub fn weight(&self, role: AgentRole) -> f64 {
        self.weights.get(&role).copied().unwrap_or(1.0)
    }

    /// Checks that thresholds are ordered within `[0, 1]` and weights are
    /// non-negative.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.proceed_threshold)
            || !in_unit(self.modify_threshold)
            || self.modify_threshold > self.proceed_threshold
        {
            return Err(ValidationError::new(
                "CONSENSUS-003-THRESHOLDS",
                format!(
                    "thresholds must satisfy 0 <= modify ({}) <= proceed ({}) <= 1",
                    self.modify_threshold, self.proceed_threshold
                ),
            )
            .with_field("consensus"));
        }
        if let Some((role, weight)) = self.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(ValidationError::new(
                "CONSENSUS-004-WEIGHT",
                format!("weight for '{role}' must be a non-negative number, got {weight}"),
            )
            .with_field("consensus.weights"));
        }
        Ok(())
    }

    /// Maps a score onto a decision.
    #[must_use]
    pub fn decide(&self, score: f64) -> Decision {
        if score >= self.proceed_threshold {
            Decision::Proceed
        } else if score >= self.modify_threshold {
            Decision::Modify
        } else {
            Decision::Reject
        }
    }
}

/// The decision record of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// The decision.
    pub decision: Decision,
    /// Weighted mean confidence.
    pub consensus_score: f64,
    /// Union of every agent's risks, first occurrence order.
    pub risks: Vec<String>,
    /// Union of proposed actions; only filled on `PROCEED`.
    pub next_actions: Vec<String>,
    /// Rollback script for an approved change; empty otherwise.
    pub rollback_plan: Vec<RollbackStep>,
    /// Largest estimate, as `"{n}min"`.
    pub estimated_time: String,
    /// Expected SLO impact.
    pub slo_impact: SloImpact,
}

impl ConsensusResult {
    /// The rollback plan as an executable value.
    #[must_use]
    pub fn rollback(&self) -> RollbackPlan {
        RollbackPlan::new(self.rollback_plan.clone())
    }
}

/// Collects proposals for one change and decides on it.
///
/// The computation is synchronous and deterministic; the only side effect
/// is a `consensus.decided` event on the configured sink.
pub struct ConsensusGate {
    policy: ConsensusPolicy,
    // Submission order, one entry per agent id.
    proposals: Vec<AgentProposal>,
    correlation_id: String,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for ConsensusGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusGate")
            .field("policy", &self.policy)
            .field("proposals", &self.proposals)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl ConsensusGate {
    /// Creates a gate for the change identified by `correlation_id`.
    #[must_use]
    pub fn new(policy: ConsensusPolicy, correlation_id: impl Into<String>) -> Self {
        Self {
            policy,
            proposals: Vec::new(),
            correlation_id: correlation_id.into(),
            sink: noop_sink(),
        }
    }

    /// Publishes the decision to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The policy.
    #[must_use]
    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    /// Adds a proposal, replacing any earlier one from the same agent.
    ///
    /// # Errors
    ///
    /// Rejects a blank agent id and confidences outside `[0, 1]`.
    pub fn submit(&mut self, proposal: AgentProposal) -> Result<()> {
        if proposal.agent_id.trim().is_empty() {
            return Err(ValidationError::new(
                "CONSENSUS-005-AGENT",
                format!("{} proposal has no agent id", proposal.role),
            )
            .with_field("agent_id")
            .into());
        }
        if !(0.0..=1.0).contains(&proposal.confidence) {
            return Err(ValidationError::new(
                "CONSENSUS-001-CONFIDENCE",
                format!(
                    "confidence {} from '{}' is outside [0, 1]",
                    proposal.confidence, proposal.agent_id
                ),
            )
            .with_field("confidence")
            .into());
        }
        match self
            .proposals
            .iter_mut()
            .find(|p| p.agent_id == proposal.agent_id)
        {
            Some(existing) => *existing = proposal,
            None => self.proposals.push(proposal),
        }
        Ok(())
    }

    /// Current proposals, in submission order.
    #[must_use]
    pub fn proposals(&self) -> Vec<&AgentProposal> {
        self.proposals.iter().collect()
    }

    /// Number of agents that have proposed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    /// Returns true if nobody has proposed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Decides on the submitted proposals.
    ///
    /// # Errors
    ///
    /// Fails on an empty round, an invalid policy, or when every proposal
    /// weighs zero.
    pub fn decide(&self) -> Result<ConsensusResult> {
        self.policy.validate()?;
        if self.proposals.is_empty() {
            return Err(ValidationError::new(
                "CONSENSUS-002-EMPTY",
                "at least one proposal is required",
            )
            .into());
        }

        let proposals = &self.proposals;
        let total_weight: f64 = proposals.iter().map(|p| self.policy.weight(p.role)).sum();
        if total_weight <= 0.0 {
            return Err(ValidationError::new(
                "CONSENSUS-004-WEIGHT",
                "proposal weights sum to zero",
            )
            .with_field("consensus.weights")
            .into());
        }
        let score = proposals
            .iter()
            .map(|p| self.policy.weight(p.role) * p.confidence)
            .sum::<f64>()
            / total_weight;
        let decision = self.policy.decide(score);

        let risks = dedup(
            self.proposals
                .iter()
                .flat_map(|p| p.risks.iter().map(String::as_str)),
        );
        let (next_actions, rollback_plan) = if decision == Decision::Proceed {
            let actions = dedup(
                self.proposals
                    .iter()
                    .flat_map(|p| p.proposal.split(';'))
                    .map(str::trim)
                    .filter(|a| !a.is_empty()),
            );
            (actions, RollbackStep::STANDARD.to_vec())
        } else {
            (Vec::new(), Vec::new())
        };

        let minutes: Vec<u64> = proposals.iter().map(|p| p.estimated_minutes()).collect();
        let max_minutes = minutes.iter().copied().max().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let avg_minutes = minutes.iter().sum::<u64>() as f64 / minutes.len() as f64;
        let slo_impact = if proposals.iter().any(|p| !p.risks.is_empty()) || avg_minutes > 60.0 {
            SloImpact::High
        } else if avg_minutes > 30.0 {
            SloImpact::Medium
        } else {
            SloImpact::Low
        };

        let result = ConsensusResult {
            decision,
            consensus_score: score,
            risks,
            next_actions,
            rollback_plan,
            estimated_time: format!("{max_minutes}min"),
            slo_impact,
        };

        info!(
            correlation_id = %self.correlation_id,
            decision = %result.decision,
            score = result.consensus_score,
            agents = proposals.len(),
            "Consensus decided"
        );
        self.sink.try_publish(
            OutboxEvent::new(EventType::ConsensusDecided, &self.correlation_id, "consensus")
                .with_detail(format!("{} ({:.2})", result.decision, result.consensus_score)),
        );
        Ok(result)
    }
}

fn dedup<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .filter(|v| seen.insert(*v))
        .map(str::to_string)
        .collect()
}
