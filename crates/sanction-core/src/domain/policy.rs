//! Decision policy evaluation
//!
//! [`evaluate`] is a pure function of the policy, the effective eligible set
//! and the decisions recorded so far. Decisions are replayed in order and the
//! first resolving prefix wins, so a stage resolves on the decision that first
//! satisfies its policy and later decisions cannot change the outcome. Only
//! APPROVE and REJECT from currently eligible approvers are counted, and an
//! approver who votes again replaces their earlier vote.

use crate::domain::decision::{Decision, Verdict};
use crate::domain::template::DecisionPolicy;
use crate::types::ApproverId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Result of evaluating a stage policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyOutcome {
    /// Not yet resolved
    Pending,
    /// Resolved approved
    Approved,
    /// Resolved rejected
    Rejected,
}

impl PolicyOutcome {
    /// Whether the outcome resolves the stage
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PolicyOutcome::Pending)
    }
}

/// Counted votes of the eligible approvers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Approvals counted
    pub approvals: usize,
    /// Rejections counted
    pub rejections: usize,
}

/// Evaluate a stage policy against the decisions cast so far
pub fn evaluate(
    policy: &DecisionPolicy,
    allow_reject: bool,
    eligible: &BTreeSet<ApproverId>,
    decisions: &[Decision],
) -> PolicyOutcome {
    let mut votes: BTreeMap<&ApproverId, Verdict> = BTreeMap::new();

    for decision in decisions {
        if !decision.verdict.is_vote() || !eligible.contains(&decision.approver) {
            continue;
        }
        votes.insert(&decision.approver, decision.verdict);

        let outcome = outcome_for(policy, allow_reject, eligible.len(), count(&votes));
        if outcome.is_resolved() {
            return outcome;
        }
    }

    PolicyOutcome::Pending
}

/// Count the latest vote of every eligible approver
pub fn tally(eligible: &BTreeSet<ApproverId>, decisions: &[Decision]) -> Tally {
    let mut votes: BTreeMap<&ApproverId, Verdict> = BTreeMap::new();
    for decision in decisions {
        if decision.verdict.is_vote() && eligible.contains(&decision.approver) {
            votes.insert(&decision.approver, decision.verdict);
        }
    }
    count(&votes)
}

fn count(votes: &BTreeMap<&ApproverId, Verdict>) -> Tally {
    let approvals = votes.values().filter(|v| **v == Verdict::Approve).count();
    Tally {
        approvals,
        rejections: votes.len() - approvals,
    }
}

fn outcome_for(
    policy: &DecisionPolicy,
    allow_reject: bool,
    eligible_count: usize,
    tally: Tally,
) -> PolicyOutcome {
    match policy {
        DecisionPolicy::Any => {
            if tally.approvals >= 1 {
                PolicyOutcome::Approved
            } else if allow_reject && tally.rejections >= 1 {
                PolicyOutcome::Rejected
            } else {
                PolicyOutcome::Pending
            }
        }
        DecisionPolicy::All => {
            if allow_reject && tally.rejections >= 1 {
                PolicyOutcome::Rejected
            } else if eligible_count > 0 && tally.approvals == eligible_count {
                PolicyOutcome::Approved
            } else {
                PolicyOutcome::Pending
            }
        }
        DecisionPolicy::Quorum { count } => {
            let required = count.get() as usize;
            if tally.approvals >= required {
                PolicyOutcome::Approved
            } else if allow_reject && tally.rejections > eligible_count.saturating_sub(required) {
                PolicyOutcome::Rejected
            } else {
                PolicyOutcome::Pending
            }
        }
    }
}
