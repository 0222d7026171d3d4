use crate::{types::ApproverId, EngineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an approver decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Approve the stage
    Approve,

    /// Reject the stage
    Reject,

    /// Hand eligibility to another approver
    Delegate,
}

impl Verdict {
    /// Whether the verdict counts toward the stage policy
    pub fn is_vote(&self) -> bool {
        matches!(self, Verdict::Approve | Verdict::Reject)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Approve => "APPROVE",
            Verdict::Reject => "REJECT",
            Verdict::Delegate => "DELEGATE",
        };
        f.write_str(label)
    }
}

/// An immutable decision cast on a stage instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Who cast the decision
    pub approver: ApproverId,

    /// The verdict
    pub verdict: Verdict,

    /// Delegation target, present iff the verdict is DELEGATE
    pub delegate_to: Option<ApproverId>,

    /// When the decision was cast
    pub cast_at: DateTime<Utc>,
}

impl Decision {
    /// Create a decision, checking that `delegate_to` accompanies DELEGATE and only DELEGATE
    pub fn new(
        approver: ApproverId,
        verdict: Verdict,
        delegate_to: Option<ApproverId>,
        cast_at: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        match (verdict, &delegate_to) {
            (Verdict::Delegate, None) => {
                return Err(EngineError::InvalidDecision(format!(
                    "{} cast DELEGATE without a delegate_to",
                    approver
                )))
            }
            (Verdict::Approve | Verdict::Reject, Some(target)) => {
                return Err(EngineError::InvalidDecision(format!(
                    "{} cast {} with delegate_to {}",
                    approver, verdict, target
                )))
            }
            _ => {}
        }

        Ok(Self {
            approver,
            verdict,
            delegate_to,
            cast_at,
        })
    }

    /// An APPROVE decision
    pub fn approve(approver: impl Into<ApproverId>, cast_at: DateTime<Utc>) -> Self {
        Self {
            approver: approver.into(),
            verdict: Verdict::Approve,
            delegate_to: None,
            cast_at,
        }
    }

    /// A REJECT decision
    pub fn reject(approver: impl Into<ApproverId>, cast_at: DateTime<Utc>) -> Self {
        Self {
            approver: approver.into(),
            verdict: Verdict::Reject,
            delegate_to: None,
            cast_at,
        }
    }

    /// A DELEGATE decision
    pub fn delegate(
        approver: impl Into<ApproverId>,
        to: impl Into<ApproverId>,
        cast_at: DateTime<Utc>,
    ) -> Self {
        Self {
            approver: approver.into(),
            verdict: Verdict::Delegate,
            delegate_to: Some(to.into()),
            cast_at,
        }
    }
}
