use crate::domain::{
    approval_instance::{ApprovalInstanceId, InstanceStatus, TerminationReason},
    decision::Verdict,
    stage_instance::{StageInstanceId, StageStatus},
    template::TemplateVersionRef,
};
use crate::types::{ApproverId, SubjectRef};
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for every state transition of the engine
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the approval instance this event belongs to
    fn instance_id(&self) -> &ApprovalInstanceId;

    /// Returns the stage instance this event belongs to, if any
    fn stage_instance_id(&self) -> Option<&StageInstanceId> {
        None
    }

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Event: approval instance started
#[derive(Debug)]
pub struct InstanceStarted {
    /// The approval instance
    pub instance_id: ApprovalInstanceId,

    /// The template version it is bound to
    pub template: TemplateVersionRef,

    /// The subject being approved
    pub subject: SubjectRef,

    /// The timestamp when the instance was created
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceStarted {
    fn event_type(&self) -> &'static str {
        "instance.started"
    }

    fn instance_id(&self) -> &ApprovalInstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: stage opened
#[derive(Debug)]
pub struct StageOpened {
    /// The approval instance
    pub instance_id: ApprovalInstanceId,

    /// The new stage instance
    pub stage_instance_id: StageInstanceId,

    /// Stage name
    pub stage_name: String,

    /// Size of the eligible set at open time
    pub eligible_count: usize,

    /// SLA deadline
    pub deadline_at: DateTime<Utc>,

    /// The timestamp when the stage opened
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StageOpened {
    fn event_type(&self) -> &'static str {
        "stage.opened"
    }

    fn instance_id(&self) -> &ApprovalInstanceId {
        &self.instance_id
    }

    fn stage_instance_id(&self) -> Option<&StageInstanceId> {
        Some(&self.stage_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: an APPROVE or REJECT was recorded
#[derive(Debug)]
pub struct DecisionRecorded {
    /// The approval instance
    pub instance_id: ApprovalInstanceId,

    /// The stage instance
    pub stage_instance_id: StageInstanceId,

    /// Who decided
    pub approver: ApproverId,

    /// The verdict
    pub verdict: Verdict,

    /// When the decision was cast
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for DecisionRecorded {
    fn event_type(&self) -> &'static str {
        "stage.decision_recorded"
    }

    fn instance_id(&self) -> &ApprovalInstanceId {
        &self.instance_id
    }

    fn stage_instance_id(&self) -> Option<&StageInstanceId> {
        Some(&self.stage_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: eligibility moved from one approver to another
#[derive(Debug)]
pub struct DelegationApplied {
    /// The approval instance
    pub instance_id: ApprovalInstanceId,

    /// The stage instance
    pub stage_instance_id: StageInstanceId,

    /// Delegator
    pub from: ApproverId,

    /// Delegate
    pub to: ApproverId,

    /// When the delegation was cast
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for DelegationApplied {
    fn event_type(&self) -> &'static str {
        "stage.delegation_applied"
    }

    fn instance_id(&self) -> &ApprovalInstanceId {
        &self.instance_id
    }

    fn stage_instance_id(&self) -> Option<&StageInstanceId> {
        Some(&self.stage_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: stage left PENDING through its policy or its deadline
#[derive(Debug)]
pub struct StageResolved {
    /// The approval instance
    pub instance_id: ApprovalInstanceId,

    /// The stage instance
    pub stage_instance_id: StageInstanceId,

    /// Resolved status
    pub status: StageStatus,

    /// The timestamp when the stage resolved
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StageResolved {
    fn event_type(&self) -> &'static str {
        match self.status {
            StageStatus::TimedOut => "stage.timed_out",
            _ => "stage.resolved",
        }
    }

    fn instance_id(&self) -> &ApprovalInstanceId {
        &self.instance_id
    }

    fn stage_instance_id(&self) -> Option<&StageInstanceId> {
        Some(&self.stage_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: pending stage closed without resolution
#[derive(Debug)]
pub struct StageCancelled {
    /// The approval instance
    pub instance_id: ApprovalInstanceId,

    /// The stage instance
    pub stage_instance_id: StageInstanceId,

    /// The timestamp when the stage was cancelled
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StageCancelled {
    fn event_type(&self) -> &'static str {
        "stage.cancelled"
    }

    fn instance_id(&self) -> &ApprovalInstanceId {
        &self.instance_id
    }

    fn stage_instance_id(&self) -> Option<&StageInstanceId> {
        Some(&self.stage_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: approval instance reached its terminal status
#[derive(Debug)]
pub struct InstanceTerminated {
    /// The approval instance
    pub instance_id: ApprovalInstanceId,

    /// Terminal status
    pub status: InstanceStatus,

    /// Why it terminated
    pub reason: TerminationReason,

    /// The timestamp when the instance terminated
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceTerminated {
    fn event_type(&self) -> &'static str {
        "instance.terminated"
    }

    fn instance_id(&self) -> &ApprovalInstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
