use crate::{
    domain::{
        events::{DomainEvent, InstanceStarted, InstanceTerminated},
        stage_instance::StageInstanceId,
        template::TemplateVersionRef,
    },
    types::{RoleName, SubjectRef},
    EngineError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Approval instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Stages are still open
    InProgress,

    /// Every group resolved approved
    Approved,

    /// A stage rejected, timed out, or could not be opened
    Rejected,

    /// Cancelled by a caller
    Cancelled,
}

impl InstanceStatus {
    /// Whether the status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::InProgress)
    }
}

/// Where the stage scheduler stands for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    /// Opening the stages of the current group
    Opening,

    /// Waiting for the current group to resolve
    AwaitingDecisions,

    /// Current group resolved, moving on
    Advancing,

    /// Instance reached a terminal status
    Terminated,
}

/// Why an instance reached its terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// Every group resolved approved
    AllStagesApproved,

    /// A stage policy resolved rejected
    StageRejected {
        /// Rejected stage instance
        stage_instance_id: StageInstanceId,
        /// Stage name
        stage_name: String,
    },

    /// A stage passed its SLA deadline
    StageTimedOut {
        /// Timed out stage instance
        stage_instance_id: StageInstanceId,
        /// Stage name
        stage_name: String,
    },

    /// The required role had no members when the stage opened
    EmptyEligibleSet {
        /// Stage name
        stage_name: String,
        /// Role that resolved to nobody
        required_role: RoleName,
    },

    /// The quorum exceeded the number of eligible approvers at open time
    QuorumUnreachable {
        /// Stage name
        stage_name: String,
        /// Configured quorum
        quorum_count: u32,
        /// Eligible approvers found
        eligible_count: usize,
    },

    /// Cancelled by a caller
    Cancelled {
        /// Caller-supplied reason
        reason: String,
    },
}

impl TerminationReason {
    /// Whether the reason is a configuration failure found while opening a stage
    pub fn is_configuration_failure(&self) -> bool {
        matches!(
            self,
            TerminationReason::EmptyEligibleSet { .. } | TerminationReason::QuorumUnreachable { .. }
        )
    }
}

/// Value object: Approval instance ID
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApprovalInstanceId(pub String);

impl fmt::Display for ApprovalInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate: a subject travelling through a template
#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalInstance {
    /// Unique identifier
    pub id: ApprovalInstanceId,

    /// Template version the instance is bound to
    pub template: TemplateVersionRef,

    /// Subject being approved
    pub subject: SubjectRef,

    /// Current status
    pub status: InstanceStatus,

    /// Scheduler state
    pub scheduler_state: SchedulerState,

    /// Position of the open group in the template schedule
    pub current_group: usize,

    /// Stage instances in the order they were opened
    pub stage_instances: Vec<StageInstanceId>,

    /// Template stage indices already opened
    pub opened_stages: BTreeSet<usize>,

    /// Set once the instance is terminal
    pub termination_reason: Option<TerminationReason>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,

    /// Domain events
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl Clone for ApprovalInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            template: self.template.clone(),
            subject: self.subject.clone(),
            status: self.status,
            scheduler_state: self.scheduler_state,
            current_group: self.current_group,
            stage_instances: self.stage_instances.clone(),
            opened_stages: self.opened_stages.clone(),
            termination_reason: self.termination_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            events: Vec::new(),
        }
    }
}

impl ApprovalInstance {
    /// Create a new instance positioned on the first group
    pub fn new(template: TemplateVersionRef, subject: SubjectRef, now: DateTime<Utc>) -> Self {
        let id = ApprovalInstanceId(Uuid::new_v4().to_string());

        let mut instance = Self {
            id: id.clone(),
            template: template.clone(),
            subject: subject.clone(),
            status: InstanceStatus::InProgress,
            scheduler_state: SchedulerState::Opening,
            current_group: 0,
            stage_instances: Vec::new(),
            opened_stages: BTreeSet::new(),
            termination_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            events: Vec::with_capacity(4),
        };

        instance.record_event(Box::new(InstanceStarted {
            instance_id: id,
            template,
            subject,
            timestamp: now,
        }));

        instance
    }

    /// Whether the instance reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Register a newly opened stage; a stage opens at most once per instance
    pub fn register_stage(
        &mut self,
        stage_index: usize,
        stage_instance_id: StageInstanceId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.ensure_in_progress()?;

        if !self.opened_stages.insert(stage_index) {
            return Err(EngineError::Other(format!(
                "Stage {} was already opened for instance {}",
                stage_index, self.id
            )));
        }

        self.stage_instances.push(stage_instance_id);
        self.updated_at = now;
        Ok(())
    }

    /// Every stage of the current group is open
    pub fn await_decisions(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.ensure_in_progress()?;
        self.scheduler_state = SchedulerState::AwaitingDecisions;
        self.updated_at = now;
        Ok(())
    }

    /// The current group resolved approved
    pub fn begin_advancing(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.scheduler_state != SchedulerState::AwaitingDecisions {
            return Err(EngineError::Other(format!(
                "Cannot advance instance {} in scheduler state: {:?}",
                self.id, self.scheduler_state
            )));
        }

        self.scheduler_state = SchedulerState::Advancing;
        self.updated_at = now;
        Ok(())
    }

    /// Move to the group at `position` and start opening it
    pub fn open_group(&mut self, position: usize, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.ensure_in_progress()?;
        self.current_group = position;
        self.scheduler_state = SchedulerState::Opening;
        self.updated_at = now;
        Ok(())
    }

    /// Finish the instance as APPROVED
    pub fn approve(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.terminate(InstanceStatus::Approved, TerminationReason::AllStagesApproved, now)
    }

    /// Finish the instance as REJECTED
    pub fn reject(&mut self, reason: TerminationReason, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.terminate(InstanceStatus::Rejected, reason, now)
    }

    /// Finish the instance as CANCELLED
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.terminate(
            InstanceStatus::Cancelled,
            TerminationReason::Cancelled {
                reason: reason.into(),
            },
            now,
        )
    }

    fn terminate(
        &mut self,
        status: InstanceStatus,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.ensure_in_progress()?;

        self.status = status;
        self.scheduler_state = SchedulerState::Terminated;
        self.termination_reason = Some(reason.clone());
        self.updated_at = now;
        self.completed_at = Some(now);

        self.record_event(Box::new(InstanceTerminated {
            instance_id: self.id.clone(),
            status,
            reason,
            timestamp: now,
        }));

        Ok(())
    }

    fn ensure_in_progress(&self) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::InstanceClosed(format!(
                "Instance {} is {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Take all recorded domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn create_instance() -> ApprovalInstance {
        ApprovalInstance::new(
            TemplateVersionRef::new("PO", 1),
            SubjectRef::new("purchase_order", "PO-1"),
            Utc::now(),
        )
    }

    #[test]
    fn test_instance_creation() {
        let mut instance = create_instance();

        assert_eq!(instance.status, InstanceStatus::InProgress);
        assert_eq!(instance.scheduler_state, SchedulerState::Opening);
        assert_eq!(instance.current_group, 0);

        let events = instance.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "instance.started");
    }

    #[test]
    fn test_stage_opens_at_most_once() {
        let mut instance = create_instance();
        let now = Utc::now();

        instance
            .register_stage(0, StageInstanceId("s-1".to_string()), now)
            .unwrap();
        assert!(instance
            .register_stage(0, StageInstanceId("s-2".to_string()), now)
            .is_err());
        assert_eq!(instance.stage_instances.len(), 1);
    }

    #[test]
    fn test_scheduler_transitions() {
        let mut instance = create_instance();
        let now = Utc::now();

        assert!(instance.begin_advancing(now).is_err());
        instance.await_decisions(now).unwrap();
        instance.begin_advancing(now).unwrap();
        assert_eq!(instance.scheduler_state, SchedulerState::Advancing);
        instance.open_group(1, now).unwrap();
        assert_eq!(instance.current_group, 1);
        assert_eq!(instance.scheduler_state, SchedulerState::Opening);
    }

    #[test]
    fn test_terminal_status_reached_once() {
        let mut instance = create_instance();
        let now = Utc::now();
        instance.take_events();

        instance.approve(now).unwrap();
        assert_eq!(instance.status, InstanceStatus::Approved);
        assert_eq!(instance.scheduler_state, SchedulerState::Terminated);
        assert_eq!(
            instance.termination_reason,
            Some(TerminationReason::AllStagesApproved)
        );

        let err = instance
            .reject(
                TerminationReason::StageRejected {
                    stage_instance_id: StageInstanceId("s".to_string()),
                    stage_name: "x".to_string(),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceClosed(_)));
        assert!(matches!(instance.cancel("late", now), Err(EngineError::InstanceClosed(_))));
        assert_eq!(instance.status, InstanceStatus::Approved);
        assert_eq!(instance.take_events().len(), 1);
    }

    #[test]
    fn test_termination_reason_serialization() {
        let reason = TerminationReason::QuorumUnreachable {
            stage_name: "board".to_string(),
            quorum_count: 3,
            eligible_count: 2,
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["kind"], "QUORUM_UNREACHABLE");
        assert!(reason.is_configuration_failure());
        assert!(!TerminationReason::AllStagesApproved.is_configuration_failure());
    }
}
