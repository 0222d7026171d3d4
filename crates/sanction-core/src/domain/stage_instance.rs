use crate::{
    domain::{
        approval_instance::ApprovalInstanceId,
        decision::{Decision, Verdict},
        delegation,
        events::{DecisionRecorded, DelegationApplied, DomainEvent, StageCancelled, StageOpened, StageResolved},
        policy::{self, PolicyOutcome, Tally},
        repository::TimerId,
        template::Stage,
    },
    types::ApproverId,
    EngineError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Stage instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// Awaiting decisions
    Pending,

    /// Policy resolved approved
    ResolvedApproved,

    /// Policy resolved rejected
    ResolvedRejected,

    /// SLA deadline passed before resolution
    TimedOut,

    /// Closed because a sibling rejected or the instance was cancelled
    Cancelled,
}

impl StageStatus {
    /// Whether the stage is no longer accepting decisions
    pub fn is_closed(&self) -> bool {
        !matches!(self, StageStatus::Pending)
    }

    /// Whether the stage ended in a way that rejects its instance
    pub fn is_rejection(&self) -> bool {
        matches!(self, StageStatus::ResolvedRejected | StageStatus::TimedOut)
    }
}

/// Value object: Stage instance ID
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageInstanceId(pub String);

impl StageInstanceId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        StageInstanceId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for StageInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate: one opened stage of an approval instance
#[derive(Debug, Serialize, Deserialize)]
pub struct StageInstance {
    /// Unique identifier
    pub id: StageInstanceId,

    /// Owning approval instance
    pub instance_id: ApprovalInstanceId,

    /// Index of the stage in the template's stage arena
    pub stage_index: usize,

    /// Order index copied from the stage
    pub order_index: u32,

    /// Stage name
    pub name: String,

    /// Current status
    pub status: StageStatus,

    /// When the stage opened
    pub opened_at: DateTime<Utc>,

    /// `opened_at + sla_hours`
    pub deadline_at: DateTime<Utc>,

    /// When the stage left PENDING
    pub resolved_at: Option<DateTime<Utc>>,

    /// Effective eligible approvers after delegation
    pub eligible: BTreeSet<ApproverId>,

    /// Approvers who delegated their eligibility away
    pub delegated_away: BTreeSet<ApproverId>,

    /// Every recorded decision, in order
    pub decisions: Vec<Decision>,

    /// SLA timer registered for the deadline
    pub timer_id: Option<TimerId>,

    /// Domain events
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl Clone for StageInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            instance_id: self.instance_id.clone(),
            stage_index: self.stage_index,
            order_index: self.order_index,
            name: self.name.clone(),
            status: self.status,
            opened_at: self.opened_at,
            deadline_at: self.deadline_at,
            resolved_at: self.resolved_at,
            eligible: self.eligible.clone(),
            delegated_away: self.delegated_away.clone(),
            decisions: self.decisions.clone(),
            timer_id: self.timer_id.clone(),
            events: Vec::new(),
        }
    }
}

impl StageInstance {
    /// Open a stage for an approval instance
    pub fn open(
        instance_id: ApprovalInstanceId,
        stage_index: usize,
        stage: &Stage,
        eligible: BTreeSet<ApproverId>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = StageInstanceId::generate();
        let deadline_at = now + stage.sla();

        let mut stage_instance = Self {
            id: id.clone(),
            instance_id: instance_id.clone(),
            stage_index,
            order_index: stage.order_index,
            name: stage.name.clone(),
            status: StageStatus::Pending,
            opened_at: now,
            deadline_at,
            resolved_at: None,
            eligible,
            delegated_away: BTreeSet::new(),
            decisions: Vec::new(),
            timer_id: None,
            events: Vec::with_capacity(4),
        };

        stage_instance.record_event(Box::new(StageOpened {
            instance_id,
            stage_instance_id: id,
            stage_name: stage.name.clone(),
            eligible_count: stage_instance.eligible.len(),
            deadline_at,
            timestamp: now,
        }));

        stage_instance
    }

    /// Whether the stage still accepts decisions
    pub fn is_pending(&self) -> bool {
        self.status == StageStatus::Pending
    }

    /// Whether the approver cast an APPROVE or REJECT on this stage
    pub fn has_voted(&self, approver: &ApproverId) -> bool {
        self.decisions
            .iter()
            .any(|d| d.verdict.is_vote() && &d.approver == approver)
    }

    /// Number of delegations applied
    pub fn delegation_count(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.verdict == Verdict::Delegate)
            .count()
    }

    /// Counted votes of the current eligible set
    pub fn tally(&self) -> Tally {
        policy::tally(&self.eligible, &self.decisions)
    }

    /// Record a decision and re-evaluate the stage policy
    ///
    /// A DELEGATE goes through the delegation resolver and never resolves the
    /// stage. A vote is appended and the policy evaluated; a resolving outcome
    /// closes the stage. Returns the policy outcome after the decision.
    pub fn record_decision(
        &mut self,
        decision: Decision,
        stage: &Stage,
        max_delegations: usize,
    ) -> Result<PolicyOutcome, EngineError> {
        if !self.is_pending() {
            return Err(EngineError::StageClosed(format!(
                "Stage '{}' ({}) is {:?}",
                self.name, self.id, self.status
            )));
        }

        if decision.verdict == Verdict::Delegate {
            self.apply_delegation(decision, stage, max_delegations)?;
            return Ok(PolicyOutcome::Pending);
        }

        if !self.eligible.contains(&decision.approver) {
            return Err(EngineError::NotEligible(format!(
                "{} is not eligible on stage '{}'",
                decision.approver, self.name
            )));
        }

        let cast_at = decision.cast_at;
        self.record_event(Box::new(DecisionRecorded {
            instance_id: self.instance_id.clone(),
            stage_instance_id: self.id.clone(),
            approver: decision.approver.clone(),
            verdict: decision.verdict,
            timestamp: cast_at,
        }));
        self.decisions.push(decision);

        let outcome = policy::evaluate(
            &stage.policy,
            stage.allow_reject,
            &self.eligible,
            &self.decisions,
        );

        if outcome.is_resolved() {
            self.resolve(outcome, cast_at);
        }

        Ok(outcome)
    }

    fn apply_delegation(
        &mut self,
        decision: Decision,
        stage: &Stage,
        max_delegations: usize,
    ) -> Result<(), EngineError> {
        let to = decision.delegate_to.clone().ok_or_else(|| {
            EngineError::InvalidDecision(format!(
                "{} cast DELEGATE without a delegate_to",
                decision.approver
            ))
        })?;

        let eligible = delegation::resolve(self, stage, &decision.approver, &to, max_delegations)?;

        self.eligible = eligible;
        self.delegated_away.insert(decision.approver.clone());
        self.record_event(Box::new(DelegationApplied {
            instance_id: self.instance_id.clone(),
            stage_instance_id: self.id.clone(),
            from: decision.approver.clone(),
            to,
            timestamp: decision.cast_at,
        }));
        self.decisions.push(decision);

        Ok(())
    }

    /// Resolve the stage with a policy outcome
    ///
    /// Returns false, changing nothing, when the stage already left PENDING or
    /// the outcome is itself pending.
    pub fn resolve(&mut self, outcome: PolicyOutcome, now: DateTime<Utc>) -> bool {
        let status = match outcome {
            PolicyOutcome::Approved => StageStatus::ResolvedApproved,
            PolicyOutcome::Rejected => StageStatus::ResolvedRejected,
            PolicyOutcome::Pending => return false,
        };
        self.close(status, now)
    }

    /// Time the stage out; false when it already left PENDING
    pub fn time_out(&mut self, now: DateTime<Utc>) -> bool {
        self.close(StageStatus::TimedOut, now)
    }

    /// Cancel the stage; false when it already left PENDING
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }

        self.status = StageStatus::Cancelled;
        self.resolved_at = Some(now);
        self.record_event(Box::new(StageCancelled {
            instance_id: self.instance_id.clone(),
            stage_instance_id: self.id.clone(),
            timestamp: now,
        }));
        true
    }

    fn close(&mut self, status: StageStatus, now: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }

        self.status = status;
        self.resolved_at = Some(now);
        self.record_event(Box::new(StageResolved {
            instance_id: self.instance_id.clone(),
            stage_instance_id: self.id.clone(),
            status,
            timestamp: now,
        }));
        true
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
    use crate::domain::template::DecisionPolicy;
    use crate::types::RoleName;
    use chrono::Duration;

    fn stage(policy: DecisionPolicy, allow_reject: bool) -> Stage {
        Stage {
            order_index: 1,
            name: "manager".to_string(),
            policy,
            required_role: RoleName::from("managers"),
            allow_reject,
            allow_delegate: true,
            sla_hours: 24,
            parallel_group: None,
        }
    }

    fn open(stage: &Stage, members: &[&str]) -> StageInstance {
        StageInstance::open(
            ApprovalInstanceId("i-1".to_string()),
            0,
            stage,
            members.iter().map(|m| ApproverId::from(*m)).collect(),
            Utc::now(),
        )
    }

    #[test]
    fn test_open_sets_deadline_and_event() {
        let s = stage(DecisionPolicy::Any, true);
        let mut si = open(&s, &["u1", "u2"]);

        assert_eq!(si.status, StageStatus::Pending);
        assert_eq!(si.deadline_at - si.opened_at, Duration::hours(24));

        let events = si.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "stage.opened");
        assert!(si.take_events().is_empty());
    }

    #[test]
    fn test_any_resolves_and_closes() {
        let s = stage(DecisionPolicy::Any, true);
        let mut si = open(&s, &["u1", "u2"]);

        let outcome = si
            .record_decision(Decision::approve("u2", Utc::now()), &s, 8)
            .unwrap();
        assert_eq!(outcome, PolicyOutcome::Approved);
        assert_eq!(si.status, StageStatus::ResolvedApproved);
        assert!(si.resolved_at.is_some());

        let err = si
            .record_decision(Decision::approve("u1", Utc::now()), &s, 8)
            .unwrap_err();
        assert!(matches!(err, EngineError::StageClosed(_)));
        assert_eq!(si.decisions.len(), 1);
    }

    #[test]
    fn test_ineligible_decision_is_not_recorded() {
        let s = stage(DecisionPolicy::Any, true);
        let mut si = open(&s, &["u1"]);

        let err = si
            .record_decision(Decision::approve("u9", Utc::now()), &s, 8)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotEligible(_)));
        assert!(si.decisions.is_empty());
    }

    #[test]
    fn test_delegation_updates_eligibility() {
        let s = stage(DecisionPolicy::All, true);
        let mut si = open(&s, &["a", "b"]);

        let outcome = si
            .record_decision(Decision::delegate("a", "c", Utc::now()), &s, 8)
            .unwrap();
        assert_eq!(outcome, PolicyOutcome::Pending);
        assert!(si.eligible.contains(&ApproverId::from("c")));
        assert!(!si.eligible.contains(&ApproverId::from("a")));
        assert!(si.delegated_away.contains(&ApproverId::from("a")));
        assert_eq!(si.delegation_count(), 1);

        let err = si
            .record_decision(Decision::approve("a", Utc::now()), &s, 8)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotEligible(_)));

        si.record_decision(Decision::approve("b", Utc::now()), &s, 8)
            .unwrap();
        let outcome = si
            .record_decision(Decision::approve("c", Utc::now()), &s, 8)
            .unwrap();
        assert_eq!(outcome, PolicyOutcome::Approved);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let s = stage(DecisionPolicy::Any, true);
        let mut si = open(&s, &["u1"]);
        let now = Utc::now();

        assert!(si.time_out(now));
        assert!(!si.time_out(now));
        assert!(!si.resolve(PolicyOutcome::Approved, now));
        assert!(!si.cancel(now));
        assert_eq!(si.status, StageStatus::TimedOut);
        assert!(si.status.is_rejection());
    }

    #[test]
    fn test_inert_reject_keeps_stage_pending() {
        let s = stage(DecisionPolicy::Any, false);
        let mut si = open(&s, &["u1", "u2"]);

        let outcome = si
            .record_decision(Decision::reject("u1", Utc::now()), &s, 8)
            .unwrap();
        assert_eq!(outcome, PolicyOutcome::Pending);
        assert_eq!(si.tally(), Tally { approvals: 0, rejections: 1 });
        assert!(si.is_pending());
    }

    #[test]
    fn test_clone_drops_events() {
        let s = stage(DecisionPolicy::Any, true);
        let si = open(&s, &["u1"]);
        assert_eq!(si.events.len(), 1);
        assert!(si.clone().events.is_empty());
    }
}
