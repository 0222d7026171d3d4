use crate::{
    application::stage_locks::KeyedLocks,
    config::EngineConfig,
    domain::{
        approval_instance::{
            ApprovalInstance, ApprovalInstanceId, InstanceStatus, SchedulerState, TerminationReason,
        },
        clock::Clock,
        decision::{Decision, Verdict},
        events::DomainEvent,
        policy::PolicyOutcome,
        repository::{
            ApprovalInstanceRepository, RoleDirectory, SlaExpired, SlaTimerRequest,
            SlaTimerService, StageInstanceRepository, TemplateRepository, TimerId,
        },
        stage_instance::{StageInstance, StageInstanceId, StageStatus},
        template::{DecisionPolicy, StageGroup, TemplateVersionRef, WorkflowTemplate},
    },
    types::{ApproverId, SubjectRef},
    EngineError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler for domain events
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), EngineError>;
}

/// Collaborators the engine is wired with
#[derive(Clone)]
pub struct EngineDependencies {
    /// Template store
    pub templates: Arc<dyn TemplateRepository>,

    /// Approval instance store
    pub instances: Arc<dyn ApprovalInstanceRepository>,

    /// Stage instance store
    pub stage_instances: Arc<dyn StageInstanceRepository>,

    /// Role membership lookup
    pub roles: Arc<dyn RoleDirectory>,

    /// SLA timers
    pub timers: Arc<dyn SlaTimerService>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Notification hook
    pub event_handler: Arc<dyn DomainEventHandler>,
}

/// Acknowledgement of an accepted decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionAck {
    /// Approval instance
    pub instance_id: ApprovalInstanceId,

    /// Stage instance the decision was recorded on
    pub stage_instance_id: StageInstanceId,

    /// Policy outcome right after the decision
    pub outcome: PolicyOutcome,

    /// Stage status right after the decision
    pub stage_status: StageStatus,

    /// Instance status once advancement ran
    pub instance_status: InstanceStatus,
}

/// What an SLA expiry did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The stage timed out
    TimedOut,

    /// The stage had already left PENDING
    AlreadyResolved,

    /// The timer fired early and was scheduled again for the remaining time
    Rescheduled,

    /// The timer fired early and rescheduling is disabled
    Early,

    /// The timer is not the one currently tracking the stage
    Superseded,
}

/// Per-stage view in an instance status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Stage instance
    pub stage_instance_id: StageInstanceId,

    /// Stage name
    pub name: String,

    /// Order index
    pub order_index: u32,

    /// Parallel group of the stage
    pub parallel_group: Option<u32>,

    /// Policy
    pub policy: DecisionPolicy,

    /// Status
    pub status: StageStatus,

    /// Effective eligible approvers
    pub eligible: Vec<ApproverId>,

    /// Counted approvals
    pub approvals: usize,

    /// Counted rejections
    pub rejections: usize,

    /// Opened at
    pub opened_at: DateTime<Utc>,

    /// SLA deadline
    pub deadline_at: DateTime<Utc>,

    /// Resolved at
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Snapshot of an approval instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatusReport {
    /// Approval instance
    pub instance_id: ApprovalInstanceId,

    /// Template version
    pub template: TemplateVersionRef,

    /// Subject
    pub subject: SubjectRef,

    /// Status
    pub status: InstanceStatus,

    /// Scheduler state
    pub scheduler_state: SchedulerState,

    /// Position of the current group in the schedule
    pub current_group: usize,

    /// Parallel group number of the current group, if it has one
    pub current_parallel_group: Option<u32>,

    /// Why the instance terminated
    pub termination_reason: Option<TerminationReason>,

    /// Every opened stage, in opening order
    pub stages: Vec<StageSummary>,
}

/// Decisions recorded on one stage instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHistory {
    /// Stage instance
    pub stage_instance_id: StageInstanceId,

    /// Stage name
    pub name: String,

    /// How the stage ended, or PENDING
    pub status: StageStatus,

    /// Decisions in the order they were recorded
    pub decisions: Vec<Decision>,
}

/// Full decision history of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionHistory {
    /// Approval instance
    pub instance_id: ApprovalInstanceId,

    /// Status
    pub status: InstanceStatus,

    /// Why the instance terminated
    pub termination_reason: Option<TerminationReason>,

    /// One entry per opened stage
    pub stages: Vec<StageHistory>,
}

/// Drives approval instances through the stages of their template
pub struct ApprovalEngine {
    templates: Arc<dyn TemplateRepository>,
    instances: Arc<dyn ApprovalInstanceRepository>,
    stage_instances: Arc<dyn StageInstanceRepository>,
    roles: Arc<dyn RoleDirectory>,
    timers: Arc<dyn SlaTimerService>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn DomainEventHandler>,
    config: Arc<EngineConfig>,
    instance_locks: Arc<KeyedLocks<ApprovalInstanceId>>,
    stage_locks: Arc<KeyedLocks<StageInstanceId>>,
}

impl Clone for ApprovalEngine {
    fn clone(&self) -> Self {
        Self {
            templates: self.templates.clone(),
            instances: self.instances.clone(),
            stage_instances: self.stage_instances.clone(),
            roles: self.roles.clone(),
            timers: self.timers.clone(),
            clock: self.clock.clone(),
            event_handler: self.event_handler.clone(),
            config: self.config.clone(),
            instance_locks: self.instance_locks.clone(),
            stage_locks: self.stage_locks.clone(),
        }
    }
}

impl ApprovalEngine {
    /// Create a new approval engine
    pub fn new(dependencies: EngineDependencies, config: EngineConfig) -> Self {
        Self {
            templates: dependencies.templates,
            instances: dependencies.instances,
            stage_instances: dependencies.stage_instances,
            roles: dependencies.roles,
            timers: dependencies.timers,
            clock: dependencies.clock,
            event_handler: dependencies.event_handler,
            config: Arc::new(config),
            instance_locks: Arc::new(KeyedLocks::new()),
            stage_locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Instance and stage locks currently held or awaited
    pub fn lock_entry_count(&self) -> usize {
        self.instance_locks.len() + self.stage_locks.len()
    }

    /// Start an approval instance for a subject
    ///
    /// Structural template problems fail the call. Role-membership problems
    /// found while opening the first group create the instance and reject it
    /// with a configuration-failure reason.
    pub async fn start_instance(
        &self,
        template_ref: &TemplateVersionRef,
        subject: SubjectRef,
    ) -> Result<ApprovalInstanceId, EngineError> {
        let template = self.load_template(template_ref).await?;

        if !template.is_active {
            return Err(EngineError::TemplateInactive(template_ref.to_string()));
        }

        if template.content_type != subject.content_type {
            return Err(EngineError::InvalidTemplate(format!(
                "Template {} governs '{}' subjects, not '{}'",
                template_ref, template.content_type, subject.content_type
            )));
        }

        template.validate()?;
        let groups = template.schedule()?;

        let mut instance = ApprovalInstance::new(template_ref.clone(), subject, self.clock.now());
        let instance_id = instance.id.clone();
        let _guard = self.instance_locks.lock(&instance_id).await;

        info!(
            instance_id = %instance_id,
            template = %template_ref,
            subject = %instance.subject,
            "Starting approval instance"
        );

        let mut events = instance.take_events();
        self.open_group(&mut instance, &template, &groups, 0, &mut events)
            .await?;

        self.instances.save(&instance).await?;
        events.extend(instance.take_events());
        drop(_guard);

        self.dispatch(events).await;

        Ok(instance_id)
    }

    /// Record a decision on an open stage instance
    pub async fn submit_decision(
        &self,
        instance_id: &ApprovalInstanceId,
        stage_instance_id: &StageInstanceId,
        approver: ApproverId,
        verdict: Verdict,
        delegate_to: Option<ApproverId>,
    ) -> Result<DecisionAck, EngineError> {
        let decision = Decision::new(approver, verdict, delegate_to, self.clock.now())?;
        let instance = self.load_instance(instance_id).await?;
        let template = self.load_template(&instance.template).await?;

        let stage_guard = self.stage_locks.lock(stage_instance_id).await;

        let mut stage_instance = self.load_stage_instance(stage_instance_id).await?;
        if &stage_instance.instance_id != instance_id {
            return Err(EngineError::StageInstanceNotFound(format!(
                "{} does not belong to instance {}",
                stage_instance_id, instance_id
            )));
        }

        let stage = template
            .stages
            .get(stage_instance.stage_index)
            .ok_or_else(|| {
                EngineError::InvalidTemplate(format!(
                    "Template {} has no stage at index {}",
                    instance.template, stage_instance.stage_index
                ))
            })?;

        let approver = decision.approver.clone();
        let outcome = match stage_instance.record_decision(
            decision,
            stage,
            self.config.max_delegation_depth,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    stage_instance_id = %stage_instance_id,
                    approver = %approver,
                    error = %e,
                    "Decision refused"
                );
                return Err(e);
            }
        };

        debug!(
            instance_id = %instance_id,
            stage_instance_id = %stage_instance_id,
            approver = %approver,
            verdict = %verdict,
            outcome = ?outcome,
            "Decision recorded"
        );

        self.stage_instances.save(&stage_instance).await?;
        let events = stage_instance.take_events();
        let stage_status = stage_instance.status;
        let timer_id = stage_instance.timer_id.clone();
        drop(stage_guard);

        self.dispatch(events).await;

        if outcome.is_resolved() {
            info!(
                instance_id = %instance_id,
                stage_instance_id = %stage_instance_id,
                stage = %stage_instance.name,
                status = ?stage_status,
                "Stage resolved"
            );

            if let Some(timer_id) = timer_id {
                self.cancel_timer(&timer_id).await;
            }

            // the decision is stored; a failed advance is retried by the next `advance` call
            if let Err(e) = self.advance(instance_id).await {
                error!(
                    instance_id = %instance_id,
                    stage_instance_id = %stage_instance_id,
                    error = %e,
                    "Failed to advance instance after a resolved stage"
                );
            }
        }

        let instance_status = self.load_instance(instance_id).await?.status;

        Ok(DecisionAck {
            instance_id: instance_id.clone(),
            stage_instance_id: stage_instance_id.clone(),
            outcome,
            stage_status,
            instance_status,
        })
    }

    /// Move an instance past its current group if that group is fully resolved
    ///
    /// Idempotent: does nothing for a terminal instance or a group with
    /// pending stages, so racing resolutions advance the instance once.
    pub async fn advance(&self, instance_id: &ApprovalInstanceId) -> Result<(), EngineError> {
        let _guard = self.instance_locks.lock(instance_id).await;

        let mut instance = self.load_instance(instance_id).await?;
        if instance.is_terminal() || instance.scheduler_state != SchedulerState::AwaitingDecisions
        {
            debug!(
                instance_id = %instance_id,
                status = ?instance.status,
                scheduler_state = ?instance.scheduler_state,
                "Nothing to advance"
            );
            return Ok(());
        }

        let template = self.load_template(&instance.template).await?;
        let groups = template.schedule()?;
        let group = groups.get(instance.current_group).ok_or_else(|| {
            EngineError::Other(format!(
                "Instance {} points at missing group {}",
                instance_id, instance.current_group
            ))
        })?;

        let group_stages: Vec<StageInstance> = self
            .stage_instances
            .find_for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|si| group.stage_indices.contains(&si.stage_index))
            .collect();

        let now = self.clock.now();
        let mut events: Vec<Box<dyn DomainEvent>> = Vec::new();

        let first_rejection = group_stages
            .iter()
            .filter(|si| si.status.is_rejection())
            .min_by_key(|si| si.resolved_at);

        if let Some(rejected) = first_rejection {
            let reason = match rejected.status {
                StageStatus::TimedOut => TerminationReason::StageTimedOut {
                    stage_instance_id: rejected.id.clone(),
                    stage_name: rejected.name.clone(),
                },
                _ => TerminationReason::StageRejected {
                    stage_instance_id: rejected.id.clone(),
                    stage_name: rejected.name.clone(),
                },
            };

            let pending: Vec<StageInstanceId> = group_stages
                .iter()
                .filter(|si| si.is_pending())
                .map(|si| si.id.clone())
                .collect();
            self.cancel_stages(&pending, now, &mut events).await?;

            instance.reject(reason, now)?;
            info!(
                instance_id = %instance_id,
                stage = %rejected.name,
                status = ?rejected.status,
                "Approval instance rejected"
            );
        } else {
            let all_approved = group_stages.len() == group.stage_indices.len()
                && group_stages
                    .iter()
                    .all(|si| si.status == StageStatus::ResolvedApproved);

            if !all_approved {
                debug!(
                    instance_id = %instance_id,
                    current_group = instance.current_group,
                    "Group still has pending stages"
                );
                return Ok(());
            }

            instance.begin_advancing(now)?;
            let next = instance.current_group + 1;
            if next < groups.len() {
                self.open_group(&mut instance, &template, &groups, next, &mut events)
                    .await?;
            } else {
                instance.approve(now)?;
                info!(instance_id = %instance_id, "Approval instance approved");
            }
        }

        self.instances.save(&instance).await?;
        events.extend(instance.take_events());
        drop(_guard);

        self.dispatch(events).await;
        Ok(())
    }

    /// Apply an SLA timer fire
    ///
    /// Repeated or late fires for a stage that already left PENDING are
    /// no-ops. A fire observed before the deadline is not applied.
    pub async fn handle_sla_expiry(&self, expiry: &SlaExpired) -> Result<ExpiryOutcome, EngineError> {
        let stage_guard = self.stage_locks.lock(&expiry.stage_instance_id).await;

        let mut stage_instance = self.load_stage_instance(&expiry.stage_instance_id).await?;

        if !stage_instance.is_pending() {
            warn!(
                instance_id = %expiry.instance_id,
                stage_instance_id = %expiry.stage_instance_id,
                timer_id = %expiry.timer_id,
                status = ?stage_instance.status,
                "Ignoring timer for a closed stage"
            );
            return Ok(ExpiryOutcome::AlreadyResolved);
        }

        if let Some(current) = &stage_instance.timer_id {
            if current != &expiry.timer_id {
                warn!(
                    stage_instance_id = %expiry.stage_instance_id,
                    timer_id = %expiry.timer_id,
                    current_timer_id = %current,
                    "Ignoring superseded timer"
                );
                return Ok(ExpiryOutcome::Superseded);
            }
        }

        let now = self.clock.now();
        if now < stage_instance.deadline_at {
            if !self.config.reschedule_early_timers {
                warn!(
                    stage_instance_id = %expiry.stage_instance_id,
                    deadline_at = %stage_instance.deadline_at,
                    "Ignoring timer that fired before the deadline"
                );
                return Ok(ExpiryOutcome::Early);
            }

            let remaining = remaining_until(stage_instance.deadline_at, now);
            let timer_id = self
                .timers
                .schedule(
                    SlaTimerRequest {
                        instance_id: stage_instance.instance_id.clone(),
                        stage_instance_id: stage_instance.id.clone(),
                    },
                    remaining,
                )
                .await?;

            debug!(
                stage_instance_id = %expiry.stage_instance_id,
                timer_id = %timer_id,
                remaining_ms = remaining.as_millis() as u64,
                "Rescheduled early timer"
            );

            stage_instance.timer_id = Some(timer_id);
            self.stage_instances.save(&stage_instance).await?;
            return Ok(ExpiryOutcome::Rescheduled);
        }

        stage_instance.time_out(now);
        self.stage_instances.save(&stage_instance).await?;
        let events = stage_instance.take_events();
        drop(stage_guard);

        info!(
            instance_id = %stage_instance.instance_id,
            stage_instance_id = %stage_instance.id,
            stage = %stage_instance.name,
            "Stage timed out"
        );

        self.dispatch(events).await;
        if let Err(e) = self.advance(&stage_instance.instance_id).await {
            error!(
                instance_id = %stage_instance.instance_id,
                stage_instance_id = %stage_instance.id,
                error = %e,
                "Failed to advance instance after a timeout"
            );
        }

        Ok(ExpiryOutcome::TimedOut)
    }

    /// Cancel an in-progress instance, closing its pending stages
    pub async fn cancel_instance(
        &self,
        instance_id: &ApprovalInstanceId,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let _guard = self.instance_locks.lock(instance_id).await;

        let mut instance = self.load_instance(instance_id).await?;
        let now = self.clock.now();
        instance.cancel(reason, now)?;

        let mut events: Vec<Box<dyn DomainEvent>> = Vec::new();
        let pending: Vec<StageInstanceId> = self
            .stage_instances
            .find_for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|si| si.is_pending())
            .map(|si| si.id)
            .collect();
        self.cancel_stages(&pending, now, &mut events).await?;

        self.instances.save(&instance).await?;
        events.extend(instance.take_events());
        drop(_guard);

        info!(instance_id = %instance_id, "Approval instance cancelled");
        self.dispatch(events).await;
        Ok(())
    }

    /// Status of an instance with a summary of every opened stage
    pub async fn get_instance_status(
        &self,
        instance_id: &ApprovalInstanceId,
    ) -> Result<InstanceStatusReport, EngineError> {
        let instance = self.load_instance(instance_id).await?;
        let template = self.load_template(&instance.template).await?;
        let groups = template.schedule()?;
        let stage_instances = self.stage_instances.find_for_instance(instance_id).await?;

        let stages = stage_instances
            .iter()
            .filter_map(|si| {
                let stage = template.stages.get(si.stage_index)?;
                let tally = si.tally();
                Some(StageSummary {
                    stage_instance_id: si.id.clone(),
                    name: si.name.clone(),
                    order_index: si.order_index,
                    parallel_group: stage.parallel_group,
                    policy: stage.policy,
                    status: si.status,
                    eligible: si.eligible.iter().cloned().collect(),
                    approvals: tally.approvals,
                    rejections: tally.rejections,
                    opened_at: si.opened_at,
                    deadline_at: si.deadline_at,
                    resolved_at: si.resolved_at,
                })
            })
            .collect();

        Ok(InstanceStatusReport {
            instance_id: instance.id.clone(),
            template: instance.template.clone(),
            subject: instance.subject.clone(),
            status: instance.status,
            scheduler_state: instance.scheduler_state,
            current_group: instance.current_group,
            current_parallel_group: groups
                .get(instance.current_group)
                .and_then(|g| g.parallel_group),
            termination_reason: instance.termination_reason.clone(),
            stages,
        })
    }

    /// Every recorded decision of an instance, grouped by stage instance
    pub async fn decision_history(
        &self,
        instance_id: &ApprovalInstanceId,
    ) -> Result<DecisionHistory, EngineError> {
        let instance = self.load_instance(instance_id).await?;
        let stages = self
            .stage_instances
            .find_for_instance(instance_id)
            .await?
            .into_iter()
            .map(|si| StageHistory {
                stage_instance_id: si.id,
                name: si.name,
                status: si.status,
                decisions: si.decisions,
            })
            .collect();

        Ok(DecisionHistory {
            instance_id: instance.id,
            status: instance.status,
            termination_reason: instance.termination_reason,
            stages,
        })
    }

    /// List instances, optionally filtered by status and subject
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        subject: Option<&SubjectRef>,
    ) -> Result<Vec<ApprovalInstance>, EngineError> {
        self.instances.list_instances(status, subject).await
    }

    /// Consume SLA expiry events until the channel closes
    pub fn spawn_expiry_listener(&self, mut rx: mpsc::Receiver<SlaExpired>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(expiry) = rx.recv().await {
                match engine.handle_sla_expiry(&expiry).await {
                    Ok(outcome) => debug!(
                        stage_instance_id = %expiry.stage_instance_id,
                        outcome = ?outcome,
                        "Applied SLA expiry"
                    ),
                    Err(e) => error!(
                        instance_id = %expiry.instance_id,
                        stage_instance_id = %expiry.stage_instance_id,
                        error = %e,
                        "Failed to apply SLA expiry"
                    ),
                }
            }
            debug!("SLA expiry channel closed");
        })
    }

    /// Open every stage of the group at `position`
    ///
    /// Role membership of the whole group is resolved first; an empty role or
    /// an unreachable quorum rejects the instance before any stage opens.
    /// Every SLA timer is scheduled before any stage instance is saved, and a
    /// scheduling failure cancels the timers already taken and saves nothing.
    /// Stage instances stored by an earlier interrupted attempt are picked up
    /// again instead of being opened a second time.
    async fn open_group(
        &self,
        instance: &mut ApprovalInstance,
        template: &WorkflowTemplate,
        groups: &[StageGroup],
        position: usize,
        events: &mut Vec<Box<dyn DomainEvent>>,
    ) -> Result<(), EngineError> {
        let group = groups.get(position).ok_or_else(|| {
            EngineError::Other(format!("Template {} has no group {}", template.version_ref(), position))
        })?;

        let now = self.clock.now();
        instance.open_group(position, now)?;

        let resumed: Vec<StageInstance> = self
            .stage_instances
            .find_for_instance(&instance.id)
            .await?
            .into_iter()
            .filter(|si| group.stage_indices.contains(&si.stage_index))
            .filter(|si| !instance.opened_stages.contains(&si.stage_index))
            .collect();

        let mut members: Vec<(usize, BTreeSet<ApproverId>)> = Vec::with_capacity(group.stage_indices.len());
        for &stage_index in &group.stage_indices {
            if resumed.iter().any(|si| si.stage_index == stage_index) {
                continue;
            }

            let stage = &template.stages[stage_index];
            let eligible = self.roles.members_of(&stage.required_role).await?;

            let failure = if eligible.is_empty() {
                Some(TerminationReason::EmptyEligibleSet {
                    stage_name: stage.name.clone(),
                    required_role: stage.required_role.clone(),
                })
            } else {
                match stage.policy.quorum_count() {
                    Some(count) if count as usize > eligible.len() => {
                        Some(TerminationReason::QuorumUnreachable {
                            stage_name: stage.name.clone(),
                            quorum_count: count,
                            eligible_count: eligible.len(),
                        })
                    }
                    _ => None,
                }
            };

            if let Some(reason) = failure {
                warn!(
                    instance_id = %instance.id,
                    stage = %stage.name,
                    role = %stage.required_role,
                    reason = ?reason,
                    "Cannot open stage, rejecting instance"
                );
                let pending: Vec<StageInstanceId> = resumed
                    .iter()
                    .filter(|si| si.is_pending())
                    .map(|si| si.id.clone())
                    .collect();
                self.cancel_stages(&pending, now, events).await?;
                instance.reject(reason, now)?;
                return Ok(());
            }

            members.push((stage_index, eligible));
        }

        let mut opened: Vec<StageInstance> = Vec::with_capacity(members.len());
        for (stage_index, eligible) in members {
            let stage = &template.stages[stage_index];
            let mut stage_instance =
                StageInstance::open(instance.id.clone(), stage_index, stage, eligible, now);

            let scheduled = self
                .timers
                .schedule(
                    SlaTimerRequest {
                        instance_id: instance.id.clone(),
                        stage_instance_id: stage_instance.id.clone(),
                    },
                    remaining_until(stage_instance.deadline_at, now),
                )
                .await;

            match scheduled {
                Ok(timer_id) => {
                    stage_instance.timer_id = Some(timer_id);
                    opened.push(stage_instance);
                }
                Err(e) => {
                    error!(
                        instance_id = %instance.id,
                        stage = %stage.name,
                        error = %e,
                        "Failed to schedule SLA timer, group not opened"
                    );
                    for taken in opened.iter().filter_map(|si| si.timer_id.as_ref()) {
                        self.cancel_timer(taken).await;
                    }
                    return Err(e);
                }
            }
        }

        for stage_instance in &mut opened {
            self.stage_instances.save(stage_instance).await?;
            events.extend(stage_instance.take_events());

            info!(
                instance_id = %instance.id,
                stage_instance_id = %stage_instance.id,
                stage = %stage_instance.name,
                eligible = stage_instance.eligible.len(),
                deadline_at = %stage_instance.deadline_at,
                "Stage opened"
            );
        }

        for si in &resumed {
            debug!(
                instance_id = %instance.id,
                stage_instance_id = %si.id,
                stage = %si.name,
                "Resuming stage opened by an earlier attempt"
            );
        }

        let mut registered: Vec<(usize, StageInstanceId)> = resumed
            .iter()
            .chain(opened.iter())
            .map(|si| (si.stage_index, si.id.clone()))
            .collect();
        registered.sort_by_key(|(stage_index, _)| *stage_index);
        for (stage_index, id) in registered {
            instance.register_stage(stage_index, id, now)?;
        }

        instance.await_decisions(now)?;
        Ok(())
    }

    /// Cancel pending stages under their locks and stop their timers
    async fn cancel_stages(
        &self,
        stage_instance_ids: &[StageInstanceId],
        now: DateTime<Utc>,
        events: &mut Vec<Box<dyn DomainEvent>>,
    ) -> Result<(), EngineError> {
        for id in stage_instance_ids {
            let _stage_guard = self.stage_locks.lock(id).await;
            let mut stage_instance = self.load_stage_instance(id).await?;

            if stage_instance.cancel(now) {
                self.stage_instances.save(&stage_instance).await?;
                events.extend(stage_instance.take_events());
                debug!(stage_instance_id = %id, "Stage cancelled");

                if let Some(timer_id) = &stage_instance.timer_id {
                    self.cancel_timer(timer_id).await;
                }
            }
        }
        Ok(())
    }

    async fn cancel_timer(&self, timer_id: &TimerId) {
        match self.timers.cancel(timer_id).await {
            Ok(true) => debug!(timer_id = %timer_id, "Cancelled SLA timer"),
            Ok(false) => debug!(timer_id = %timer_id, "SLA timer already gone"),
            Err(e) => warn!(timer_id = %timer_id, error = %e, "Failed to cancel SLA timer"),
        }
    }

    async fn dispatch(&self, events: Vec<Box<dyn DomainEvent>>) {
        for event in events {
            let event_type = event.event_type();
            let instance_id = event.instance_id().clone();
            if let Err(e) = self.event_handler.handle_event(event).await {
                warn!(
                    instance_id = %instance_id,
                    event_type = event_type,
                    error = %e,
                    "Event handler failed"
                );
            }
        }
    }

    async fn load_template(&self, version: &TemplateVersionRef) -> Result<WorkflowTemplate, EngineError> {
        self.templates
            .find(version)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(version.to_string()))
    }

    async fn load_instance(&self, id: &ApprovalInstanceId) -> Result<ApprovalInstance, EngineError> {
        self.instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))
    }

    async fn load_stage_instance(&self, id: &StageInstanceId) -> Result<StageInstance, EngineError> {
        self.stage_instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::StageInstanceNotFound(id.to_string()))
    }
}

fn remaining_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}
