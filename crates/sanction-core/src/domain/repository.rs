//! Collaborator traits for the approval engine
//!
//! Persistence, role lookup and SLA timers live outside the engine. External
//! crates implement these traits to plug in their own technology.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use super::approval_instance::{ApprovalInstance, ApprovalInstanceId, InstanceStatus};
use super::stage_instance::{StageInstance, StageInstanceId};
use super::template::{TemplateVersionRef, WorkflowTemplate};
use crate::types::{ApproverId, RoleName, SubjectRef, TemplateCode};
use crate::EngineError;

/// Store for workflow templates
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Find one template version
    async fn find(&self, version: &TemplateVersionRef) -> Result<Option<WorkflowTemplate>, EngineError>;

    /// Highest version stored for a template code
    async fn latest_version(&self, code: &TemplateCode) -> Result<Option<u32>, EngineError>;

    /// Save a template version
    async fn save(&self, template: &WorkflowTemplate) -> Result<(), EngineError>;

    /// List every stored version of a template code
    async fn list_versions(&self, code: &TemplateCode) -> Result<Vec<WorkflowTemplate>, EngineError>;
}

/// Store for approval instances
#[async_trait]
pub trait ApprovalInstanceRepository: Send + Sync {
    /// Find an approval instance by ID
    async fn find_by_id(&self, id: &ApprovalInstanceId) -> Result<Option<ApprovalInstance>, EngineError>;

    /// Save an approval instance
    async fn save(&self, instance: &ApprovalInstance) -> Result<(), EngineError>;

    /// List approval instances with optional filters
    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        subject: Option<&SubjectRef>,
    ) -> Result<Vec<ApprovalInstance>, EngineError>;

    /// Whether any instance is bound to the template version
    async fn is_template_referenced(&self, version: &TemplateVersionRef) -> Result<bool, EngineError>;
}

/// Store for stage instances
#[async_trait]
pub trait StageInstanceRepository: Send + Sync {
    /// Find a stage instance by ID
    async fn find_by_id(&self, id: &StageInstanceId) -> Result<Option<StageInstance>, EngineError>;

    /// Save a stage instance
    async fn save(&self, stage_instance: &StageInstance) -> Result<(), EngineError>;

    /// All stage instances of an approval instance, in opening order
    async fn find_for_instance(
        &self,
        instance_id: &ApprovalInstanceId,
    ) -> Result<Vec<StageInstance>, EngineError>;
}

/// Role membership lookup
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Every member of the role
    async fn members_of(&self, role: &RoleName) -> Result<BTreeSet<ApproverId>, EngineError>;
}

/// Value object: Timer ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub String);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a timer fires for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaTimerRequest {
    /// Approval instance
    pub instance_id: ApprovalInstanceId,

    /// Stage instance whose deadline is tracked
    pub stage_instance_id: StageInstanceId,
}

/// Event delivered when an SLA timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaExpired {
    /// The timer that fired
    pub timer_id: TimerId,

    /// Approval instance
    pub instance_id: ApprovalInstanceId,

    /// Stage instance whose deadline passed
    pub stage_instance_id: StageInstanceId,
}

/// Schedules one deadline per open stage instance
#[async_trait]
pub trait SlaTimerService: Send + Sync {
    /// Schedule a timer firing after `delay`
    async fn schedule(&self, request: SlaTimerRequest, delay: Duration) -> Result<TimerId, EngineError>;

    /// Cancel a timer; returns whether it was still scheduled
    async fn cancel(&self, timer_id: &TimerId) -> Result<bool, EngineError>;
}
