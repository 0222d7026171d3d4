//!
//! Sanction Core - Approval decision engine
//!
//! This crate defines the domain model, the decision policy evaluator, the
//! delegation resolver and the application services that drive an approval
//! instance through the stages of a workflow template. Persistence, role
//! lookup, timers and notifications are collaborator traits implemented by
//! other crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - templates, aggregates, policies and collaborator traits
pub mod domain;

/// Application services - the engine and template lifecycle
pub mod application;

/// Shared value objects
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

pub use config::EngineConfig;
pub use error::EngineError;
pub use types::{ApproverId, RoleName, SubjectRef, TemplateCode};

// Re-export main API types for easy use
pub use application::approval_engine::{
    ApprovalEngine, DecisionAck, DecisionHistory, DomainEventHandler, EngineDependencies,
    ExpiryOutcome, InstanceStatusReport, StageHistory, StageSummary,
};
pub use application::template_service::TemplateService;
pub use domain::approval_instance::{
    ApprovalInstance, ApprovalInstanceId, InstanceStatus, SchedulerState, TerminationReason,
};
pub use domain::clock::{Clock, SystemClock};
pub use domain::decision::{Decision, Verdict};
pub use domain::events::DomainEvent;
pub use domain::policy::{PolicyOutcome, Tally};
pub use domain::repository::{
    ApprovalInstanceRepository, RoleDirectory, SlaExpired, SlaTimerRequest, SlaTimerService,
    StageInstanceRepository, TemplateRepository, TimerId,
};
pub use domain::stage_instance::{StageInstance, StageInstanceId, StageStatus};
pub use domain::template::{
    DecisionPolicy, PolicyKind, Stage, StageGroup, StageRecord, TemplateVersionRef,
    WorkflowTemplate,
};
