//! A fully wired engine over in-memory stores and manual time

use chrono::Duration;
use sanction_core::{
    domain::repository::{ApprovalInstanceRepository, StageInstanceRepository, TemplateRepository},
    application::approval_engine::EngineDependencies,
    ApprovalEngine, ApprovalInstanceId, EngineConfig, EngineError, ExpiryOutcome,
    InstanceStatusReport, StageInstanceId, SubjectRef, TemplateService, TemplateVersionRef,
    WorkflowTemplate,
};
use sanction_state_inmemory::InMemoryStateStoreProvider;
use std::sync::Arc;

use crate::{ManualClock, ManualSlaTimerService, RecordingEventHandler, StaticRoleDirectory};

/// Engine plus handles on every fake it was wired with
pub struct TestEngine {
    pub engine: ApprovalEngine,
    pub template_service: TemplateService,
    pub clock: Arc<ManualClock>,
    pub timers: Arc<ManualSlaTimerService>,
    pub roles: Arc<StaticRoleDirectory>,
    pub events: Arc<RecordingEventHandler>,
    pub templates: Arc<dyn TemplateRepository>,
    pub instances: Arc<dyn ApprovalInstanceRepository>,
    pub stage_instances: Arc<dyn StageInstanceRepository>,
}

impl TestEngine {
    /// Wire an engine with the default configuration
    pub fn new(roles: StaticRoleDirectory) -> Self {
        Self::build(roles, EngineConfig::default(), RecordingEventHandler::new())
    }

    /// Wire an engine with a custom configuration
    pub fn with_config(roles: StaticRoleDirectory, config: EngineConfig) -> Self {
        Self::build(roles, config, RecordingEventHandler::new())
    }

    /// Wire an engine with a specific event handler
    pub fn build(
        roles: StaticRoleDirectory,
        config: EngineConfig,
        events: RecordingEventHandler,
    ) -> Self {
        crate::init_test_tracing_with(&config);

        let provider = InMemoryStateStoreProvider::with_config(&config);
        let (templates, instances, stage_instances, _) = provider.create_repositories();

        let clock = Arc::new(ManualClock::default());
        let timers = Arc::new(ManualSlaTimerService::new(clock.clone()));
        let roles = Arc::new(roles);
        let events = Arc::new(events);

        let engine = ApprovalEngine::new(
            EngineDependencies {
                templates: templates.clone(),
                instances: instances.clone(),
                stage_instances: stage_instances.clone(),
                roles: roles.clone(),
                timers: timers.clone(),
                clock: clock.clone(),
                event_handler: events.clone(),
            },
            config.clone(),
        );

        let template_service =
            TemplateService::new(templates.clone(), instances.clone(), roles.clone(), config);

        Self {
            engine,
            template_service,
            clock,
            timers,
            roles,
            events,
            templates,
            instances,
            stage_instances,
        }
    }

    /// Store a template as-is
    pub async fn install(&self, template: &WorkflowTemplate) -> TemplateVersionRef {
        self.templates
            .save(template)
            .await
            .expect("template store rejected the template");
        template.version_ref()
    }

    /// Install a template and start an instance for a subject of its content type
    pub async fn start(
        &self,
        template: &WorkflowTemplate,
        object_id: &str,
    ) -> Result<ApprovalInstanceId, EngineError> {
        let version = self.install(template).await;
        self.engine
            .start_instance(&version, SubjectRef::new(template.content_type.clone(), object_id))
            .await
    }

    /// Status report, panicking on lookup failures
    pub async fn status(&self, instance_id: &ApprovalInstanceId) -> InstanceStatusReport {
        self.engine
            .get_instance_status(instance_id)
            .await
            .expect("status lookup failed")
    }

    /// Stage instance id of the opened stage with this name
    pub async fn stage_id(&self, instance_id: &ApprovalInstanceId, name: &str) -> StageInstanceId {
        self.status(instance_id)
            .await
            .stages
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.stage_instance_id)
            .unwrap_or_else(|| panic!("stage '{}' is not open", name))
    }

    /// Advance the clock and apply every timer that became due
    pub async fn advance_hours(&self, hours: i64) -> Vec<ExpiryOutcome> {
        self.clock.advance(Duration::hours(hours));

        let mut outcomes = Vec::new();
        for expiry in self.timers.take_due() {
            outcomes.push(
                self.engine
                    .handle_sla_expiry(&expiry)
                    .await
                    .expect("expiry handling failed"),
            );
        }
        outcomes
    }
}
