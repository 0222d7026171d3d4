use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use sanction_core::{
    domain::repository::{ApprovalInstanceRepository, StageInstanceRepository, TemplateRepository},
    ApprovalInstance, ApprovalInstanceId, EngineError, InstanceStatus, StageInstance,
    StageInstanceId, SubjectRef, TemplateCode, TemplateVersionRef, WorkflowTemplate,
};

/// In-memory implementation of the TemplateRepository
pub struct InMemoryTemplateRepository {
    templates: Arc<RwLock<HashMap<(String, u32), WorkflowTemplate>>>,
}

impl InMemoryTemplateRepository {
    /// Create a new in-memory template repository
    pub fn new(templates: Arc<RwLock<HashMap<(String, u32), WorkflowTemplate>>>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn find(&self, version: &TemplateVersionRef) -> Result<Option<WorkflowTemplate>, EngineError> {
        let templates = self.templates.read().await;
        Ok(templates.get(&(version.code.0.clone(), version.version)).cloned())
    }

    async fn latest_version(&self, code: &TemplateCode) -> Result<Option<u32>, EngineError> {
        let templates = self.templates.read().await;
        Ok(templates
            .keys()
            .filter(|(c, _)| c == &code.0)
            .map(|(_, version)| *version)
            .max())
    }

    async fn save(&self, template: &WorkflowTemplate) -> Result<(), EngineError> {
        let mut templates = self.templates.write().await;
        templates.insert((template.code.0.clone(), template.version), template.clone());
        debug!(template = %template.version_ref(), "Template saved");
        Ok(())
    }

    async fn list_versions(&self, code: &TemplateCode) -> Result<Vec<WorkflowTemplate>, EngineError> {
        let templates = self.templates.read().await;
        let mut versions: Vec<WorkflowTemplate> = templates
            .values()
            .filter(|t| &t.code == code)
            .cloned()
            .collect();
        versions.sort_by_key(|t| t.version);
        Ok(versions)
    }
}

/// In-memory implementation of the ApprovalInstanceRepository
pub struct InMemoryApprovalInstanceRepository {
    instances: Arc<RwLock<HashMap<String, ApprovalInstance>>>,
}

impl InMemoryApprovalInstanceRepository {
    /// Create a new in-memory approval instance repository
    pub fn new(instances: Arc<RwLock<HashMap<String, ApprovalInstance>>>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl ApprovalInstanceRepository for InMemoryApprovalInstanceRepository {
    async fn find_by_id(&self, id: &ApprovalInstanceId) -> Result<Option<ApprovalInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn save(&self, instance: &ApprovalInstance) -> Result<(), EngineError> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.0.clone(), instance.clone());
        Ok(())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        subject: Option<&SubjectRef>,
    ) -> Result<Vec<ApprovalInstance>, EngineError> {
        let instances = self.instances.read().await;

        let mut result: Vec<ApprovalInstance> = instances
            .values()
            .filter(|instance| {
                let status_match = status.map_or(true, |s| instance.status == s);
                let subject_match = subject.map_or(true, |s| &instance.subject == s);
                status_match && subject_match
            })
            .cloned()
            .collect();

        result.sort_by_key(|instance| instance.created_at);
        Ok(result)
    }

    async fn is_template_referenced(&self, version: &TemplateVersionRef) -> Result<bool, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances.values().any(|instance| &instance.template == version))
    }
}

/// In-memory implementation of the StageInstanceRepository
pub struct InMemoryStageInstanceRepository {
    stage_instances: Arc<RwLock<HashMap<String, StageInstance>>>,
}

impl InMemoryStageInstanceRepository {
    /// Create a new in-memory stage instance repository
    pub fn new(stage_instances: Arc<RwLock<HashMap<String, StageInstance>>>) -> Self {
        Self { stage_instances }
    }
}

#[async_trait]
impl StageInstanceRepository for InMemoryStageInstanceRepository {
    async fn find_by_id(&self, id: &StageInstanceId) -> Result<Option<StageInstance>, EngineError> {
        let stage_instances = self.stage_instances.read().await;
        Ok(stage_instances.get(&id.0).cloned())
    }

    async fn save(&self, stage_instance: &StageInstance) -> Result<(), EngineError> {
        let mut stage_instances = self.stage_instances.write().await;
        stage_instances.insert(stage_instance.id.0.clone(), stage_instance.clone());
        Ok(())
    }

    async fn find_for_instance(
        &self,
        instance_id: &ApprovalInstanceId,
    ) -> Result<Vec<StageInstance>, EngineError> {
        let stage_instances = self.stage_instances.read().await;

        let mut result: Vec<StageInstance> = stage_instances
            .values()
            .filter(|si| &si.instance_id == instance_id)
            .cloned()
            .collect();

        result.sort_by_key(|si| (si.opened_at, si.order_index, si.stage_index));
        Ok(result)
    }
}
