use crate::{
    config::EngineConfig,
    domain::repository::{ApprovalInstanceRepository, RoleDirectory, TemplateRepository},
    domain::template::{Stage, StageRecord, TemplateVersionRef, WorkflowTemplate},
    types::TemplateCode,
    EngineError,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Service for the template lifecycle: authoring, versioning and activation
pub struct TemplateService {
    /// Repository for templates
    templates: Arc<dyn TemplateRepository>,

    /// Repository for approval instances
    instances: Arc<dyn ApprovalInstanceRepository>,

    /// Role membership lookup
    roles: Arc<dyn RoleDirectory>,

    /// Engine configuration
    config: EngineConfig,
}

impl TemplateService {
    /// Create a new template service
    pub fn new(
        templates: Arc<dyn TemplateRepository>,
        instances: Arc<dyn ApprovalInstanceRepository>,
        roles: Arc<dyn RoleDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            templates,
            instances,
            roles,
            config,
        }
    }

    /// Build an unpublished draft from authoring records
    pub fn build_from_records(
        &self,
        code: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        records: Vec<StageRecord>,
    ) -> Result<WorkflowTemplate, EngineError> {
        let stages = records
            .into_iter()
            .map(|record| record.into_stage(self.config.default_sla_hours))
            .collect::<Result<Vec<Stage>, EngineError>>()?;

        let mut template = WorkflowTemplate {
            code: TemplateCode(code.into()),
            name: name.into(),
            content_type: content_type.into(),
            version: 0,
            is_active: false,
            stages,
        };
        template.renumber();
        template.validate()?;

        Ok(template)
    }

    /// Store a draft as the next version of its code, inactive
    pub async fn publish_new_version(
        &self,
        mut draft: WorkflowTemplate,
    ) -> Result<WorkflowTemplate, EngineError> {
        draft.validate()?;

        let latest = self.templates.latest_version(&draft.code).await?;
        draft.version = latest.map_or(1, |v| v + 1);
        draft.is_active = false;

        self.templates.save(&draft).await?;

        info!(
            template = %draft.version_ref(),
            stages = draft.stages.len(),
            "Template version published"
        );

        Ok(draft)
    }

    /// Replace the stages of a version no instance references yet
    pub async fn update_stages(
        &self,
        version: &TemplateVersionRef,
        stages: Vec<Stage>,
    ) -> Result<WorkflowTemplate, EngineError> {
        let mut template = self.load(version).await?;

        if self.instances.is_template_referenced(version).await? {
            return Err(EngineError::InvalidTemplate(format!(
                "Template {} is referenced by approval instances; publish a new version instead",
                version
            )));
        }

        template.stages = stages;
        template.renumber();
        template.validate()?;
        self.templates.save(&template).await?;

        debug!(template = %version, "Template stages replaced");
        Ok(template)
    }

    /// Validate a version against current role membership and make it the active one
    ///
    /// Any other active version of the same code is deactivated.
    pub async fn activate(&self, version: &TemplateVersionRef) -> Result<WorkflowTemplate, EngineError> {
        let mut template = self.load(version).await?;
        template.validate()?;

        for stage in &template.stages {
            let members = self.roles.members_of(&stage.required_role).await?;

            if members.is_empty() {
                return Err(EngineError::InvalidTemplate(format!(
                    "Stage '{}' requires role '{}' which has no members",
                    stage.name, stage.required_role
                )));
            }

            if let Some(count) = stage.policy.quorum_count() {
                if count as usize > members.len() {
                    return Err(EngineError::InvalidTemplate(format!(
                        "Stage '{}' needs a quorum of {} but role '{}' has {} members",
                        stage.name,
                        count,
                        stage.required_role,
                        members.len()
                    )));
                }
            }
        }

        for mut previous in self.templates.list_versions(&template.code).await? {
            if previous.is_active && previous.version != template.version {
                previous.is_active = false;
                self.templates.save(&previous).await?;
                debug!(template = %previous.version_ref(), "Previous version deactivated");
            }
        }

        template.is_active = true;
        self.templates.save(&template).await?;

        info!(template = %version, "Template activated");
        Ok(template)
    }

    /// Stop new instances from starting on a version
    pub async fn deactivate(&self, version: &TemplateVersionRef) -> Result<WorkflowTemplate, EngineError> {
        let mut template = self.load(version).await?;
        template.is_active = false;
        self.templates.save(&template).await?;

        info!(template = %version, "Template deactivated");
        Ok(template)
    }

    async fn load(&self, version: &TemplateVersionRef) -> Result<WorkflowTemplate, EngineError> {
        self.templates
            .find(version)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(version.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::approval_instance::{ApprovalInstance, ApprovalInstanceId, InstanceStatus};
    use crate::domain::template::{DecisionPolicy, PolicyKind};
    use crate::types::{ApproverId, RoleName, SubjectRef};
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;
    use std::collections::BTreeSet;

    mock! {
        pub Templates {}

        #[async_trait]
        impl TemplateRepository for Templates {
            async fn find(&self, version: &TemplateVersionRef) -> Result<Option<WorkflowTemplate>, EngineError>;
            async fn latest_version(&self, code: &TemplateCode) -> Result<Option<u32>, EngineError>;
            async fn save(&self, template: &WorkflowTemplate) -> Result<(), EngineError>;
            async fn list_versions(&self, code: &TemplateCode) -> Result<Vec<WorkflowTemplate>, EngineError>;
        }
    }

    /// Instance store that only answers the reference check
    struct StubInstances {
        referenced: bool,
    }

    #[async_trait]
    impl ApprovalInstanceRepository for StubInstances {
        async fn find_by_id(&self, _id: &ApprovalInstanceId) -> Result<Option<ApprovalInstance>, EngineError> {
            Ok(None)
        }

        async fn save(&self, _instance: &ApprovalInstance) -> Result<(), EngineError> {
            Ok(())
        }

        async fn list_instances(
            &self,
            _status: Option<InstanceStatus>,
            _subject: Option<&SubjectRef>,
        ) -> Result<Vec<ApprovalInstance>, EngineError> {
            Ok(Vec::new())
        }

        async fn is_template_referenced(&self, _version: &TemplateVersionRef) -> Result<bool, EngineError> {
            Ok(self.referenced)
        }
    }

    mock! {
        pub Roles {}

        #[async_trait]
        impl RoleDirectory for Roles {
            async fn members_of(&self, role: &RoleName) -> Result<BTreeSet<ApproverId>, EngineError>;
        }
    }

    fn record(order_index: u32, name: &str, kind: PolicyKind, quorum: Option<u32>) -> StageRecord {
        StageRecord {
            order_index,
            name: name.to_string(),
            decision_policy: kind,
            quorum_count: quorum,
            required_role: "board".to_string(),
            allow_reject: true,
            allow_delegate: false,
            sla_hours: None,
            parallel_group: None,
        }
    }

    fn members(n: usize) -> BTreeSet<ApproverId> {
        (0..n).map(|i| ApproverId(format!("u{}", i))).collect()
    }

    fn draft() -> WorkflowTemplate {
        WorkflowTemplate {
            code: TemplateCode::from("PO"),
            name: "Purchase order".to_string(),
            content_type: "purchase_order".to_string(),
            version: 2,
            is_active: false,
            stages: vec![Stage {
                order_index: 1,
                name: "board".to_string(),
                policy: DecisionPolicy::quorum(3).unwrap(),
                required_role: RoleName::from("board"),
                allow_reject: true,
                allow_delegate: false,
                sla_hours: 24,
                parallel_group: None,
            }],
        }
    }

    fn service(templates: MockTemplates, instances: StubInstances, roles: MockRoles) -> TemplateService {
        TemplateService::new(
            Arc::new(templates),
            Arc::new(instances),
            Arc::new(roles),
            EngineConfig::default(),
        )
    }

    #[test]
    fn test_build_from_records_renumbers_and_defaults_sla() {
        let svc = service(MockTemplates::new(), StubInstances { referenced: false }, MockRoles::new());
        let template = svc
            .build_from_records(
                "PO",
                "Purchase order",
                "purchase_order",
                vec![
                    record(4, "finance", PolicyKind::All, None),
                    record(2, "manager", PolicyKind::Any, None),
                ],
            )
            .unwrap();

        assert_eq!(template.stages[0].name, "manager");
        assert_eq!(template.stages[0].order_index, 1);
        assert_eq!(template.stages[1].order_index, 2);
        assert_eq!(template.stages[1].sla_hours, 72);
        assert!(!template.is_active);
    }

    #[test]
    fn test_build_from_records_rejects_bad_quorum_pairing() {
        let svc = service(MockTemplates::new(), StubInstances { referenced: false }, MockRoles::new());
        let result = svc.build_from_records(
            "PO",
            "Purchase order",
            "purchase_order",
            vec![record(1, "board", PolicyKind::Any, Some(2))],
        );
        assert!(matches!(result, Err(EngineError::InvalidTemplate(_))));
    }

    #[tokio::test]
    async fn test_publish_assigns_next_version() {
        let mut templates = MockTemplates::new();
        templates
            .expect_latest_version()
            .returning(|_| Ok(Some(4)));
        templates
            .expect_save()
            .withf(|t| t.version == 5 && !t.is_active)
            .times(1)
            .returning(|_| Ok(()));

        let svc = service(templates, StubInstances { referenced: false }, MockRoles::new());
        let published = svc.publish_new_version(draft()).await.unwrap();
        assert_eq!(published.version, 5);
    }

    #[tokio::test]
    async fn test_activate_rejects_quorum_larger_than_role() {
        let mut templates = MockTemplates::new();
        templates.expect_find().returning(|_| Ok(Some(draft())));
        templates.expect_save().never();

        let mut roles = MockRoles::new();
        roles
            .expect_members_of()
            .with(eq(RoleName::from("board")))
            .returning(|_| Ok(members(2)));

        let svc = service(templates, StubInstances { referenced: false }, roles);
        let err = svc
            .activate(&TemplateVersionRef::new("PO", 2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quorum of 3"));
    }

    #[tokio::test]
    async fn test_activate_rejects_empty_role() {
        let mut templates = MockTemplates::new();
        templates.expect_find().returning(|_| Ok(Some(draft())));

        let mut roles = MockRoles::new();
        roles.expect_members_of().returning(|_| Ok(BTreeSet::new()));

        let svc = service(templates, StubInstances { referenced: false }, roles);
        let err = svc
            .activate(&TemplateVersionRef::new("PO", 2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no members"));
    }

    #[tokio::test]
    async fn test_activate_deactivates_previous_version() {
        let mut templates = MockTemplates::new();
        templates.expect_find().returning(|_| Ok(Some(draft())));
        templates.expect_list_versions().returning(|_| {
            let mut first = draft();
            first.version = 1;
            first.is_active = true;
            let mut second = draft();
            second.version = 2;
            Ok(vec![first, second])
        });
        templates
            .expect_save()
            .withf(|t| t.version == 1 && !t.is_active)
            .times(1)
            .returning(|_| Ok(()));
        templates
            .expect_save()
            .withf(|t| t.version == 2 && t.is_active)
            .times(1)
            .returning(|_| Ok(()));

        let mut roles = MockRoles::new();
        roles.expect_members_of().returning(|_| Ok(members(3)));

        let svc = service(templates, StubInstances { referenced: false }, roles);
        let active = svc.activate(&TemplateVersionRef::new("PO", 2)).await.unwrap();
        assert!(active.is_active);
    }

    #[tokio::test]
    async fn test_referenced_version_cannot_be_edited() {
        let mut templates = MockTemplates::new();
        templates.expect_find().returning(|_| Ok(Some(draft())));
        templates.expect_save().never();

        let instances = StubInstances { referenced: true };

        let svc = service(templates, instances, MockRoles::new());
        let err = svc
            .update_stages(&TemplateVersionRef::new("PO", 2), draft().stages)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("publish a new version"));
    }

    #[tokio::test]
    async fn test_missing_template_is_reported() {
        let mut templates = MockTemplates::new();
        templates.expect_find().returning(|_| Ok(None));

        let svc = service(templates, StubInstances { referenced: false }, MockRoles::new());
        let err = svc
            .deactivate(&TemplateVersionRef::new("PO", 9))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::TemplateNotFound("PO@9".to_string()));
    }
}
