//! Builders for templates and stages

use sanction_core::{DecisionPolicy, RoleName, Stage, TemplateCode, WorkflowTemplate};

/// Builder for a single stage
#[derive(Debug, Clone)]
pub struct StageBuilder {
    stage: Stage,
}

impl StageBuilder {
    fn new(order_index: u32, name: &str, role: &str, policy: DecisionPolicy) -> Self {
        Self {
            stage: Stage {
                order_index,
                name: name.to_string(),
                policy,
                required_role: RoleName::from(role),
                allow_reject: false,
                allow_delegate: false,
                sla_hours: 24,
                parallel_group: None,
            },
        }
    }

    /// ANY stage
    pub fn any(order_index: u32, name: &str, role: &str) -> Self {
        Self::new(order_index, name, role, DecisionPolicy::Any)
    }

    /// ALL stage
    pub fn all(order_index: u32, name: &str, role: &str) -> Self {
        Self::new(order_index, name, role, DecisionPolicy::All)
    }

    /// QUORUM stage; panics on a zero count
    pub fn quorum(order_index: u32, name: &str, role: &str, count: u32) -> Self {
        let policy = DecisionPolicy::quorum(count).expect("quorum count must be positive");
        Self::new(order_index, name, role, policy)
    }

    /// Let REJECT votes resolve the stage
    pub fn allow_reject(mut self) -> Self {
        self.stage.allow_reject = true;
        self
    }

    /// Let approvers delegate
    pub fn allow_delegate(mut self) -> Self {
        self.stage.allow_delegate = true;
        self
    }

    /// Set the SLA
    pub fn sla_hours(mut self, hours: u32) -> Self {
        self.stage.sla_hours = hours;
        self
    }

    /// Put the stage in a parallel group
    pub fn parallel_group(mut self, group: u32) -> Self {
        self.stage.parallel_group = Some(group);
        self
    }

    /// Finish the stage
    pub fn build(self) -> Stage {
        self.stage
    }
}

/// Builder for a workflow template
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    template: WorkflowTemplate,
}

impl TemplateBuilder {
    /// Start an active version 1 template for a content type
    pub fn new(code: &str, content_type: &str) -> Self {
        Self {
            template: WorkflowTemplate {
                code: TemplateCode::from(code),
                name: format!("{} approval", code),
                content_type: content_type.to_string(),
                version: 1,
                is_active: true,
                stages: Vec::new(),
            },
        }
    }

    /// Set the version
    pub fn version(mut self, version: u32) -> Self {
        self.template.version = version;
        self
    }

    /// Set whether the template is active
    pub fn active(mut self, is_active: bool) -> Self {
        self.template.is_active = is_active;
        self
    }

    /// Append a stage
    pub fn stage(mut self, stage: StageBuilder) -> Self {
        self.template.stages.push(stage.build());
        self
    }

    /// Finish the template
    pub fn build(self) -> WorkflowTemplate {
        self.template
    }
}

/// Two sequential stages: ANY among `managers`, then QUORUM(2) among `directors`
pub fn two_stage_purchase_order(allow_reject_on_quorum: bool) -> WorkflowTemplate {
    let mut quorum = StageBuilder::quorum(2, "directors", "directors", 2);
    if allow_reject_on_quorum {
        quorum = quorum.allow_reject();
    }

    TemplateBuilder::new("PO", "purchase_order")
        .stage(StageBuilder::any(1, "manager", "managers").allow_reject())
        .stage(quorum)
        .build()
}
