//! In-memory state store implementation for the Sanction approval engine
//!
//! This crate provides in-memory implementations of the store traits defined
//! in sanction-core, plus an SLA timer service backed by tokio tasks. It is
//! useful for development, testing, and embedded deployments where
//! persistence is not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub mod repositories;
pub use repositories::{
    InMemoryApprovalInstanceRepository, InMemoryStageInstanceRepository,
    InMemoryTemplateRepository,
};

pub mod timer;
pub use timer::TokioSlaTimerService;

use sanction_core::{
    domain::repository::{
        ApprovalInstanceRepository, SlaExpired, SlaTimerService, StageInstanceRepository,
        TemplateRepository,
    },
    ApprovalInstance, EngineConfig, StageInstance, WorkflowTemplate,
};


/// Provider for in-memory state store repositories
pub struct InMemoryStateStoreProvider {
    // Shared storage for templates, keyed by (code, version)
    templates: Arc<RwLock<HashMap<(String, u32), WorkflowTemplate>>>,

    // Shared storage for approval instances
    instances: Arc<RwLock<HashMap<String, ApprovalInstance>>>,

    // Shared storage for stage instances
    stage_instances: Arc<RwLock<HashMap<String, StageInstance>>>,

    // Channel for SLA expiry events
    timer_tx: mpsc::Sender<SlaExpired>,
    timer_rx: Option<mpsc::Receiver<SlaExpired>>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider with the default configuration
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    /// Create a provider sized from the engine configuration
    pub fn with_config(config: &EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.timer_channel_capacity.max(1));

        Self {
            templates: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            stage_instances: Arc::new(RwLock::new(HashMap::new())),
            timer_tx: tx,
            timer_rx: Some(rx),
        }
    }

    /// Create repositories sharing this provider's storage
    pub fn create_repositories(
        &self,
    ) -> (
        Arc<dyn TemplateRepository>,
        Arc<dyn ApprovalInstanceRepository>,
        Arc<dyn StageInstanceRepository>,
        Arc<dyn SlaTimerService>,
    ) {
        let template_repo = Arc::new(InMemoryTemplateRepository::new(self.templates.clone()));

        let instance_repo = Arc::new(InMemoryApprovalInstanceRepository::new(
            self.instances.clone(),
        ));

        let stage_instance_repo = Arc::new(InMemoryStageInstanceRepository::new(
            self.stage_instances.clone(),
        ));

        let timer_service = Arc::new(TokioSlaTimerService::new(self.timer_tx.clone()));

        (template_repo, instance_repo, stage_instance_repo, timer_service)
    }

    /// Take the receiving end of the SLA expiry channel
    ///
    /// Returns `None` once taken; hand it to
    /// `ApprovalEngine::spawn_expiry_listener`.
    pub fn take_timer_receiver(&mut self) -> Option<mpsc::Receiver<SlaExpired>> {
        self.timer_rx.take()
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}
