//! Event handler that records what the engine emits

use async_trait::async_trait;
use parking_lot::Mutex;
use sanction_core::{ApprovalInstanceId, DomainEvent, DomainEventHandler, EngineError, StageInstanceId};
use std::sync::atomic::{AtomicBool, Ordering};

/// What was seen of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event_type: &'static str,
    pub instance_id: ApprovalInstanceId,
    pub stage_instance_id: Option<StageInstanceId>,
}

/// Records every event; optionally fails each delivery after recording it
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<RecordedEvent>>,
    fail: AtomicBool,
}

impl RecordingEventHandler {
    /// Create a handler that accepts every event
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler that records then reports a failure
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: AtomicBool::new(true),
        }
    }

    /// All recorded events
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Event types recorded for one instance, in order
    pub fn types_for(&self, instance_id: &ApprovalInstanceId) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.instance_id == instance_id)
            .map(|e| e.event_type)
            .collect()
    }

    /// How many events of a type were recorded for an instance
    pub fn count(&self, instance_id: &ApprovalInstanceId, event_type: &str) -> usize {
        self.types_for(instance_id)
            .into_iter()
            .filter(|t| *t == event_type)
            .count()
    }
}

#[async_trait]
impl DomainEventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), EngineError> {
        self.events.lock().push(RecordedEvent {
            event_type: event.event_type(),
            instance_id: event.instance_id().clone(),
            stage_instance_id: event.stage_instance_id().cloned(),
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Other("notification channel unavailable".to_string()));
        }
        Ok(())
    }
}
