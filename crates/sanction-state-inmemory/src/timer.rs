//! SLA timers backed by tokio tasks
//!
//! Each scheduled timer is a task sleeping for the requested delay and then
//! sending an [`SlaExpired`] event on the expiry channel. Cancelling aborts
//! the task, so a cancelled timer never fires.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::Sender, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use sanction_core::{
    domain::repository::{SlaExpired, SlaTimerRequest, SlaTimerService},
    EngineError, TimerId,
};

/// SLA timer service spawning one tokio task per timer
pub struct TokioSlaTimerService {
    timer_tx: Sender<SlaExpired>,
    handles: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioSlaTimerService {
    /// Create a timer service sending expiries on `timer_tx`
    pub fn new(timer_tx: Sender<SlaExpired>) -> Self {
        Self {
            timer_tx,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers scheduled and not yet fired or cancelled
    pub async fn pending_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[async_trait]
impl SlaTimerService for TokioSlaTimerService {
    async fn schedule(&self, request: SlaTimerRequest, delay: Duration) -> Result<TimerId, EngineError> {
        let timer_id = TimerId(Uuid::new_v4().to_string());

        // Held until the handle is stored so the task cannot remove its entry first
        let mut handles = self.handles.lock().await;

        let timer_tx = self.timer_tx.clone();
        let task_handles = self.handles.clone();
        let task_timer_id = timer_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            task_handles.lock().await.remove(&task_timer_id);

            let event = SlaExpired {
                timer_id: task_timer_id,
                instance_id: request.instance_id,
                stage_instance_id: request.stage_instance_id,
            };

            if let Err(e) = timer_tx.send(event).await {
                warn!("Failed to send SLA expiry event: {}", e);
            }
        });

        handles.insert(timer_id.clone(), handle);
        debug!(timer_id = %timer_id, delay_ms = delay.as_millis() as u64, "SLA timer scheduled");

        Ok(timer_id)
    }

    async fn cancel(&self, timer_id: &TimerId) -> Result<bool, EngineError> {
        let handle = self.handles.lock().await.remove(timer_id);

        match handle {
            Some(handle) => {
                handle.abort();
                debug!(timer_id = %timer_id, "SLA timer cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
