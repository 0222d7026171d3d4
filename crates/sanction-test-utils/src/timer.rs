//! SLA timer service driven by a manual clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sanction_core::{
    Clock, EngineError, SlaExpired, SlaTimerRequest, SlaTimerService, StageInstanceId, TimerId,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A scheduled timer
#[derive(Debug, Clone)]
pub struct ScheduledTimer {
    pub id: TimerId,
    pub request: SlaTimerRequest,
    pub due_at: DateTime<Utc>,
}

/// Timer service whose timers fire only when the test collects them
pub struct ManualSlaTimerService {
    clock: Arc<dyn Clock>,
    timers: Mutex<HashMap<TimerId, ScheduledTimer>>,
    cancelled: Mutex<Vec<TimerId>>,
    schedule_budget: Mutex<Option<usize>>,
}

impl fmt::Debug for ManualSlaTimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualSlaTimerService")
            .field("timer_count", &self.timers.lock().len())
            .finish()
    }
}

impl ManualSlaTimerService {
    /// Create a timer service reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            schedule_budget: Mutex::new(None),
        }
    }

    /// Let `remaining` more schedules succeed, then fail every later one
    ///
    /// `None` lifts the limit.
    pub fn fail_schedules_after(&self, remaining: Option<usize>) {
        *self.schedule_budget.lock() = remaining;
    }

    /// Remove and return every timer due at the clock's current time, earliest first
    pub fn take_due(&self) -> Vec<SlaExpired> {
        let now = self.clock.now();
        let mut timers = self.timers.lock();

        let mut due: Vec<ScheduledTimer> = timers
            .values()
            .filter(|t| t.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_at);

        for timer in &due {
            timers.remove(&timer.id);
        }

        due.into_iter().map(Self::expiry).collect()
    }

    /// Fire a timer immediately, whatever its due time
    pub fn fire(&self, timer_id: &TimerId) -> Option<SlaExpired> {
        self.timers.lock().remove(timer_id).map(Self::expiry)
    }

    /// The live timer tracking a stage instance
    pub fn timer_for_stage(&self, stage_instance_id: &StageInstanceId) -> Option<ScheduledTimer> {
        self.timers
            .lock()
            .values()
            .find(|t| &t.request.stage_instance_id == stage_instance_id)
            .cloned()
    }

    /// Whether a timer is still scheduled
    pub fn is_scheduled(&self, timer_id: &TimerId) -> bool {
        self.timers.lock().contains_key(timer_id)
    }

    /// Number of live timers
    pub fn scheduled_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Timers cancelled so far, in order
    pub fn cancelled(&self) -> Vec<TimerId> {
        self.cancelled.lock().clone()
    }

    fn expiry(timer: ScheduledTimer) -> SlaExpired {
        SlaExpired {
            timer_id: timer.id,
            instance_id: timer.request.instance_id,
            stage_instance_id: timer.request.stage_instance_id,
        }
    }
}

#[async_trait]
impl SlaTimerService for ManualSlaTimerService {
    async fn schedule(&self, request: SlaTimerRequest, delay: Duration) -> Result<TimerId, EngineError> {
        if let Some(remaining) = self.schedule_budget.lock().as_mut() {
            if *remaining == 0 {
                return Err(EngineError::TimerServiceError(
                    "timer backend unavailable".to_string(),
                ));
            }
            *remaining -= 1;
        }

        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| EngineError::TimerServiceError(e.to_string()))?;
        let timer = ScheduledTimer {
            id: TimerId(Uuid::new_v4().to_string()),
            request,
            due_at: self.clock.now() + delay,
        };

        let id = timer.id.clone();
        self.timers.lock().insert(id.clone(), timer);
        Ok(id)
    }

    async fn cancel(&self, timer_id: &TimerId) -> Result<bool, EngineError> {
        let removed = self.timers.lock().remove(timer_id).is_some();
        if removed {
            self.cancelled.lock().push(timer_id.clone());
        }
        Ok(removed)
    }
}
