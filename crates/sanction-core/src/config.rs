//! Configuration for the approval engine
//!
//! Values come from defaults, optionally overridden by environment variables
//! or a JSON document supplied by the embedding host.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

use crate::error::EngineError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the channel carrying SLA expiry events
    #[serde(default = "default_timer_channel_capacity")]
    pub timer_channel_capacity: usize,

    /// SLA applied to authoring records that carry none
    #[serde(default = "default_sla_hours")]
    pub default_sla_hours: u32,

    /// Maximum number of delegations accepted per stage instance
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,

    /// Reschedule a timer that fires before its deadline instead of dropping it
    #[serde(default = "default_reschedule_early_timers")]
    pub reschedule_early_timers: bool,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_timer_channel_capacity() -> usize {
    256
}

fn default_sla_hours() -> u32 {
    72
}

fn default_max_delegation_depth() -> usize {
    8
}

fn default_reschedule_early_timers() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer_channel_capacity: default_timer_channel_capacity(),
            default_sla_hours: default_sla_hours(),
            max_delegation_depth: default_max_delegation_depth(),
            reschedule_early_timers: default_reschedule_early_timers(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, EngineError> {
        let mut config = Self::default();

        if let Ok(capacity) = env::var("SANCTION_TIMER_CHANNEL_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(capacity) => config.timer_channel_capacity = capacity,
                Err(_) => warn!("Invalid SANCTION_TIMER_CHANNEL_CAPACITY value: {}", capacity),
            }
        }

        if let Ok(hours) = env::var("SANCTION_DEFAULT_SLA_HOURS") {
            match hours.parse::<u32>() {
                Ok(hours) => config.default_sla_hours = hours,
                Err(_) => warn!("Invalid SANCTION_DEFAULT_SLA_HOURS value: {}", hours),
            }
        }

        if let Ok(depth) = env::var("SANCTION_MAX_DELEGATION_DEPTH") {
            match depth.parse::<usize>() {
                Ok(depth) => config.max_delegation_depth = depth,
                Err(_) => warn!("Invalid SANCTION_MAX_DELEGATION_DEPTH value: {}", depth),
            }
        }

        if let Ok(flag) = env::var("SANCTION_RESCHEDULE_EARLY_TIMERS") {
            config.reschedule_early_timers = flag.to_lowercase() == "true" || flag == "1";
        }

        if let Ok(log_level) = env::var("SANCTION_LOG_LEVEL") {
            config.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON document, filling omitted fields with defaults
    pub fn from_json(document: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.timer_channel_capacity == 0 {
            return Err(EngineError::ConfigurationError(
                "timer_channel_capacity must be positive".to_string(),
            ));
        }

        if self.default_sla_hours == 0 {
            return Err(EngineError::ConfigurationError(
                "default_sla_hours must be positive".to_string(),
            ));
        }

        if self.max_delegation_depth == 0 {
            return Err(EngineError::ConfigurationError(
                "max_delegation_depth must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
