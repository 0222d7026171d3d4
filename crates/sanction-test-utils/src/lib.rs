//! Testing utilities for the Sanction approval engine.
//!
//! This crate provides fakes (manual clock, manual SLA timers, static role
//! directory, recording event handler), template builders, a wired test
//! engine and assertion helpers for the integration tests.

pub mod assertions;
pub mod builders;
pub mod clock;
pub mod directory;
pub mod events;
pub mod harness;
pub mod timer;

pub use builders::{StageBuilder, TemplateBuilder};
pub use clock::ManualClock;
pub use directory::StaticRoleDirectory;
pub use events::{RecordedEvent, RecordingEventHandler};
pub use harness::TestEngine;
pub use timer::ManualSlaTimerService;

use sanction_core::EngineConfig;
use tracing_subscriber::EnvFilter;

/// Install a tracing subscriber writing to the test output
///
/// Honours `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    init_test_tracing_with(&EngineConfig::default());
}

/// Install a tracing subscriber, falling back to the configured log level
/// when `RUST_LOG` is unset
pub fn init_test_tracing_with(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback_filter(config));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Filter built from `EngineConfig::log_level`, or `info` if it does not parse
pub fn fallback_filter(config: &EngineConfig) -> EnvFilter {
    EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_filter_uses_configured_level() {
        let config = EngineConfig {
            log_level: "sanction_core=debug".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(fallback_filter(&config).to_string(), "sanction_core=debug");
    }

    #[test]
    fn test_fallback_filter_ignores_unparseable_level() {
        let config = EngineConfig {
            log_level: "sanction_core=loud".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(fallback_filter(&config).to_string(), "info");
    }
}
