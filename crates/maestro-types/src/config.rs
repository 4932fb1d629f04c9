//! Engine configuration types for Maestro.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! parallelism, step and approval timeouts, and event bus sizing.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the orchestration engine.
///
/// Loaded from `~/.maestro/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency limit for a parallel group that does not set its own.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Step timeout used when neither the step nor the agent descriptor sets one.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Approval window used when a gate does not set one. `None` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_approval_timeout_secs: Option<u64>,

    /// Buffer size of the progress event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Deployment-level cap on agent calls in flight across all executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_max_in_flight: Option<usize>,
}

fn default_max_parallelism() -> usize {
    5
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            default_step_timeout_secs: default_step_timeout_secs(),
            default_approval_timeout_secs: None,
            event_bus_capacity: default_event_bus_capacity(),
            global_max_in_flight: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallelism, 5);
        assert_eq!(config.default_step_timeout_secs, 300);
        assert!(config.default_approval_timeout_secs.is_none());
        assert!(config.global_max_in_flight.is_none());
    }

    #[test]
    fn test_engine_config_empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_partial_toml() {
        let toml_str = r#"
max_parallelism = 2
default_approval_timeout_secs = 3600
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_parallelism, 2);
        assert_eq!(config.default_approval_timeout_secs, Some(3600));
        assert_eq!(config.default_step_timeout_secs, 300);
        assert_eq!(config.event_bus_capacity, 1024);
    }
}
