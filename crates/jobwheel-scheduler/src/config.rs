//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Grace window in seconds: a due fire evaluated later than this is a
    /// misfire and handled by the job's misfire policy.
    #[serde(default = "default_misfire_grace")]
    pub misfire_grace_secs: u64,

    /// Default execution timeout in seconds (0 = no timeout). Jobs may
    /// override this per definition.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    /// Upper bound for query page sizes; larger requests are clamped.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Consecutive execution failures before a job is moved to the error
    /// state and unscheduled (0 = never).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to wait for in-flight executions on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Maximum retained execution records (0 = unbounded); oldest are
    /// dropped first.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_misfire_grace() -> u64 {
    60
}

fn default_timeout() -> u64 {
    300
}

fn default_max_page_size() -> u32 {
    100
}

fn default_failure_threshold() -> u32 {
    10
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_max_log_entries() -> usize {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_grace_secs: default_misfire_grace(),
            default_timeout_secs: default_timeout(),
            max_page_size: default_max_page_size(),
            failure_threshold: default_failure_threshold(),
            shutdown_grace_secs: default_shutdown_grace(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.misfire_grace_secs, 60);
        assert_eq!(config.default_timeout_secs, 300);
        assert_eq!(config.max_page_size, 100);
        assert_eq!(config.failure_threshold, 10);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"misfire_grace_secs": 5}"#).unwrap();
        assert_eq!(config.misfire_grace_secs, 5);
        assert_eq!(config.max_page_size, 100);
        assert_eq!(config.shutdown_grace_secs, 30);
    }
}
