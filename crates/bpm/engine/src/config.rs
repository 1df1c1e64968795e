//! Engine and timeout configuration

use bpm_types::RoleId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine behaviour knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Role whose holder receives nodes under the TO_ADMIN policy, and who
    /// may terminate instances
    #[serde(default = "default_admin_role")]
    pub admin_role: RoleId,

    /// Operator name recorded on system-attributed log entries
    #[serde(default = "default_system_actor_name")]
    pub system_actor_name: String,

    /// Upper bound on node executions per request
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Terminate instead of stalling when no condition branch matches
    #[serde(default)]
    pub terminate_on_unmatched_condition: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_role: default_admin_role(),
            system_actor_name: default_system_actor_name(),
            max_steps: default_max_steps(),
            terminate_on_unmatched_condition: false,
        }
    }
}

impl EngineConfig {
    pub fn with_admin_role(mut self, role: impl Into<String>) -> Self {
        self.admin_role = RoleId::new(role);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_terminate_on_unmatched_condition(mut self, enabled: bool) -> Self {
        self.terminate_on_unmatched_condition = enabled;
        self
    }
}

/// Timeout scheduler and job-runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Overdue-task scan cadence in seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Tasks due within this window get a reminder, in seconds
    #[serde(default = "default_lookahead")]
    pub reminder_lookahead_secs: u64,

    /// Due-time cleanup cadence in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// How often the runner polls the queue, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum delivery attempts per job
    #[serde(default = "default_job_attempts")]
    pub job_attempts: u32,

    /// Base delay for exponential retry backoff, in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Maximum tasks examined per scan
    #[serde(default = "default_scan_batch")]
    pub scan_batch_size: usize,

    /// Maximum jobs taken per runner tick
    #[serde(default = "default_jobs_per_tick")]
    pub jobs_per_tick: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            reminder_lookahead_secs: default_lookahead(),
            cleanup_interval_secs: default_cleanup_interval(),
            poll_interval_ms: default_poll_interval(),
            job_attempts: default_job_attempts(),
            backoff_base_ms: default_backoff_base(),
            scan_batch_size: default_scan_batch(),
            jobs_per_tick: default_jobs_per_tick(),
        }
    }
}

impl TimeoutConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn reminder_lookahead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reminder_lookahead_secs as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn default_admin_role() -> RoleId {
    RoleId::new("admin")
}

fn default_system_actor_name() -> String {
    "system".to_string()
}

fn default_max_steps() -> usize {
    256
}

fn default_scan_interval() -> u64 {
    60
}

fn default_lookahead() -> u64 {
    30 * 60
}

fn default_cleanup_interval() -> u64 {
    60 * 60
}

fn default_poll_interval() -> u64 {
    500
}

fn default_job_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_scan_batch() -> usize {
    500
}

fn default_jobs_per_tick() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.admin_role, RoleId::new("admin"));
        assert!(!engine.terminate_on_unmatched_condition);

        let timeout = TimeoutConfig::default();
        assert_eq!(timeout.scan_interval(), Duration::from_secs(60));
        assert_eq!(timeout.reminder_lookahead(), chrono::Duration::minutes(30));
        assert_eq!(timeout.job_attempts, 3);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: TimeoutConfig =
            serde_json::from_str(r#"{"scan_interval_secs": 5}"#).unwrap();
        assert_eq!(config.scan_interval_secs, 5);
        assert_eq!(config.cleanup_interval_secs, 3600);
    }
}
