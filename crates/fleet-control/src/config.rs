//! Coordinator configuration

use serde::{Deserialize, Serialize};

/// Tuning of the master action coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Log lines kept in memory per run for status responses
    #[serde(default = "default_recent_log_lines")]
    pub recent_log_lines: usize,

    /// Buffered log lines that trigger a write to the action journal
    #[serde(default = "default_log_flush_threshold")]
    pub log_flush_threshold: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            recent_log_lines: default_recent_log_lines(),
            log_flush_threshold: default_log_flush_threshold(),
        }
    }
}

fn default_recent_log_lines() -> usize {
    50
}

fn default_log_flush_threshold() -> usize {
    64
}
