//! Task scheduler configuration.

use serde::Deserialize;
use veriflow_types::BackoffStrategy;

use crate::error::SchedulerResult;

/// Scheduler configuration loaded from environment variables.
///
/// Environment variables are prefixed with `VERIFLOW_SCHEDULER_`:
/// - `VERIFLOW_SCHEDULER_CONCURRENCY`: worker pool size (default: 4)
/// - `VERIFLOW_SCHEDULER_DEFAULT_DELAY_MS`: delay applied when a task has no
///   explicit schedule time (default: 0)
/// - `VERIFLOW_SCHEDULER_MAX_RETRIES`: retry ceiling per task (default: 3)
/// - `VERIFLOW_SCHEDULER_RETRY_DELAY_MS`: backoff base delay (default: 1000)
/// - `VERIFLOW_SCHEDULER_MAX_RETRY_DELAY_MS`: backoff cap (default: 30000)
/// - `VERIFLOW_SCHEDULER_BACKOFF_STRATEGY`: fixed | exponential | linear
/// - `VERIFLOW_SCHEDULER_CLEANUP_INTERVAL_MS`: cleanup timer period (default: 3600000)
/// - `VERIFLOW_SCHEDULER_RETENTION_MS`: terminal-task retention window (default: 86400000)
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Bounded worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay applied when `scheduled_at` is not given, in milliseconds.
    #[serde(default)]
    pub default_delay_ms: u64,

    /// How many times a failed task is retried before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay fed into the backoff strategy, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound on any computed backoff delay, in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,

    /// Period of the terminal-task cleanup timer, in milliseconds.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// How long terminal tasks are kept before cleanup, in milliseconds.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_cleanup_interval_ms() -> u64 {
    3_600_000
}

fn default_retention_ms() -> u64 {
    86_400_000
}

fn default_event_capacity() -> usize {
    1024
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> SchedulerResult<Self> {
        Ok(envy::prefixed("VERIFLOW_SCHEDULER_").from_env::<SchedulerConfig>()?)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_delay_ms: 0,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff_strategy: BackoffStrategy::default(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            retention_ms: default_retention_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}
