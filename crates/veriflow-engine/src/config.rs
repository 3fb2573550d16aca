//! Workflow engine configuration.

use serde::Deserialize;

use crate::error::EngineResult;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `VERIFLOW_ENGINE_`:
/// - `VERIFLOW_ENGINE_MAX_CONCURRENT_WORKFLOWS`: active-workflow ceiling (default: 50)
/// - `VERIFLOW_ENGINE_DEFAULT_TIMEOUT_MS`: workflow deadline (default: 3600000)
/// - `VERIFLOW_ENGINE_RETRY_ATTEMPTS`: per-step retry ceiling (default: 3)
/// - `VERIFLOW_ENGINE_RETRY_DELAY_MS`: delay before a step retry (default: 1000)
/// - `VERIFLOW_ENGINE_EVENT_CAPACITY`: event bus channel capacity (default: 1024)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of simultaneously active ({pending, running})
    /// workflow instances.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Default workflow timeout in milliseconds, applied when a start
    /// request does not override it.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// How many times a failed retryable step is re-attempted.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before a failed step is re-enqueued, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrent_workflows() -> usize {
    50
}

fn default_timeout_ms() -> u64 {
    3_600_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Ok(envy::prefixed("VERIFLOW_ENGINE_").from_env::<EngineConfig>()?)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}
