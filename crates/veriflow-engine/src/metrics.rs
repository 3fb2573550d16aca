//! Engine execution metrics.

use serde::{Deserialize, Serialize};

/// Counters and gauges derived from workflow executions.
///
/// The average execution time is a streaming mean over successful
/// executions; nothing here is persisted independently of the instances it
/// is derived from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineMetrics {
    /// Workflows started (admitted) since engine creation.
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    /// Streaming mean duration of successful executions, in milliseconds.
    pub average_execution_time_ms: f64,
    /// Instances currently in {pending, running}.
    pub active_workflows: usize,
}

impl EngineMetrics {
    pub fn record_started(&mut self) {
        self.total_executions += 1;
    }

    /// Record a successful execution and fold its duration into the
    /// streaming mean.
    pub fn record_success(&mut self, duration_ms: u64) {
        self.successful_executions += 1;
        let n = self.successful_executions as f64;
        self.average_execution_time_ms += (duration_ms as f64 - self.average_execution_time_ms) / n;
    }

    pub fn record_failure(&mut self) {
        self.failed_executions += 1;
    }

    pub fn record_cancelled(&mut self) {
        self.cancelled_executions += 1;
    }
}
