//! Error types for the task scheduler.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No task exists under the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// No recurring job exists under the given id.
    #[error("Recurring job not found: {0}")]
    RecurringJobNotFound(Uuid),

    /// No handler is registered for the task's type. Fatal for that task;
    /// never retried.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// The cron expression could not be parsed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The cron trigger backend failed.
    #[error("Trigger error: {0}")]
    Trigger(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using SchedulerError.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

impl From<envy::Error> for SchedulerError {
    fn from(err: envy::Error) -> Self {
        SchedulerError::Config(err.to_string())
    }
}
