//! Scheduled tasks and cron-recurring jobs, owned by the task scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::Priority;

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// Terminal tasks are never dispatched again and are eligible for
    /// retention cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// Maps a retry attempt number to the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay for every attempt.
    Fixed,
    /// Delay doubles with each attempt, capped at a maximum.
    #[default]
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
}

/// A one-off unit of work queued for execution at or after `scheduled_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    /// Handler name this task is dispatched to.
    pub task_type: String,
    pub priority: Priority,
    /// Opaque payload handed to the handler.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Earliest time the task may run; past times run immediately.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Per-task override for the scheduler's retry ceiling, carried from
    /// the recurring job that created the task (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ScheduledTask {
    /// Create a task in `scheduled` status with a generated id.
    pub fn new(
        task_type: &str,
        payload: serde_json::Value,
        priority: Priority,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            priority,
            payload,
            status: TaskStatus::Scheduled,
            scheduled_at,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: None,
            error: None,
            result: None,
        }
    }
}

/// A cron-triggered template that fans out a fresh `ScheduledTask` on each
/// fire. Mutated only by the scheduler: each fire bumps `run_count`, stamps
/// `last_run`, and recomputes `next_run`; pause/resume toggle `is_active`
/// without touching `run_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringJob {
    pub id: Uuid,
    pub name: String,
    /// Cron expression (5-field, or 6-field with seconds).
    pub schedule: String,
    /// IANA timezone name recorded on the job; occurrence computation runs
    /// in UTC.
    pub timezone: String,
    pub is_active: bool,
    pub task_type: String,
    pub task_payload: serde_json::Value,
    pub priority: Priority,
    pub run_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    /// Per-job override for the scheduler's retry ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_task_new_defaults() {
        let now = Utc::now();
        let task = ScheduledTask::new(
            "send_reminder",
            serde_json::json!({"control": "SOC2-CC1.1"}),
            Priority::High,
            now,
            now,
        );

        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.task_type, "send_reminder");
        assert!(task.started_at.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_backoff_strategy_serialization() {
        assert_eq!(
            serde_json::to_string(&BackoffStrategy::Exponential).unwrap(),
            "\"exponential\""
        );
        let parsed: BackoffStrategy = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(parsed, BackoffStrategy::Linear);
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Retrying.to_string(), "retrying");
        assert_eq!(TaskStatus::Scheduled.to_string(), "scheduled");
    }
}
