//! Narrow contracts for the external services consumed by the core.
//!
//! The engine and scheduler never talk to transports directly: task work,
//! approvals, notification delivery, persistence, and wall-clock time all
//! arrive through these traits so deployments (and tests) can swap
//! implementations freely.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{RecurringJob, ScheduledTask};
use crate::workflow::WorkflowInstance;

/// Errors surfaced by collaborator implementations.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator ran but the work failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The collaborator did not respond in time.
    #[error("Execution timed out after {0} ms")]
    Timeout(u64),

    /// An approval was explicitly rejected.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The step or task configuration was unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Executes `task` steps against whatever backs them (service calls,
/// document processing, control checks).
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run(
        &self,
        config: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// Requests an approval decision for `approval` steps.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn request(
        &self,
        config: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// Notification assembled from a `notification` step's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// Channel identifiers understood by the gateway (e.g. "email",
    /// "slack").
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Delivery outcome for a single channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub channel: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Sends notifications on behalf of `notification` steps and scheduler
/// handlers. Partial success (some channels delivered) is a valid outcome,
/// not an error.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(
        &self,
        notification: &Notification,
    ) -> Result<Vec<ChannelDelivery>, CollaboratorError>;
}

/// Optional write-through persistence. The engine and scheduler operate
/// fully in memory when no gateway is configured; the load methods default
/// to empty so write-only gateways stay trivial to implement.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), CollaboratorError>;
    async fn save_task(&self, task: &ScheduledTask) -> Result<(), CollaboratorError>;
    async fn save_job(&self, job: &RecurringJob) -> Result<(), CollaboratorError>;

    async fn load_instances(&self) -> Result<Vec<WorkflowInstance>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn load_tasks(&self) -> Result<Vec<ScheduledTask>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn load_jobs(&self) -> Result<Vec<RecurringJob>, CollaboratorError> {
        Ok(Vec::new())
    }
}

/// Wall-clock source, injected for testability.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
