//! Orchestration event catalog and broadcast bus.
//!
//! Every observable lifecycle transition in the engine and scheduler is
//! published as an `OrchestrationEvent`. The bus is built on
//! `tokio::sync::broadcast`; publishing with no active subscribers is a
//! no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted by the workflow engine and task scheduler.
///
/// Serialized with a `type` tag so downstream logging/metrics consumers can
/// route on the event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OrchestrationEvent {
    WorkflowCreated {
        workflow_id: Uuid,
        definition_id: Uuid,
        name: String,
    },
    WorkflowPaused {
        workflow_id: Uuid,
    },
    WorkflowResumed {
        workflow_id: Uuid,
    },
    WorkflowCancelled {
        workflow_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        duration_ms: u64,
    },
    WorkflowFailed {
        workflow_id: Uuid,
        error: String,
    },
    StepCompleted {
        workflow_id: Uuid,
        step_id: String,
    },
    StepFailed {
        workflow_id: Uuid,
        step_id: String,
        error: String,
    },
    TaskScheduled {
        task_id: Uuid,
        task_type: String,
        scheduled_at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskCompleted {
        task_id: Uuid,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
    },
    RecurringJobScheduled {
        job_id: Uuid,
        schedule: String,
    },
    RecurringJobCancelled {
        job_id: Uuid,
    },
    RecurringJobPaused {
        job_id: Uuid,
    },
    RecurringJobResumed {
        job_id: Uuid,
    },
    RecurringJobExecuted {
        job_id: Uuid,
        task_id: Uuid,
        run_count: u64,
    },
    RecurringJobFailed {
        job_id: Uuid,
        error: String,
    },
}

impl OrchestrationEvent {
    /// The event name as it appears in the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowCreated { .. } => "workflowCreated",
            Self::WorkflowPaused { .. } => "workflowPaused",
            Self::WorkflowResumed { .. } => "workflowResumed",
            Self::WorkflowCancelled { .. } => "workflowCancelled",
            Self::WorkflowCompleted { .. } => "workflowCompleted",
            Self::WorkflowFailed { .. } => "workflowFailed",
            Self::StepCompleted { .. } => "stepCompleted",
            Self::StepFailed { .. } => "stepFailed",
            Self::TaskScheduled { .. } => "taskScheduled",
            Self::TaskCancelled { .. } => "taskCancelled",
            Self::TaskCompleted { .. } => "taskCompleted",
            Self::TaskFailed { .. } => "taskFailed",
            Self::RecurringJobScheduled { .. } => "recurringJobScheduled",
            Self::RecurringJobCancelled { .. } => "recurringJobCancelled",
            Self::RecurringJobPaused { .. } => "recurringJobPaused",
            Self::RecurringJobResumed { .. } => "recurringJobResumed",
            Self::RecurringJobExecuted { .. } => "recurringJobExecuted",
            Self::RecurringJobFailed { .. } => "recurringJobFailed",
        }
    }
}

/// Multi-consumer broadcast bus for orchestration events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers over the same channel.
pub struct EventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: OrchestrationEvent) {
        tracing::trace!(event = event.name(), "publishing orchestration event");
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
