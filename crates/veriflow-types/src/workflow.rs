//! Workflow definitions, runtime instances, and step state.
//!
//! A `WorkflowDefinition` is an immutable template registered with the
//! engine. Starting a workflow copies each template step into a fresh
//! runtime `WorkflowStep` owned by a `WorkflowInstance`; from then on the
//! instance is the single source of truth for execution state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution priority for workflows and scheduled tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Queue weight used for ordering ready work (higher runs first).
    pub fn weight(&self) -> i32 {
        match self {
            Self::Critical => 10,
            Self::High => 5,
            Self::Medium => 0,
            Self::Low => -5,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// The kind of work a single step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Delegated to the `TaskExecutor` collaborator.
    Task,
    /// Delegated to the `ApprovalService` collaborator.
    Approval,
    /// Delegated to the `NotificationGateway` collaborator.
    Notification,
    /// Evaluates a declarative condition against the instance context.
    Condition,
    /// Runs its sub-steps concurrently; all must complete.
    Parallel,
    /// Suspends for a configured duration.
    Delay,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Approval => write!(f, "approval"),
            Self::Notification => write!(f, "notification"),
            Self::Condition => write!(f, "condition"),
            Self::Parallel => write!(f, "parallel"),
            Self::Delay => write!(f, "delay"),
        }
    }
}

/// Comparison operator for declarative conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Exists,
}

/// A declarative field/operator/value condition evaluated against a
/// workflow's context. The interpreter is restricted to the six operators
/// above; conditions never execute arbitrary expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCondition {
    /// Dot-separated path into the context (e.g. `"review.score"`).
    pub field: String,
    pub operator: ConditionOperator,
    /// Right-hand operand; ignored by `exists`.
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Template for a single step within a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step identifier, unique within the definition.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Step-type-specific configuration passed to the collaborator.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Condition evaluated by `condition` steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<WorkflowCondition>,
    /// Sub-steps fanned out by `parallel` steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<StepDefinition>,
    /// Suspension duration for `delay` steps, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Whether a failure of this step may be retried.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl StepDefinition {
    /// Create a step template with default config.
    pub fn new(id: &str, name: &str, step_type: StepType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            step_type,
            config: serde_json::Value::Null,
            condition: None,
            sub_steps: Vec::new(),
            delay_ms: None,
            retryable: true,
        }
    }

    /// Set the step configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Immutable workflow template. Registered once with the engine and never
/// mutated afterwards; publishing and versioning live outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    /// Ordered list of step templates.
    pub steps: Vec<StepDefinition>,
    /// Default variables seeded into each instance context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, serde_json::Value>>,
    /// Trigger identifiers, informational to the core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<String>>,
}

impl WorkflowDefinition {
    /// Create a version-1 definition with a generated id.
    pub fn new(name: &str, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            version: 1,
            steps,
            variables: None,
            triggers: None,
        }
    }
}

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active states count toward the engine's concurrency ceiling.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle state of a single runtime step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Runtime copy of a step template, owned by a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<WorkflowCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<StepDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    pub retryable: bool,
    pub status: StepStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl WorkflowStep {
    /// Create a fresh pending runtime step from a template.
    pub fn from_definition(def: &StepDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            step_type: def.step_type,
            config: def.config.clone(),
            condition: def.condition.clone(),
            sub_steps: def.sub_steps.clone(),
            delay_ms: def.delay_ms,
            retryable: def.retryable,
            status: StepStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }
}

/// Append-only execution log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub event: String,
    pub message: String,
}

/// One execution of a workflow definition, owned exclusively by the engine.
///
/// `current_step_index` is monotonically non-decreasing until a terminal
/// status is reached and always stays within `0..=steps.len()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub name: String,
    /// Mutable key/value bag shared across steps.
    pub context: HashMap<String, serde_json::Value>,
    pub current_step_index: usize,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub priority: Priority,
    /// Workflow deadline measured from `started_at`, in milliseconds.
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl WorkflowInstance {
    /// Create a pending instance from a definition, copying every template
    /// step into a fresh pending runtime step.
    pub fn from_definition(
        definition: &WorkflowDefinition,
        context: HashMap<String, serde_json::Value>,
        priority: Priority,
        timeout_ms: u64,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut seeded = definition.variables.clone().unwrap_or_default();
        seeded.extend(context);

        Self {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            name: definition.name.clone(),
            context: seeded,
            current_step_index: 0,
            steps: definition.steps.iter().map(WorkflowStep::from_definition).collect(),
            status: WorkflowStatus::Pending,
            priority,
            timeout_ms,
            created_at: now,
            started_at: None,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            error: None,
            execution_history: Vec::new(),
            metadata,
        }
    }

    /// The step at `current_step_index`, if the workflow has not run out of
    /// steps.
    pub fn current_step(&self) -> Option<&WorkflowStep> {
        self.steps.get(self.current_step_index)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut WorkflowStep> {
        self.steps.get_mut(self.current_step_index)
    }

    /// Append an entry to the execution history.
    pub fn record(&mut self, now: DateTime<Utc>, step_id: Option<&str>, event: &str, message: &str) {
        self.execution_history.push(HistoryEntry {
            timestamp: now,
            step_id: step_id.map(|s| s.to_string()),
            event: event.to_string(),
            message: message.to_string(),
        });
    }
}
