//! Task handler registry and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use veriflow_types::{CollaboratorError, ScheduledTask};

use crate::error::{SchedulerError, SchedulerResult};

/// Handler trait for implementing executable task types.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns the task type this handler serves.
    fn task_type(&self) -> &'static str;

    /// Execute the task and return its result payload.
    async fn execute(&self, task: &ScheduledTask) -> Result<serde_json::Value, CollaboratorError>;
}

/// Registry of available task handlers, keyed by task type.
pub struct TaskHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler.
    pub fn register<H: TaskHandler + 'static>(&mut self, handler: H) {
        let task_type = handler.task_type().to_string();
        self.handlers.insert(task_type, Arc::new(handler));
    }

    /// Get a handler by task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Check if a handler is registered.
    pub fn has(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// List all registered task types.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Execute a task through its registered handler.
    ///
    /// A missing handler is an `UnknownTaskType` error: fatal for the task,
    /// never retried.
    pub async fn execute(&self, task: &ScheduledTask) -> SchedulerResult<serde_json::Value> {
        let handler = self
            .get(&task.task_type)
            .ok_or_else(|| SchedulerError::UnknownTaskType(task.task_type.clone()))?;

        handler
            .execute(task)
            .await
            .map_err(|e| SchedulerError::Internal(e.to_string()))
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use veriflow_types::Priority;

    struct MockHandler;

    #[async_trait]
    impl TaskHandler for MockHandler {
        fn task_type(&self) -> &'static str {
            "mock"
        }

        async fn execute(
            &self,
            _task: &ScheduledTask,
        ) -> Result<serde_json::Value, CollaboratorError> {
            Ok(serde_json::json!({"mock": true}))
        }
    }

    fn make_task(task_type: &str) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask::new(task_type, serde_json::json!({}), Priority::Medium, now, now)
    }

    #[test]
    fn test_registry_new() {
        let registry = TaskHandlerRegistry::new();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_registry_register() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(MockHandler);

        assert!(registry.has("mock"));
        assert!(!registry.has("unknown"));
        assert_eq!(registry.list(), vec!["mock"]);
    }

    #[tokio::test]
    async fn test_registry_execute() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(MockHandler);

        let result = registry.execute(&make_task("mock")).await.unwrap();
        assert_eq!(result["mock"], true);
    }

    #[tokio::test]
    async fn test_registry_execute_unknown_type() {
        let registry = TaskHandlerRegistry::new();

        let result = registry.execute(&make_task("unknown")).await;
        assert!(matches!(result, Err(SchedulerError::UnknownTaskType(_))));
    }
}
