//! Error types for the workflow engine.

use thiserror::Error;
use uuid::Uuid;
use veriflow_types::{CollaboratorError, WorkflowStatus};

/// Errors surfaced by engine operations and step execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No definition registered under the given id.
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),

    /// No instance exists under the given id.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// The requested lifecycle operation is not legal from the current
    /// status.
    #[error("Invalid state transition: cannot {operation} workflow in status {status}")]
    InvalidStateTransition {
        operation: &'static str,
        status: WorkflowStatus,
    },

    /// The definition is structurally unusable.
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// The active-workflow ceiling is already reached.
    #[error("Concurrency limit reached: {0} active workflows")]
    ConcurrencyLimitReached(usize),

    /// A collaborator failed while executing a step.
    #[error("Step execution failed: {0}")]
    StepExecution(#[from] CollaboratorError),

    /// The workflow exceeded its deadline.
    #[error("Workflow {workflow_id} exceeded timeout of {timeout_ms} ms")]
    TimeoutExceeded { workflow_id: Uuid, timeout_ms: u64 },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_not_found_display() {
        let id = Uuid::nil();
        let err = EngineError::DefinitionNotFound(id);
        assert_eq!(
            err.to_string(),
            format!("Workflow definition not found: {id}")
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = EngineError::InvalidStateTransition {
            operation: "pause",
            status: WorkflowStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot pause workflow in status completed"
        );
    }

    #[test]
    fn test_collaborator_error_wraps() {
        let err: EngineError = CollaboratorError::ExecutionFailed("boom".to_string()).into();
        assert!(matches!(err, EngineError::StepExecution(_)));
        assert!(err.to_string().contains("boom"));
    }
}
