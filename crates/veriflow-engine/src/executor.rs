//! Step executor: dispatches a single step to its type handler.
//!
//! `task`, `approval`, and `notification` steps delegate to collaborator
//! implementations; `condition`, `parallel`, and `delay` are handled
//! in-engine. The executor is stateless between calls and cheap to clone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use veriflow_types::{
    ApprovalService, CollaboratorError, Notification, NotificationGateway, StepType, TaskExecutor,
    WorkflowCondition, WorkflowStep,
};

use crate::condition::ConditionEvaluator;
use crate::error::{EngineError, EngineResult};

/// Dispatches steps to their type handlers and reports the outcome.
pub struct StepExecutor {
    task_executor: Arc<dyn TaskExecutor>,
    approval_service: Arc<dyn ApprovalService>,
    notification_gateway: Arc<dyn NotificationGateway>,
}

impl Clone for StepExecutor {
    fn clone(&self) -> Self {
        Self {
            task_executor: self.task_executor.clone(),
            approval_service: self.approval_service.clone(),
            notification_gateway: self.notification_gateway.clone(),
        }
    }
}

impl StepExecutor {
    pub fn new(
        task_executor: Arc<dyn TaskExecutor>,
        approval_service: Arc<dyn ApprovalService>,
        notification_gateway: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            task_executor,
            approval_service,
            notification_gateway,
        }
    }

    /// Execute a single runtime step and return its result value.
    pub async fn execute(
        &self,
        step: &WorkflowStep,
        context: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        tracing::debug!(
            step_id = %step.id,
            step_type = %step.step_type,
            "executing step"
        );

        match step.step_type {
            StepType::Parallel => self.execute_parallel(step, context).await,
            _ => {
                self.execute_leaf(
                    step.step_type,
                    &step.config,
                    step.condition.as_ref(),
                    step.delay_ms,
                    &step.id,
                    context,
                )
                .await
            }
        }
    }

    /// Execute a non-parallel step.
    async fn execute_leaf(
        &self,
        step_type: StepType,
        config: &serde_json::Value,
        condition: Option<&WorkflowCondition>,
        delay_ms: Option<u64>,
        step_id: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        match step_type {
            StepType::Task => Ok(self.task_executor.run(config, context).await?),
            StepType::Approval => Ok(self.approval_service.request(config, context).await?),
            StepType::Notification => {
                let notification: Notification = serde_json::from_value(config.clone())
                    .map_err(CollaboratorError::Serialization)?;
                let deliveries = self.notification_gateway.send(&notification).await?;
                let delivered = deliveries.iter().filter(|d| d.delivered).count();

                // Partial delivery is a valid outcome; only a gateway error
                // fails the step.
                Ok(serde_json::json!({
                    "delivered": delivered,
                    "total": deliveries.len(),
                    "deliveries": deliveries,
                }))
            }
            StepType::Condition => {
                let condition = condition.ok_or_else(|| {
                    EngineError::InvalidDefinition(format!(
                        "condition step '{step_id}' has no condition"
                    ))
                })?;
                Ok(serde_json::Value::Bool(ConditionEvaluator::evaluate(
                    condition, context,
                )))
            }
            StepType::Delay => {
                let ms = delay_ms.unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(serde_json::Value::Null)
            }
            StepType::Parallel => Err(EngineError::InvalidDefinition(format!(
                "parallel step '{step_id}' cannot nest inside another parallel step"
            ))),
        }
    }

    /// Run all sub-steps concurrently and join. Every sub-step must
    /// complete; the first failure fails the group after the remaining
    /// sub-steps have finished.
    async fn execute_parallel(
        &self,
        step: &WorkflowStep,
        context: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        let mut join_set = JoinSet::new();

        for sub in &step.sub_steps {
            let executor = self.clone();
            let sub = sub.clone();
            let ctx = context.clone();

            join_set.spawn(async move {
                let result = executor
                    .execute_leaf(
                        sub.step_type,
                        &sub.config,
                        sub.condition.as_ref(),
                        sub.delay_ms,
                        &sub.id,
                        &ctx,
                    )
                    .await;
                (sub.id, result)
            });
        }

        let mut results = serde_json::Map::new();
        let mut first_error: Option<String> = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((sub_id, Ok(value))) => {
                    results.insert(sub_id, value);
                }
                Ok((sub_id, Err(e))) => {
                    tracing::warn!(
                        step_id = %step.id,
                        sub_step = %sub_id,
                        error = %e,
                        "parallel sub-step failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(format!("sub-step '{sub_id}' failed: {e}"));
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(format!("sub-step panicked: {e}"));
                    }
                }
            }
        }

        match first_error {
            Some(message) => Err(EngineError::StepExecution(
                CollaboratorError::ExecutionFailed(message),
            )),
            None => Ok(serde_json::Value::Object(results)),
        }
    }
}
