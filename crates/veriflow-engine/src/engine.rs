//! Workflow engine: instance ownership, lifecycle control, and the
//! execution queue processor.
//!
//! The engine owns every workflow instance it creates. Lifecycle methods
//! (`start_workflow`, `pause_workflow`, `resume_workflow`,
//! `cancel_workflow`) only mutate instance state; actual step processing
//! happens on the execution queue: intents (`start`, `resume`,
//! `retry_step`) flow through an mpsc channel drained by a dispatch loop
//! that advances one workflow at a time per slot, bounded by
//! `max_concurrent_workflows`.
//!
//! Cancellation and pause are cooperative: in-flight collaborator calls are
//! never interrupted; the next step boundary observes the new status and
//! stops further progress. Timeouts are checked once per step boundary.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use uuid::Uuid;
use veriflow_types::{
    Clock, EventBus, OrchestrationEvent, PersistenceGateway, Priority, StepStatus, StepType,
    SystemClock, WorkflowDefinition, WorkflowInstance, WorkflowStatus, WorkflowStep,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::StepExecutor;
use crate::metrics::EngineMetrics;

/// Message a cancelled running step is stamped with.
const STEP_CANCELLED_MESSAGE: &str = "Cancelled due to workflow cancellation";

/// Options accepted by `start_workflow`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub priority: Option<Priority>,
    /// Overrides the engine's default workflow timeout.
    pub timeout_ms: Option<u64>,
    pub metadata: Option<serde_json::Value>,
}

/// Intent processed by the execution queue.
#[derive(Debug, Clone, Copy)]
enum ExecutionIntent {
    Start(Uuid),
    Resume(Uuid),
    RetryStep(Uuid),
}

impl ExecutionIntent {
    fn workflow_id(&self) -> Uuid {
        match self {
            Self::Start(id) | Self::Resume(id) | Self::RetryStep(id) => *id,
        }
    }
}

/// What the dispatch loop should do next for a workflow.
enum Advance {
    /// Stop advancing; a suspension point or terminal state was reached.
    Stop,
    /// Re-evaluate the instance (status changed under the lock).
    Again,
    /// Execute the cloned step outside the lock.
    Execute {
        step: Box<WorkflowStep>,
        context: HashMap<String, serde_json::Value>,
    },
}

/// Deferred metrics update, applied after the instance lock is released.
enum MetricsOp {
    None,
    Success(u64),
    Failure,
}

/// Stateful workflow execution engine.
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ExecutionIntent>>>,
}

struct EngineInner {
    config: EngineConfig,
    definitions: RwLock<HashMap<Uuid, WorkflowDefinition>>,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    /// Workflows currently being advanced by a dispatch slot.
    in_flight: Mutex<HashSet<Uuid>>,
    executor: StepExecutor,
    events: EventBus,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn PersistenceGateway>>,
    intents: mpsc::UnboundedSender<ExecutionIntent>,
    metrics: Mutex<EngineMetrics>,
    /// Bounds how many workflows advance concurrently.
    dispatch_slots: Arc<Semaphore>,
}

impl WorkflowEngine {
    /// Create an engine with the system clock and no persistence gateway.
    pub fn new(config: EngineConfig, executor: StepExecutor) -> Self {
        Self::with_collaborators(config, executor, Arc::new(SystemClock), None)
    }

    /// Create an engine with explicit clock and persistence collaborators.
    pub fn with_collaborators(
        config: EngineConfig,
        executor: StepExecutor,
        clock: Arc<dyn Clock>,
        persistence: Option<Arc<dyn PersistenceGateway>>,
    ) -> Self {
        let (intents, receiver) = mpsc::unbounded_channel();
        let events = EventBus::new(config.event_capacity);
        let dispatch_slots = Arc::new(Semaphore::new(config.max_concurrent_workflows));

        Self {
            inner: Arc::new(EngineInner {
                config,
                definitions: RwLock::new(HashMap::new()),
                instances: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                executor,
                events,
                clock,
                persistence,
                intents,
                metrics: Mutex::new(EngineMetrics::default()),
                dispatch_slots,
            }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Start the execution queue processor, rehydrating persisted instances
    /// first when a gateway is configured. Idempotent; the loop runs until
    /// the engine is dropped.
    pub async fn start(&self) {
        let Some(receiver) = self.receiver.lock().await.take() else {
            return;
        };

        self.restore().await;

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(EngineInner::dispatch_loop(receiver, weak));
        tracing::info!(
            max_concurrent_workflows = self.inner.config.max_concurrent_workflows,
            "workflow engine started"
        );
    }

    /// Load persisted instances and re-enqueue the active ones.
    async fn restore(&self) {
        let Some(gateway) = &self.inner.persistence else {
            return;
        };

        match gateway.load_instances().await {
            Ok(loaded) if !loaded.is_empty() => {
                let mut resumable = Vec::new();
                {
                    let mut instances = self.inner.instances.write().await;
                    for instance in loaded {
                        if instance.status.is_active() {
                            resumable.push(instance.id);
                        }
                        instances.entry(instance.id).or_insert(instance);
                    }
                }

                tracing::info!(resumable = resumable.len(), "restored workflow instances");
                for workflow_id in resumable {
                    let _ = self.inner.intents.send(ExecutionIntent::Start(workflow_id));
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load persisted instances"),
        }
    }

    /// Subscribe to orchestration events emitted by this engine.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.inner.events.subscribe()
    }

    /// The engine's event bus, for wiring into shared observers.
    pub fn event_bus(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Register a workflow definition. The definition is immutable once
    /// registered.
    pub async fn register_definition(&self, definition: WorkflowDefinition) -> EngineResult<Uuid> {
        validate_definition(&definition)?;

        let id = definition.id;
        let name = definition.name.clone();
        self.inner.definitions.write().await.insert(id, definition);

        tracing::info!(definition_id = %id, name = %name, "workflow definition registered");
        Ok(id)
    }

    /// Create an instance of a registered definition and enqueue it for
    /// execution.
    ///
    /// Admission is bounded: when the active ({pending, running}) set is at
    /// `max_concurrent_workflows`, the start is rejected rather than queued
    /// so the active-set invariant holds unconditionally.
    pub async fn start_workflow(
        &self,
        definition_id: Uuid,
        context: HashMap<String, serde_json::Value>,
        options: StartOptions,
    ) -> EngineResult<WorkflowInstance> {
        let definition = self
            .inner
            .definitions
            .read()
            .await
            .get(&definition_id)
            .cloned()
            .ok_or(EngineError::DefinitionNotFound(definition_id))?;

        let instance = {
            let mut instances = self.inner.instances.write().await;
            let active = instances.values().filter(|i| i.status.is_active()).count();
            if active >= self.inner.config.max_concurrent_workflows {
                return Err(EngineError::ConcurrencyLimitReached(active));
            }

            let now = self.inner.clock.now();
            let mut instance = WorkflowInstance::from_definition(
                &definition,
                context,
                options.priority.unwrap_or_default(),
                options.timeout_ms.unwrap_or(self.inner.config.default_timeout_ms),
                options.metadata,
                now,
            );
            instance.record(now, None, "workflow_created", "instance created");
            instances.insert(instance.id, instance.clone());
            instance
        };

        self.inner.metrics.lock().await.record_started();
        self.inner.events.publish(OrchestrationEvent::WorkflowCreated {
            workflow_id: instance.id,
            definition_id,
            name: instance.name.clone(),
        });
        self.inner.persist(&instance).await;

        tracing::info!(
            workflow_id = %instance.id,
            definition_id = %definition_id,
            priority = %instance.priority,
            "workflow started"
        );

        let _ = self.inner.intents.send(ExecutionIntent::Start(instance.id));
        Ok(instance)
    }

    /// Fetch a snapshot of an instance.
    pub async fn get_workflow(&self, workflow_id: Uuid) -> Option<WorkflowInstance> {
        self.inner.instances.read().await.get(&workflow_id).cloned()
    }

    /// Snapshots of all instances in {pending, running}.
    pub async fn get_active_workflows(&self) -> Vec<WorkflowInstance> {
        self.inner
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status.is_active())
            .cloned()
            .collect()
    }

    /// Pause a running workflow. The current step finishes; the next step
    /// boundary observes the pause.
    pub async fn pause_workflow(&self, workflow_id: Uuid) -> EngineResult<()> {
        let snapshot = {
            let mut instances = self.inner.instances.write().await;
            let instance = instances
                .get_mut(&workflow_id)
                .ok_or(EngineError::InstanceNotFound(workflow_id))?;

            if instance.status != WorkflowStatus::Running {
                return Err(EngineError::InvalidStateTransition {
                    operation: "pause",
                    status: instance.status,
                });
            }

            let now = self.inner.clock.now();
            instance.status = WorkflowStatus::Paused;
            instance.paused_at = Some(now);
            instance.record(now, None, "workflow_paused", "execution paused");
            instance.clone()
        };

        self.inner
            .events
            .publish(OrchestrationEvent::WorkflowPaused { workflow_id });
        self.inner.persist(&snapshot).await;

        tracing::info!(workflow_id = %workflow_id, "workflow paused");
        Ok(())
    }

    /// Resume a paused workflow and re-enqueue it for processing.
    pub async fn resume_workflow(&self, workflow_id: Uuid) -> EngineResult<()> {
        let snapshot = {
            let mut instances = self.inner.instances.write().await;
            let instance = instances
                .get_mut(&workflow_id)
                .ok_or(EngineError::InstanceNotFound(workflow_id))?;

            if instance.status != WorkflowStatus::Paused {
                return Err(EngineError::InvalidStateTransition {
                    operation: "resume",
                    status: instance.status,
                });
            }

            let now = self.inner.clock.now();
            instance.status = WorkflowStatus::Running;
            instance.resumed_at = Some(now);
            instance.record(now, None, "workflow_resumed", "execution resumed");
            instance.clone()
        };

        self.inner
            .events
            .publish(OrchestrationEvent::WorkflowResumed { workflow_id });
        self.inner.persist(&snapshot).await;

        tracing::info!(workflow_id = %workflow_id, "workflow resumed");
        let _ = self.inner.intents.send(ExecutionIntent::Resume(workflow_id));
        Ok(())
    }

    /// Cancel a workflow. Illegal from `completed` and `cancelled`. A
    /// running current step is marked cancelled; any in-flight collaborator
    /// call is left to finish and its result is discarded at the boundary.
    pub async fn cancel_workflow(
        &self,
        workflow_id: Uuid,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        let snapshot = {
            let mut instances = self.inner.instances.write().await;
            let instance = instances
                .get_mut(&workflow_id)
                .ok_or(EngineError::InstanceNotFound(workflow_id))?;

            if matches!(
                instance.status,
                WorkflowStatus::Completed | WorkflowStatus::Cancelled
            ) {
                return Err(EngineError::InvalidStateTransition {
                    operation: "cancel",
                    status: instance.status,
                });
            }

            let now = self.inner.clock.now();
            instance.status = WorkflowStatus::Cancelled;
            instance.completed_at = Some(now);
            instance.error = reason.map(|r| r.to_string());

            if let Some(step) = instance.current_step_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Cancelled;
                    step.error = Some(STEP_CANCELLED_MESSAGE.to_string());
                    step.completed_at = Some(now);
                }
            }

            let message = reason.unwrap_or("no reason given");
            instance.record(now, None, "workflow_cancelled", message);
            instance.clone()
        };

        self.inner.metrics.lock().await.record_cancelled();
        self.inner.events.publish(OrchestrationEvent::WorkflowCancelled {
            workflow_id,
            reason: reason.map(|r| r.to_string()),
        });
        self.inner.persist(&snapshot).await;

        tracing::info!(workflow_id = %workflow_id, reason = ?reason, "workflow cancelled");
        Ok(())
    }

    /// Current engine metrics, with the active-workflow gauge computed from
    /// the instance registry.
    pub async fn metrics(&self) -> EngineMetrics {
        let active = self
            .inner
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status.is_active())
            .count();

        let mut metrics = self.inner.metrics.lock().await.clone();
        metrics.active_workflows = active;
        metrics
    }
}

impl EngineInner {
    /// Drain the intent queue, advancing one workflow per dispatch slot.
    ///
    /// A single workflow's failure never tears the loop down; the loop ends
    /// when the engine is dropped.
    async fn dispatch_loop(
        mut receiver: mpsc::UnboundedReceiver<ExecutionIntent>,
        weak: Weak<EngineInner>,
    ) {
        while let Some(intent) = receiver.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };

            let Ok(permit) = inner.dispatch_slots.clone().acquire_owned().await else {
                break;
            };

            tokio::spawn(async move {
                let _permit = permit;
                inner.process_intent(intent).await;
            });
        }

        tracing::debug!("execution queue processor stopped");
    }

    async fn process_intent(self: Arc<Self>, intent: ExecutionIntent) {
        let workflow_id = intent.workflow_id();

        // One advancer per instance; a duplicate intent is dropped because
        // the in-flight advancer observes the latest state anyway.
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(workflow_id) {
                tracing::debug!(%workflow_id, "workflow already being advanced, dropping intent");
                return;
            }
        }

        self.advance_workflow(workflow_id).await;
        self.in_flight.lock().await.remove(&workflow_id);
    }

    /// Advance a workflow until it completes, fails, pauses, or suspends
    /// for a retry wait.
    async fn advance_workflow(&self, workflow_id: Uuid) {
        loop {
            let advance = self.next_action(workflow_id).await;

            match advance {
                Advance::Stop => return,
                Advance::Again => continue,
                Advance::Execute { step, context } => {
                    let result = self.executor.execute(&step, &context).await;
                    if !self.apply_step_outcome(workflow_id, result).await {
                        return;
                    }
                }
            }
        }
    }

    /// Inspect the instance under the write lock and decide the next action.
    async fn next_action(&self, workflow_id: Uuid) -> Advance {
        let mut events = Vec::new();
        let mut persist = None;
        let mut metric = MetricsOp::None;

        let advance = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&workflow_id) else {
                tracing::warn!(%workflow_id, "instance missing from registry");
                return Advance::Stop;
            };

            match instance.status {
                WorkflowStatus::Pending => {
                    let now = self.clock.now();
                    instance.status = WorkflowStatus::Running;
                    instance.started_at = Some(now);
                    instance.record(now, None, "workflow_started", "execution started");
                    Advance::Again
                }
                WorkflowStatus::Running => {
                    if instance.current_step_index >= instance.steps.len() {
                        let now = self.clock.now();
                        let duration_ms = instance
                            .started_at
                            .map(|s| now.signed_duration_since(s).num_milliseconds().max(0) as u64)
                            .unwrap_or(0);

                        instance.status = WorkflowStatus::Completed;
                        instance.completed_at = Some(now);
                        instance.record(now, None, "workflow_completed", "all steps completed");

                        events.push(OrchestrationEvent::WorkflowCompleted {
                            workflow_id,
                            duration_ms,
                        });
                        metric = MetricsOp::Success(duration_ms);
                        persist = Some(instance.clone());
                        Advance::Stop
                    } else if self.timed_out(instance) {
                        let now = self.clock.now();
                        let error = EngineError::TimeoutExceeded {
                            workflow_id,
                            timeout_ms: instance.timeout_ms,
                        }
                        .to_string();

                        instance.status = WorkflowStatus::Failed;
                        instance.error = Some(error.clone());
                        instance.completed_at = Some(now);
                        instance.record(now, None, "workflow_failed", &error);

                        events.push(OrchestrationEvent::WorkflowFailed { workflow_id, error });
                        metric = MetricsOp::Failure;
                        persist = Some(instance.clone());
                        Advance::Stop
                    } else {
                        let now = self.clock.now();
                        let index = instance.current_step_index;
                        instance.steps[index].status = StepStatus::Running;
                        instance.steps[index].started_at = Some(now);

                        Advance::Execute {
                            step: Box::new(instance.steps[index].clone()),
                            context: instance.context.clone(),
                        }
                    }
                }
                // Paused or terminal: the boundary observes it and stops.
                _ => Advance::Stop,
            }
        };

        self.apply_metric(metric).await;
        for event in events {
            self.events.publish(event);
        }
        if let Some(instance) = persist {
            self.persist(&instance).await;
        }

        advance
    }

    /// Record a finished step execution. Returns `true` when the dispatch
    /// loop should keep advancing this workflow.
    async fn apply_step_outcome(
        &self,
        workflow_id: Uuid,
        result: EngineResult<serde_json::Value>,
    ) -> bool {
        let mut events = Vec::new();
        let mut persist = None;
        let mut metric = MetricsOp::None;

        let keep_going = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&workflow_id) else {
                return false;
            };

            // Cancellation raced the step: the cancel path already stamped
            // the running step, discard the late result.
            if instance.status == WorkflowStatus::Cancelled {
                return false;
            }

            let now = self.clock.now();
            let index = instance.current_step_index;
            if index >= instance.steps.len() {
                return false;
            }

            match result {
                Ok(value) => {
                    let step_id = {
                        let step = &mut instance.steps[index];
                        step.status = StepStatus::Completed;
                        step.completed_at = Some(now);
                        step.result = Some(value.clone());
                        step.error = None;
                        step.id.clone()
                    };

                    merge_result(&mut instance.context, &step_id, value);
                    instance.current_step_index += 1;
                    instance.record(now, Some(step_id.as_str()), "step_completed", "step completed");

                    events.push(OrchestrationEvent::StepCompleted {
                        workflow_id,
                        step_id,
                    });
                    persist = Some(instance.clone());
                    true
                }
                Err(error) => {
                    let message = error.to_string();
                    let (step_id, will_retry, attempt) = {
                        let step = &mut instance.steps[index];
                        step.retry_count += 1;
                        let will_retry =
                            step.retryable && step.retry_count < self.config.retry_attempts;
                        if will_retry {
                            step.status = StepStatus::Pending;
                            step.started_at = None;
                            step.error = Some(message.clone());
                        } else {
                            step.status = StepStatus::Failed;
                            step.error = Some(message.clone());
                            step.completed_at = Some(now);
                        }
                        (step.id.clone(), will_retry, step.retry_count)
                    };

                    if will_retry {
                        instance.record(
                            now,
                            Some(step_id.as_str()),
                            "step_retry",
                            &format!("retry {attempt} scheduled: {message}"),
                        );

                        tracing::warn!(
                            %workflow_id,
                            step_id = %step_id,
                            attempt,
                            error = %message,
                            "step failed, retry scheduled"
                        );

                        let sender = self.intents.clone();
                        let delay = Duration::from_millis(self.config.retry_delay_ms);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = sender.send(ExecutionIntent::RetryStep(workflow_id));
                        });

                        persist = Some(instance.clone());
                    } else {
                        instance.status = WorkflowStatus::Failed;
                        instance.error = Some(message.clone());
                        instance.completed_at = Some(now);
                        instance.record(now, Some(step_id.as_str()), "workflow_failed", &message);

                        tracing::error!(
                            %workflow_id,
                            step_id = %step_id,
                            error = %message,
                            "step retries exhausted, workflow failed"
                        );

                        events.push(OrchestrationEvent::StepFailed {
                            workflow_id,
                            step_id,
                            error: message.clone(),
                        });
                        events.push(OrchestrationEvent::WorkflowFailed {
                            workflow_id,
                            error: message,
                        });
                        metric = MetricsOp::Failure;
                        persist = Some(instance.clone());
                    }
                    false
                }
            }
        };

        self.apply_metric(metric).await;
        for event in events {
            self.events.publish(event);
        }
        if let Some(instance) = persist {
            self.persist(&instance).await;
        }

        keep_going
    }

    fn timed_out(&self, instance: &WorkflowInstance) -> bool {
        let Some(started) = instance.started_at else {
            return false;
        };
        let elapsed = self.clock.now().signed_duration_since(started).num_milliseconds();
        elapsed >= 0 && elapsed as u64 > instance.timeout_ms
    }

    async fn apply_metric(&self, op: MetricsOp) {
        match op {
            MetricsOp::None => {}
            MetricsOp::Success(duration_ms) => {
                self.metrics.lock().await.record_success(duration_ms)
            }
            MetricsOp::Failure => self.metrics.lock().await.record_failure(),
        }
    }

    async fn persist(&self, instance: &WorkflowInstance) {
        if let Some(gateway) = &self.persistence {
            if let Err(e) = gateway.save_instance(instance).await {
                tracing::warn!(
                    workflow_id = %instance.id,
                    error = %e,
                    "persistence write failed"
                );
            }
        }
    }
}

/// Merge a step result into the instance context: object results merge
/// their keys, anything else lands under the step id.
fn merge_result(
    context: &mut HashMap<String, serde_json::Value>,
    step_id: &str,
    value: serde_json::Value,
) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                context.insert(k, v);
            }
        }
        serde_json::Value::Null => {}
        other => {
            context.insert(step_id.to_string(), other);
        }
    }
}

/// Structural validation applied at registration time.
fn validate_definition(definition: &WorkflowDefinition) -> EngineResult<()> {
    if definition.steps.is_empty() {
        return Err(EngineError::InvalidDefinition(
            "definition has no steps".to_string(),
        ));
    }

    for step in &definition.steps {
        if step.step_type == StepType::Parallel {
            if step.sub_steps.is_empty() {
                return Err(EngineError::InvalidDefinition(format!(
                    "parallel step '{}' has no sub-steps",
                    step.id
                )));
            }
            for sub in &step.sub_steps {
                if sub.step_type == StepType::Parallel {
                    return Err(EngineError::InvalidDefinition(format!(
                        "parallel step '{}' nests parallel sub-step '{}'",
                        step.id, sub.id
                    )));
                }
            }
        }
    }

    Ok(())
}
