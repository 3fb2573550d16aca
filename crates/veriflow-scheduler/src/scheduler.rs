//! Task scheduler: one-off tasks, recurring cron jobs, and the priority
//! worker pool.
//!
//! One-off tasks enter a delay-aware priority queue and are drained by a
//! dispatch loop bounded by the configured `concurrency`. Failures retry
//! per the backoff strategy up to the retry ceiling; exhaustion leaves the
//! task failed with a non-empty error. Recurring jobs are independent cron
//! triggers that fan a fresh task into the same queue on every fire.
//!
//! Cancellation is cooperative: `cancel_task` only marks state; a task
//! already handed to a worker finishes its handler call and the completion
//! boundary discards the result.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;
use veriflow_types::{
    Clock, EventBus, OrchestrationEvent, PersistenceGateway, Priority, RecurringJob,
    ScheduledTask, SystemClock, TaskStatus,
};

use crate::backoff::backoff_delay;
use crate::config::SchedulerConfig;
use crate::cron::{next_occurrence, normalize_cron, CronTrigger, TriggerCallback};
use crate::error::{SchedulerError, SchedulerResult};
use crate::handler::TaskHandlerRegistry;
use crate::queue::TaskQueue;

/// Longest the dispatcher sleeps before re-checking the queue.
const DISPATCH_TICK: Duration = Duration::from_millis(500);

/// Request to schedule a one-off task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// Earliest execution time. Past times run immediately; omitted means
    /// now plus the configured default delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn new(task_type: &str, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.to_string(),
            payload,
            priority: Priority::default(),
            scheduled_at: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

/// Request to register a recurring job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    /// Cron expression (5-field, or 6-field with seconds).
    pub schedule: String,
    /// IANA timezone name recorded on the job (default "UTC").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub task_payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Counters and gauges for scheduler activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    /// Streaming mean duration of completed tasks, in milliseconds.
    pub average_task_duration_ms: f64,
    /// Tasks currently in {scheduled, retrying, running}.
    pub pending_tasks: usize,
    /// Recurring jobs currently active.
    pub active_jobs: usize,
}

impl SchedulerMetrics {
    fn record_completed(&mut self, duration_ms: u64) {
        self.tasks_completed += 1;
        let n = self.tasks_completed as f64;
        self.average_task_duration_ms += (duration_ms as f64 - self.average_task_duration_ms) / n;
    }
}

/// Priority worker pool with one-off and cron-recurring task scheduling.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    registry: TaskHandlerRegistry,
    tasks: RwLock<HashMap<Uuid, ScheduledTask>>,
    jobs: RwLock<HashMap<Uuid, RecurringJob>>,
    queue: TaskQueue,
    cron: CronTrigger,
    events: EventBus,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn PersistenceGateway>>,
    metrics: Mutex<SchedulerMetrics>,
    workers: Arc<Semaphore>,
}

impl TaskScheduler {
    /// Create a scheduler with the system clock and no persistence gateway.
    pub fn new(config: SchedulerConfig, registry: TaskHandlerRegistry) -> Self {
        Self::with_collaborators(config, registry, Arc::new(SystemClock), None)
    }

    /// Create a scheduler with explicit clock and persistence collaborators.
    pub fn with_collaborators(
        config: SchedulerConfig,
        registry: TaskHandlerRegistry,
        clock: Arc<dyn Clock>,
        persistence: Option<Arc<dyn PersistenceGateway>>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let workers = Arc::new(Semaphore::new(config.concurrency));

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                registry,
                tasks: RwLock::new(HashMap::new()),
                jobs: RwLock::new(HashMap::new()),
                queue: TaskQueue::new(),
                cron: CronTrigger::new(),
                events,
                clock,
                persistence,
                metrics: Mutex::new(SchedulerMetrics::default()),
                workers,
            }),
            handles: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        }
    }

    /// Start the worker pool dispatcher, cleanup timer, and cron backend.
    /// Idempotent.
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }

        self.inner.cron.start().await?;
        self.restore().await;

        let weak = Arc::downgrade(&self.inner);
        let dispatcher = tokio::spawn(SchedulerInner::dispatch_loop(weak.clone()));
        let cleanup = tokio::spawn(SchedulerInner::cleanup_loop(weak));

        let mut handles = self.handles.lock().await;
        handles.push(dispatcher);
        handles.push(cleanup);

        *started = true;
        tracing::info!(
            concurrency = self.inner.config.concurrency,
            "task scheduler started"
        );
        Ok(())
    }

    /// Stop the dispatcher, cleanup timer, and cron backend. In-flight
    /// handler calls are aborted with their worker tasks' parents detached;
    /// task state is left as-is.
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
        self.inner.cron.shutdown().await?;
        *self.started.lock().await = false;

        tracing::info!("task scheduler stopped");
        Ok(())
    }

    /// Subscribe to orchestration events emitted by this scheduler.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.inner.events.subscribe()
    }

    /// The scheduler's event bus, for wiring into shared observers.
    pub fn event_bus(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Enqueue a one-off task. A past `scheduled_at` is clamped to run
    /// immediately, never with a negative delay.
    pub async fn schedule_task(&self, request: TaskRequest) -> SchedulerResult<Uuid> {
        self.inner.schedule_task(request).await
    }

    /// Cancel a task. Returns `false` without touching anything when the
    /// task is absent or already terminal.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let cancelled = {
            let mut tasks = self.inner.tasks.write().await;
            match tasks.get_mut(&task_id) {
                None => false,
                Some(task) if task.status.is_terminal() => false,
                Some(task) => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(self.inner.clock.now());
                    true
                }
            }
        };

        if cancelled {
            self.inner.metrics.lock().await.tasks_cancelled += 1;
            self.inner
                .events
                .publish(OrchestrationEvent::TaskCancelled { task_id });
            tracing::info!(%task_id, "task cancelled");
        }
        cancelled
    }

    /// Fetch a snapshot of a task.
    pub async fn get_task(&self, task_id: Uuid) -> Option<ScheduledTask> {
        self.inner.tasks.read().await.get(&task_id).cloned()
    }

    /// Snapshots of all tasks, for inspection.
    pub async fn get_tasks(&self) -> Vec<ScheduledTask> {
        self.inner.tasks.read().await.values().cloned().collect()
    }

    /// Register a recurring cron job and its live trigger.
    pub async fn schedule_recurring_job(&self, request: JobRequest) -> SchedulerResult<Uuid> {
        let normalized = normalize_cron(&request.schedule)?;
        let now = self.inner.clock.now();
        let next_run = next_occurrence(&normalized, now)?;

        let job = RecurringJob {
            id: Uuid::new_v4(),
            name: request.name,
            schedule: request.schedule,
            timezone: request.timezone.unwrap_or_else(|| "UTC".to_string()),
            is_active: true,
            task_type: request.task_type,
            task_payload: request.task_payload,
            priority: request.priority,
            run_count: 0,
            last_run: None,
            next_run,
            max_retries: request.max_retries,
            created_at: now,
        };

        let job_id = job.id;
        let schedule = job.schedule.clone();
        self.inner.jobs.write().await.insert(job_id, job.clone());

        if let Err(e) = self.register_trigger(job_id, &normalized).await {
            self.inner.jobs.write().await.remove(&job_id);
            return Err(e);
        }

        self.inner
            .events
            .publish(OrchestrationEvent::RecurringJobScheduled { job_id, schedule });
        self.inner.persist_job(&job).await;

        tracing::info!(%job_id, name = %job.name, expr = %normalized, "recurring job scheduled");
        Ok(job_id)
    }

    /// Fire a recurring job once: fan out a fresh task from its template
    /// and update run bookkeeping. Guarded by `is_active`; a paused job is
    /// a no-op returning `None`.
    pub async fn execute_recurring_job(&self, job_id: Uuid) -> SchedulerResult<Option<Uuid>> {
        self.inner.execute_recurring_job(job_id).await
    }

    /// Remove a recurring job and its trigger.
    pub async fn cancel_recurring_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        let job = self
            .inner
            .jobs
            .write()
            .await
            .remove(&job_id)
            .ok_or(SchedulerError::RecurringJobNotFound(job_id))?;

        if job.is_active {
            self.inner.cron.unschedule(job_id).await?;
        }

        self.inner
            .events
            .publish(OrchestrationEvent::RecurringJobCancelled { job_id });
        tracing::info!(%job_id, "recurring job cancelled");
        Ok(())
    }

    /// Stop a recurring job's trigger without resetting its run count.
    pub async fn pause_recurring_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        let was_active = {
            let mut jobs = self.inner.jobs.write().await;
            let job = jobs
                .get_mut(&job_id)
                .ok_or(SchedulerError::RecurringJobNotFound(job_id))?;
            let was_active = job.is_active;
            job.is_active = false;
            was_active
        };

        if was_active {
            self.inner.cron.unschedule(job_id).await?;
        }

        self.inner
            .events
            .publish(OrchestrationEvent::RecurringJobPaused { job_id });
        tracing::info!(%job_id, "recurring job paused");
        Ok(())
    }

    /// Restart a paused recurring job's trigger. The run count continues
    /// where it left off.
    pub async fn resume_recurring_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        let reactivate = {
            let mut jobs = self.inner.jobs.write().await;
            let job = jobs
                .get_mut(&job_id)
                .ok_or(SchedulerError::RecurringJobNotFound(job_id))?;

            if job.is_active {
                None
            } else {
                job.is_active = true;
                let normalized = normalize_cron(&job.schedule)?;
                job.next_run = next_occurrence(&normalized, self.inner.clock.now())?;
                Some(normalized)
            }
        };

        if let Some(normalized) = reactivate {
            self.register_trigger(job_id, &normalized).await?;
        }

        self.inner
            .events
            .publish(OrchestrationEvent::RecurringJobResumed { job_id });
        tracing::info!(%job_id, "recurring job resumed");
        Ok(())
    }

    /// Fetch a snapshot of a recurring job.
    pub async fn get_recurring_job(&self, job_id: Uuid) -> Option<RecurringJob> {
        self.inner.jobs.read().await.get(&job_id).cloned()
    }

    /// Current scheduler metrics, with gauges computed from the registries.
    pub async fn metrics(&self) -> SchedulerMetrics {
        let pending = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .count();
        let active_jobs = self
            .inner
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.is_active)
            .count();

        let mut metrics = self.inner.metrics.lock().await.clone();
        metrics.pending_tasks = pending;
        metrics.active_jobs = active_jobs;
        metrics
    }

    /// Purge terminal tasks older than the retention window. Runs on the
    /// cleanup timer; callable directly for maintenance.
    pub async fn purge_expired(&self) -> usize {
        self.inner.purge_expired().await
    }

    /// Load persisted tasks and jobs: non-terminal tasks re-enter the
    /// queue, active jobs get their triggers re-registered.
    async fn restore(&self) {
        let Some(gateway) = &self.inner.persistence else {
            return;
        };
        let now = self.inner.clock.now();

        match gateway.load_tasks().await {
            Ok(loaded) if !loaded.is_empty() => {
                let mut requeue = Vec::new();
                {
                    let mut tasks = self.inner.tasks.write().await;
                    for mut task in loaded {
                        // A task interrupted mid-run gets another attempt
                        if task.status == TaskStatus::Running {
                            task.status = TaskStatus::Scheduled;
                            task.started_at = None;
                        }
                        if matches!(task.status, TaskStatus::Scheduled | TaskStatus::Retrying) {
                            requeue.push((
                                task.id,
                                task.scheduled_at.max(now),
                                task.priority.weight(),
                            ));
                        }
                        tasks.entry(task.id).or_insert(task);
                    }
                }

                tracing::info!(requeued = requeue.len(), "restored scheduled tasks");
                for (task_id, ready_at, weight) in requeue {
                    self.inner.queue.push(task_id, ready_at, weight).await;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load persisted tasks"),
        }

        match gateway.load_jobs().await {
            Ok(loaded) => {
                for mut job in loaded {
                    let normalized = match normalize_cron(&job.schedule) {
                        Ok(expr) => expr,
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, error = %e, "skipping job with bad schedule");
                            continue;
                        }
                    };

                    let job_id = job.id;
                    let active = job.is_active;
                    if active {
                        job.next_run = next_occurrence(&normalized, now).unwrap_or(None);
                    }
                    self.inner.jobs.write().await.insert(job_id, job);

                    if active {
                        if let Err(e) = self.register_trigger(job_id, &normalized).await {
                            tracing::warn!(%job_id, error = %e, "failed to re-register trigger");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load persisted jobs"),
        }
    }

    /// Wire a live cron trigger to `execute_recurring_job`.
    async fn register_trigger(&self, job_id: Uuid, normalized: &str) -> SchedulerResult<()> {
        let weak = Arc::downgrade(&self.inner);
        let callback: TriggerCallback = Arc::new(move |id| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.execute_recurring_job(id).await {
                    tracing::warn!(job_id = %id, error = %e, "recurring job fire failed");
                }
            })
        });

        self.inner.cron.schedule(job_id, normalized, callback).await
    }
}

impl SchedulerInner {
    async fn schedule_task(&self, request: TaskRequest) -> SchedulerResult<Uuid> {
        let now = self.clock.now();
        let scheduled_at = request.scheduled_at.unwrap_or_else(|| {
            now + chrono::Duration::milliseconds(self.config.default_delay_ms as i64)
        });

        let mut task = ScheduledTask::new(
            &request.task_type,
            request.payload,
            request.priority,
            scheduled_at,
            now,
        );
        task.max_retries = request.max_retries;

        let task_id = task.id;
        let task_type = task.task_type.clone();
        // Past schedule times run immediately, never with a negative delay
        let ready_at = scheduled_at.max(now);

        self.tasks.write().await.insert(task_id, task.clone());
        self.queue
            .push(task_id, ready_at, request.priority.weight())
            .await;

        self.metrics.lock().await.tasks_scheduled += 1;
        self.events.publish(OrchestrationEvent::TaskScheduled {
            task_id,
            task_type: task_type.clone(),
            scheduled_at,
        });
        self.persist_task(&task).await;

        tracing::debug!(
            %task_id,
            task_type = %task_type,
            priority = %request.priority,
            %scheduled_at,
            "task scheduled"
        );
        Ok(task_id)
    }

    async fn execute_recurring_job(&self, job_id: Uuid) -> SchedulerResult<Option<Uuid>> {
        let request = {
            let jobs = self.jobs.read().await;
            let job = jobs
                .get(&job_id)
                .ok_or(SchedulerError::RecurringJobNotFound(job_id))?;

            if !job.is_active {
                tracing::debug!(%job_id, "skipping fire of paused job");
                return Ok(None);
            }

            TaskRequest {
                task_type: job.task_type.clone(),
                payload: job.task_payload.clone(),
                priority: job.priority,
                scheduled_at: None,
                max_retries: job.max_retries,
            }
        };

        match self.schedule_task(request).await {
            Ok(task_id) => {
                let now = self.clock.now();
                let (run_count, snapshot) = {
                    let mut jobs = self.jobs.write().await;
                    match jobs.get_mut(&job_id) {
                        Some(job) => {
                            job.run_count += 1;
                            job.last_run = Some(now);
                            job.next_run = normalize_cron(&job.schedule)
                                .and_then(|expr| next_occurrence(&expr, now))
                                .unwrap_or(None);
                            (job.run_count, Some(job.clone()))
                        }
                        // Job was cancelled while the task was being queued
                        None => (0, None),
                    }
                };

                if let Some(job) = snapshot {
                    self.events.publish(OrchestrationEvent::RecurringJobExecuted {
                        job_id,
                        task_id,
                        run_count,
                    });
                    self.persist_job(&job).await;
                }

                Ok(Some(task_id))
            }
            Err(e) => {
                self.events.publish(OrchestrationEvent::RecurringJobFailed {
                    job_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Drain the queue, running up to `concurrency` tasks at once. A single
    /// task's failure never stops the pool; the loop ends when the
    /// scheduler is dropped or shut down.
    async fn dispatch_loop(weak: Weak<SchedulerInner>) {
        loop {
            let Some(inner) = weak.upgrade() else {
                break;
            };

            let now = inner.clock.now();
            if let Some(task_id) = inner.queue.pop_ready(now).await {
                let Ok(permit) = inner.workers.clone().acquire_owned().await else {
                    break;
                };
                let runner = inner.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    runner.run_task(task_id).await;
                });
                continue;
            }

            let wait = inner
                .queue
                .next_wakeup(now)
                .await
                .unwrap_or(DISPATCH_TICK)
                .min(DISPATCH_TICK);
            drop(inner);

            let Some(inner) = weak.upgrade() else {
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = inner.queue.notified() => {}
            }
        }

        tracing::debug!("task dispatcher stopped");
    }

    async fn run_task(&self, task_id: Uuid) {
        let task = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            // Cancelled (or otherwise settled) while queued
            if !matches!(task.status, TaskStatus::Scheduled | TaskStatus::Retrying) {
                return;
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(self.clock.now());
            task.clone()
        };

        tracing::debug!(%task_id, task_type = %task.task_type, "executing task");

        match self.registry.execute(&task).await {
            Ok(result) => self.finish_success(task_id, result).await,
            Err(SchedulerError::UnknownTaskType(task_type)) => {
                tracing::error!(%task_id, task_type = %task_type, "unknown task type");
                self.finish_failure(task_id, format!("Unknown task type: {task_type}"), false)
                    .await;
            }
            Err(e) => self.finish_failure(task_id, e.to_string(), true).await,
        }
    }

    async fn finish_success(&self, task_id: Uuid, result: serde_json::Value) {
        let outcome = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            // A cancellation that raced the handler wins; drop the result
            if task.status == TaskStatus::Cancelled {
                return;
            }

            let now = self.clock.now();
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            task.result = Some(result);
            task.error = None;

            let duration_ms = task
                .started_at
                .map(|s| now.signed_duration_since(s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            (duration_ms, task.clone())
        };

        let (duration_ms, task) = outcome;
        self.metrics.lock().await.record_completed(duration_ms);
        self.events.publish(OrchestrationEvent::TaskCompleted {
            task_id,
            duration_ms,
        });
        self.persist_task(&task).await;

        tracing::debug!(%task_id, duration_ms, "task completed");
    }

    async fn finish_failure(&self, task_id: Uuid, message: String, retryable: bool) {
        let mut events = Vec::new();
        let mut failed = false;
        let mut persist = None;

        {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            if task.status == TaskStatus::Cancelled {
                return;
            }

            let now = self.clock.now();
            let max_retries = task.max_retries.unwrap_or(self.config.max_retries);

            if retryable && task.retry_count < max_retries {
                task.retry_count += 1;
                task.status = TaskStatus::Retrying;
                task.error = Some(message.clone());

                let delay = backoff_delay(
                    self.config.backoff_strategy,
                    task.retry_count,
                    Duration::from_millis(self.config.retry_delay_ms),
                    Duration::from_millis(self.config.max_retry_delay_ms),
                );
                let ready_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());

                tracing::warn!(
                    %task_id,
                    attempt = task.retry_count,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "task failed, retry scheduled"
                );

                let weight = task.priority.weight();
                persist = Some(task.clone());
                drop(tasks);
                self.queue.push(task_id, ready_at, weight).await;
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(message.clone());
                task.completed_at = Some(now);
                failed = true;
                persist = Some(task.clone());

                tracing::error!(%task_id, error = %message, "task failed permanently");
                events.push(OrchestrationEvent::TaskFailed {
                    task_id,
                    error: message,
                });
            }
        }

        if failed {
            self.metrics.lock().await.tasks_failed += 1;
        }
        for event in events {
            self.events.publish(event);
        }
        if let Some(task) = persist {
            self.persist_task(&task).await;
        }
    }

    /// Periodic purge of terminal tasks past the retention window.
    async fn cleanup_loop(weak: Weak<SchedulerInner>) {
        loop {
            let interval = match weak.upgrade() {
                Some(inner) => Duration::from_millis(inner.config.cleanup_interval_ms),
                None => break,
            };

            tokio::time::sleep(interval).await;

            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.purge_expired().await;
        }
    }

    async fn purge_expired(&self) -> usize {
        let cutoff =
            self.clock.now() - chrono::Duration::milliseconds(self.config.retention_ms as i64);

        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| {
            !(task.status.is_terminal()
                && task.completed_at.map(|c| c < cutoff).unwrap_or(false))
        });
        let removed = before - tasks.len();

        if removed > 0 {
            tracing::info!(removed, "purged expired terminal tasks");
        }
        removed
    }

    async fn persist_task(&self, task: &ScheduledTask) {
        if let Some(gateway) = &self.persistence {
            if let Err(e) = gateway.save_task(task).await {
                tracing::warn!(task_id = %task.id, error = %e, "persistence write failed");
            }
        }
    }

    async fn persist_job(&self, job: &RecurringJob) {
        if let Some(gateway) = &self.persistence {
            if let Err(e) = gateway.save_job(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "persistence write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;
    use veriflow_types::{BackoffStrategy, CollaboratorError};

    use crate::handler::TaskHandler;

    struct RecordingHandler {
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        fn task_type(&self) -> &'static str {
            "record"
        }

        async fn execute(
            &self,
            task: &ScheduledTask,
        ) -> Result<serde_json::Value, CollaboratorError> {
            if let Some(ms) = task.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let label = task
                .payload
                .get("label")
                .and_then(|v| v.as_str())
                .unwrap_or("unlabelled")
                .to_string();
            self.log.lock().unwrap().push(label);
            Ok(serde_json::json!({"ok": true}))
        }
    }

    /// Fails the first `fail_first` attempts, then succeeds.
    struct FlakyHandler {
        attempts: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        fn task_type(&self) -> &'static str {
            "flaky"
        }

        async fn execute(
            &self,
            _task: &ScheduledTask,
        ) -> Result<serde_json::Value, CollaboratorError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                Err(CollaboratorError::ExecutionFailed(format!(
                    "attempt {attempt} failed"
                )))
            } else {
                Ok(serde_json::json!({"attempt": attempt}))
            }
        }
    }

    struct MockClock {
        now: std::sync::Mutex<DateTime<Utc>>,
    }

    impl MockClock {
        fn new() -> Self {
            Self {
                now: std::sync::Mutex::new(Utc::now()),
            }
        }

        fn advance(&self, delta: chrono::Duration) {
            *self.now.lock().unwrap() += delta;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn recording_registry(log: Arc<std::sync::Mutex<Vec<String>>>) -> TaskHandlerRegistry {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(RecordingHandler { log });
        registry
    }

    async fn wait_for_task_event(
        rx: &mut tokio::sync::broadcast::Receiver<OrchestrationEvent>,
        task_id: Uuid,
    ) -> OrchestrationEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event bus closed");
                match &event {
                    OrchestrationEvent::TaskCompleted { task_id: id, .. }
                    | OrchestrationEvent::TaskFailed { task_id: id, .. }
                        if *id == task_id =>
                    {
                        return event;
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("timed out waiting for task event")
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_schedule_task_runs_to_completion() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        let mut rx = scheduler.subscribe();
        let task_id = scheduler
            .schedule_task(TaskRequest::new("record", serde_json::json!({"label": "a"})))
            .await
            .unwrap();

        let event = wait_for_task_event(&mut rx, task_id).await;
        assert!(matches!(event, OrchestrationEvent::TaskCompleted { .. }));

        let task = scheduler.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.as_ref().unwrap()["ok"], true);
        assert_eq!(log.lock().unwrap().as_slice(), ["a"]);

        let metrics = scheduler.metrics().await;
        assert_eq!(metrics.tasks_scheduled, 1);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.pending_tasks, 0);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_past_scheduled_at_runs_immediately() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        let mut rx = scheduler.subscribe();
        let task_id = scheduler
            .schedule_task(
                TaskRequest::new("record", serde_json::json!({"label": "past"}))
                    .at(Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        // Delay is clamped to zero, not negative: the task runs right away
        let event = wait_for_task_event(&mut rx, task_id).await;
        assert!(matches!(event, OrchestrationEvent::TaskCompleted { .. }));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_task_semantics() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        // Far-future task can be cancelled exactly once
        let task_id = scheduler
            .schedule_task(
                TaskRequest::new("record", serde_json::json!({}))
                    .at(Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        assert!(scheduler.cancel_task(task_id).await);
        let task = scheduler.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completed_at.is_some());

        // Terminal and absent tasks are no-ops returning false
        assert!(!scheduler.cancel_task(task_id).await);
        assert!(!scheduler.cancel_task(Uuid::new_v4()).await);

        let mut rx = scheduler.subscribe();
        let done_id = scheduler
            .schedule_task(TaskRequest::new("record", serde_json::json!({})))
            .await
            .unwrap();
        wait_for_task_event(&mut rx, done_id).await;
        assert!(!scheduler.cancel_task(done_id).await);

        let metrics = scheduler.metrics().await;
        assert_eq!(metrics.tasks_cancelled, 1);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_orders_ready_tasks() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let config = SchedulerConfig {
            concurrency: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = TaskScheduler::new(config, recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        // Two blockers occupy the single worker and the dispatcher's
        // pre-claimed slot while the contested tasks queue up
        scheduler
            .schedule_task(TaskRequest::new(
                "record",
                serde_json::json!({"label": "blocker1", "sleep_ms": 250}),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler
            .schedule_task(TaskRequest::new(
                "record",
                serde_json::json!({"label": "blocker2", "sleep_ms": 250}),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler
            .schedule_task(
                TaskRequest::new("record", serde_json::json!({"label": "low"}))
                    .with_priority(Priority::Low),
            )
            .await
            .unwrap();
        scheduler
            .schedule_task(
                TaskRequest::new("record", serde_json::json!({"label": "critical"}))
                    .with_priority(Priority::Critical),
            )
            .await
            .unwrap();

        wait_until("all four tasks to run", || log.lock().unwrap().len() == 4).await;

        let order = log.lock().unwrap().clone();
        assert_eq!(order[0], "blocker1");
        // The critical task overtakes the low one even though it was
        // scheduled later
        assert_eq!(order[2], "critical");
        assert_eq!(order[3], "low");

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskHandlerRegistry::new();
        registry.register(FlakyHandler {
            attempts: attempts.clone(),
            fail_first: 2,
        });

        let config = SchedulerConfig {
            max_retries: 3,
            retry_delay_ms: 10,
            backoff_strategy: BackoffStrategy::Fixed,
            ..SchedulerConfig::default()
        };
        let scheduler = TaskScheduler::new(config, registry);
        scheduler.start().await.unwrap();

        let mut rx = scheduler.subscribe();
        let task_id = scheduler
            .schedule_task(TaskRequest::new("flaky", serde_json::json!({})))
            .await
            .unwrap();

        let event = wait_for_task_event(&mut rx, task_id).await;
        assert!(matches!(event, OrchestrationEvent::TaskCompleted { .. }));

        let task = scheduler.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_task() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskHandlerRegistry::new();
        registry.register(FlakyHandler {
            attempts: attempts.clone(),
            fail_first: usize::MAX,
        });

        let config = SchedulerConfig {
            max_retries: 2,
            retry_delay_ms: 10,
            backoff_strategy: BackoffStrategy::Fixed,
            ..SchedulerConfig::default()
        };
        let scheduler = TaskScheduler::new(config, registry);
        scheduler.start().await.unwrap();

        let mut rx = scheduler.subscribe();
        let task_id = scheduler
            .schedule_task(TaskRequest::new("flaky", serde_json::json!({})))
            .await
            .unwrap();

        let event = wait_for_task_event(&mut rx, task_id).await;
        match event {
            OrchestrationEvent::TaskFailed { error, .. } => assert!(!error.is_empty()),
            other => panic!("expected taskFailed, got {other:?}"),
        }

        // Initial attempt plus max_retries retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let task = scheduler.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert!(task.error.is_some());

        let metrics = scheduler.metrics().await;
        assert_eq!(metrics.tasks_failed, 1);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_task_type_fails_without_retry() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        let mut rx = scheduler.subscribe();
        let bogus_id = scheduler
            .schedule_task(TaskRequest::new("send_fax", serde_json::json!({})))
            .await
            .unwrap();

        let event = wait_for_task_event(&mut rx, bogus_id).await;
        match event {
            OrchestrationEvent::TaskFailed { error, .. } => {
                assert!(error.contains("Unknown task type"));
            }
            other => panic!("expected taskFailed, got {other:?}"),
        }

        let task = scheduler.get_task(bogus_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);

        // The pool is unaffected: a valid task still runs
        let valid_id = scheduler
            .schedule_task(TaskRequest::new("record", serde_json::json!({"label": "ok"})))
            .await
            .unwrap();
        let event = wait_for_task_event(&mut rx, valid_id).await;
        assert!(matches!(event, OrchestrationEvent::TaskCompleted { .. }));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recurring_job_fanout_and_bookkeeping() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        // Hourly schedule: never fires on its own during the test
        let job_id = scheduler
            .schedule_recurring_job(JobRequest {
                name: "evidence_sweep".to_string(),
                schedule: "0 0 * * * *".to_string(),
                timezone: None,
                task_type: "record".to_string(),
                task_payload: serde_json::json!({"label": "sweep"}),
                priority: Priority::High,
                max_retries: None,
            })
            .await
            .unwrap();

        let job = scheduler.get_recurring_job(job_id).await.unwrap();
        assert!(job.is_active);
        assert_eq!(job.run_count, 0);
        assert_eq!(job.timezone, "UTC");
        let next_run = job.next_run.expect("next_run computed at registration");
        assert!(next_run > Utc::now());

        // Three fires create three distinct tasks from the template
        for _ in 0..3 {
            let task_id = scheduler.execute_recurring_job(job_id).await.unwrap();
            assert!(task_id.is_some());
        }

        let job = scheduler.get_recurring_job(job_id).await.unwrap();
        assert_eq!(job.run_count, 3);
        assert!(job.last_run.is_some());

        let sweep_tasks: Vec<_> = scheduler
            .get_tasks()
            .await
            .into_iter()
            .filter(|t| t.task_type == "record")
            .collect();
        assert_eq!(sweep_tasks.len(), 3);
        assert!(sweep_tasks.iter().all(|t| t.priority == Priority::High));

        // Pause halts fires without resetting the counter
        scheduler.pause_recurring_job(job_id).await.unwrap();
        let skipped = scheduler.execute_recurring_job(job_id).await.unwrap();
        assert!(skipped.is_none());
        assert_eq!(
            scheduler.get_recurring_job(job_id).await.unwrap().run_count,
            3
        );

        // Resume continues from where it left off
        scheduler.resume_recurring_job(job_id).await.unwrap();
        scheduler.execute_recurring_job(job_id).await.unwrap();
        assert_eq!(
            scheduler.get_recurring_job(job_id).await.unwrap().run_count,
            4
        );

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recurring_job_live_cron_fires() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        let job_id = scheduler
            .schedule_recurring_job(JobRequest {
                name: "heartbeat".to_string(),
                schedule: "* * * * * *".to_string(),
                timezone: None,
                task_type: "record".to_string(),
                task_payload: serde_json::json!({"label": "tick"}),
                priority: Priority::Medium,
                max_retries: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2200)).await;
        scheduler.pause_recurring_job(job_id).await.unwrap();
        // Let any fire already in flight settle before reading counters
        tokio::time::sleep(Duration::from_millis(200)).await;

        let job = scheduler.get_recurring_job(job_id).await.unwrap();
        assert!(
            (1..=3).contains(&job.run_count),
            "expected 1-3 fires in the window, got {}",
            job.run_count
        );

        // Each fire created one task from the template
        let ticks = scheduler
            .get_tasks()
            .await
            .into_iter()
            .filter(|t| t.task_type == "record")
            .count();
        assert_eq!(ticks as u64, job.run_count);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_recurring_job() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        let job_id = scheduler
            .schedule_recurring_job(JobRequest {
                name: "doomed".to_string(),
                schedule: "0 0 * * * *".to_string(),
                timezone: None,
                task_type: "record".to_string(),
                task_payload: serde_json::json!({}),
                priority: Priority::Medium,
                max_retries: None,
            })
            .await
            .unwrap();

        scheduler.cancel_recurring_job(job_id).await.unwrap();
        assert!(scheduler.get_recurring_job(job_id).await.is_none());

        let result = scheduler.execute_recurring_job(job_id).await;
        assert!(matches!(
            result,
            Err(SchedulerError::RecurringJobNotFound(_))
        ));

        // Cancelling twice fails the same way
        let result = scheduler.cancel_recurring_job(job_id).await;
        assert!(matches!(
            result,
            Err(SchedulerError::RecurringJobNotFound(_))
        ));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let scheduler =
            TaskScheduler::new(SchedulerConfig::default(), recording_registry(log.clone()));
        scheduler.start().await.unwrap();

        let result = scheduler
            .schedule_recurring_job(JobRequest {
                name: "broken".to_string(),
                schedule: "whenever".to_string(),
                timezone: None,
                task_type: "record".to_string(),
                task_payload: serde_json::json!({}),
                priority: Priority::Medium,
                max_retries: None,
            })
            .await;

        assert!(matches!(result, Err(SchedulerError::InvalidSchedule(_))));
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_purges_only_old_terminal_tasks() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let clock = Arc::new(MockClock::new());
        let scheduler = TaskScheduler::with_collaborators(
            SchedulerConfig::default(),
            recording_registry(log.clone()),
            clock.clone(),
            None,
        );
        scheduler.start().await.unwrap();

        let mut rx = scheduler.subscribe();
        let old_id = scheduler
            .schedule_task(TaskRequest::new("record", serde_json::json!({"label": "old"})))
            .await
            .unwrap();
        wait_for_task_event(&mut rx, old_id).await;

        // A day and an hour later the old task is past retention
        clock.advance(chrono::Duration::hours(25));

        let fresh_id = scheduler
            .schedule_task(TaskRequest::new(
                "record",
                serde_json::json!({"label": "fresh"}),
            ))
            .await
            .unwrap();
        wait_for_task_event(&mut rx, fresh_id).await;

        let removed = scheduler.purge_expired().await;
        assert_eq!(removed, 1);
        assert!(scheduler.get_task(old_id).await.is_none());
        assert!(scheduler.get_task(fresh_id).await.is_some());

        scheduler.shutdown().await.unwrap();
    }
    struct SeededStore {
        tasks: Vec<ScheduledTask>,
    }

    #[async_trait]
    impl PersistenceGateway for SeededStore {
        async fn save_instance(
            &self,
            _instance: &veriflow_types::WorkflowInstance,
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn save_task(&self, _task: &ScheduledTask) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn save_job(&self, _job: &RecurringJob) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn load_tasks(&self) -> Result<Vec<ScheduledTask>, CollaboratorError> {
            Ok(self.tasks.clone())
        }
    }

    #[tokio::test]
    async fn test_restore_requeues_persisted_tasks() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let past = Utc::now() - chrono::Duration::minutes(5);
        let task = ScheduledTask::new(
            "record",
            serde_json::json!({"label": "revived"}),
            Priority::Medium,
            past,
            past,
        );

        let store = SeededStore {
            tasks: vec![task.clone()],
        };
        let scheduler = TaskScheduler::with_collaborators(
            SchedulerConfig::default(),
            recording_registry(log.clone()),
            Arc::new(SystemClock),
            Some(Arc::new(store)),
        );

        let mut rx = scheduler.subscribe();
        scheduler.start().await.unwrap();

        let event = wait_for_task_event(&mut rx, task.id).await;
        assert!(matches!(event, OrchestrationEvent::TaskCompleted { .. }));

        let revived = scheduler.get_task(task.id).await.unwrap();
        assert_eq!(revived.status, TaskStatus::Completed);
        assert_eq!(log.lock().unwrap().as_slice(), ["revived"]);

        scheduler.shutdown().await.unwrap();
    }
}

