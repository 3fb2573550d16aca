//! Cron trigger capability wrapping `tokio-cron-scheduler`.
//!
//! Recurring jobs register a live trigger here; `croner` computes the next
//! fire time for bookkeeping. Expressions are normalized to the 6-field
//! (with seconds) form the trigger backend expects.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};

/// Callback invoked with the owning job id each time a trigger fires.
pub type TriggerCallback = Arc<dyn Fn(Uuid) -> BoxFuture<'static, ()> + Send + Sync>;

/// Normalize a cron expression to the 6-field form (with seconds).
///
/// 5-field expressions get a `0` seconds field prepended; 6-field
/// expressions pass through. Anything else is rejected.
pub fn normalize_cron(expr: &str) -> SchedulerResult<String> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();

    match fields {
        5 => Ok(format!("0 {trimmed}")),
        6 => Ok(trimmed.to_string()),
        _ => Err(SchedulerError::InvalidSchedule(format!(
            "expected 5 or 6 cron fields, got {fields}: '{trimmed}'"
        ))),
    }
}

/// Compute the next occurrence of a normalized cron expression after the
/// given instant.
pub fn next_occurrence(
    normalized: &str,
    after: DateTime<Utc>,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    let cron = normalized
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

    Ok(cron.iter_after(after).next())
}

struct TriggerEntry {
    /// Job guid assigned by tokio-cron-scheduler.
    guid: Uuid,
    expr: String,
}

/// Live cron triggers keyed by recurring-job id.
pub struct CronTrigger {
    inner: RwLock<Option<JobScheduler>>,
    triggers: RwLock<HashMap<Uuid, TriggerEntry>>,
}

impl CronTrigger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
            triggers: RwLock::new(HashMap::new()),
        }
    }

    /// Start the trigger backend. Must be called before scheduling.
    pub async fn start(&self) -> SchedulerResult<()> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Trigger(e.to_string()))?;

        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Trigger(e.to_string()))?;

        let mut inner = self.inner.write().await;
        *inner = Some(scheduler);

        tracing::debug!("cron trigger backend started");
        Ok(())
    }

    /// Stop the backend and drop all triggers.
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(mut scheduler) = inner.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::Trigger(e.to_string()))?;
            tracing::debug!("cron trigger backend stopped");
        }
        self.triggers.write().await.clear();
        Ok(())
    }

    /// Register a trigger for a job. The callback fires on every cron match
    /// until the trigger is unscheduled.
    pub async fn schedule(
        &self,
        job_id: Uuid,
        normalized_expr: &str,
        callback: TriggerCallback,
    ) -> SchedulerResult<()> {
        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::Trigger("trigger backend not started".to_string()))?;

        let job = Job::new_async(normalized_expr, move |_uuid, _lock| {
            let cb = callback.clone();
            Box::pin(async move {
                tracing::debug!(%job_id, "cron trigger fired");
                cb(job_id).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let guid = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Trigger(e.to_string()))?;

        self.triggers.write().await.insert(
            job_id,
            TriggerEntry {
                guid,
                expr: normalized_expr.to_string(),
            },
        );

        tracing::info!(%job_id, expr = %normalized_expr, "cron trigger registered");
        Ok(())
    }

    /// Remove a job's trigger.
    pub async fn unschedule(&self, job_id: Uuid) -> SchedulerResult<()> {
        let entry = self
            .triggers
            .write()
            .await
            .remove(&job_id)
            .ok_or(SchedulerError::RecurringJobNotFound(job_id))?;

        let inner = self.inner.read().await;
        if let Some(scheduler) = inner.as_ref() {
            scheduler
                .remove(&entry.guid)
                .await
                .map_err(|e| SchedulerError::Trigger(e.to_string()))?;
        }

        tracing::info!(%job_id, expr = %entry.expr, "cron trigger removed");
        Ok(())
    }

    /// Number of registered triggers.
    pub async fn trigger_count(&self) -> usize {
        self.triggers.read().await.len()
    }
}

impl Default for CronTrigger {
    fn default() -> Self {
        Self::new()
    }
}
