//! Veriflow Task Scheduler
//!
//! Priority worker pool with one-off and cron-recurring task scheduling:
//!
//! - **Scheduler**: owns scheduled tasks and recurring jobs, exposes the
//!   schedule/cancel/pause/resume surface
//! - **Queue**: delay-aware priority queue feeding the bounded worker pool
//! - **Handlers**: task-type registry the pool dispatches through; an
//!   unknown task type fails that task without touching the pool
//! - **Cron**: live triggers via `tokio-cron-scheduler`, next-fire-time
//!   computation via `croner`
//! - **Backoff**: fixed, exponential, and linear retry delays
//!
//! Terminal tasks are purged by a periodic cleanup timer after a retention
//! window (24 hours by default).

pub mod backoff;
pub mod config;
pub mod cron;
pub mod error;
pub mod handler;
pub mod queue;
pub mod scheduler;

pub use backoff::backoff_delay;
pub use config::SchedulerConfig;
pub use cron::{next_occurrence, normalize_cron, CronTrigger, TriggerCallback};
pub use error::{SchedulerError, SchedulerResult};
pub use handler::{TaskHandler, TaskHandlerRegistry};
pub use queue::TaskQueue;
pub use scheduler::{JobRequest, SchedulerMetrics, TaskRequest, TaskScheduler};
