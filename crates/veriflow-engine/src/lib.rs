//! Veriflow Workflow Engine
//!
//! Stateful execution engine for multi-step compliance processes:
//!
//! - **Engine**: owns workflow instances, runs the step state machine, and
//!   exposes lifecycle control (start/pause/resume/cancel)
//! - **Executor**: dispatches a single step to its type handler (task,
//!   approval, notification, condition, parallel, delay)
//! - **Condition**: fixed, safe interpreter for declarative conditions
//! - **Queue processing**: an intent channel drained under a global
//!   concurrency ceiling; retries re-enter the queue after a delay
//!
//! External work (task execution, approvals, notification delivery,
//! persistence) is reached exclusively through the collaborator traits in
//! `veriflow-types`; the engine itself is fully in-memory.

pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;

pub use condition::ConditionEvaluator;
pub use config::EngineConfig;
pub use engine::{StartOptions, WorkflowEngine};
pub use error::{EngineError, EngineResult};
pub use executor::StepExecutor;
pub use metrics::EngineMetrics;
