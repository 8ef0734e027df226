//! conclave-scheduler - Background task runner
//!
//! This crate provides a bounded-concurrency runner for long jobs such as
//! indexing or embedding. Tasks start in submission order, report progress,
//! can be cancelled cooperatively and leave a capped history of results.

pub mod error;
pub mod runner;
pub mod task;

pub use error::TaskError;
pub use runner::{BackgroundTaskRunner, RunnerConfig};
pub use task::{
    BackgroundTask, ProgressObserver, TaskContext, TaskInfo, TaskKind, TaskProgress, TaskResult,
    TaskStatus, TaskUpdate,
};
