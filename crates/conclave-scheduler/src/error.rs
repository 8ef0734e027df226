//! Runner error types

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    /// The wait gave up; the task itself keeps running
    #[error("Timed out after {timeout:?} waiting for task {task_id}")]
    WaitTimeout { task_id: String, timeout: Duration },

    #[error("Task {task_id} failed: {error}")]
    Failed { task_id: String, error: String },
}
