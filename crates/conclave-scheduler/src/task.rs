//! Background task model
//!
//! A [`BackgroundTask`] wraps an opaque async work unit. While it runs, the
//! work sees a [`TaskContext`] for progress reporting and cooperative
//! cancellation; when it ends the runner records an immutable [`TaskResult`].

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// What a background task does, for listings and logs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Indexing,
    Embedding,
    Sync,
    Maintenance,
    Custom(String),
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Indexing => write!(f, "indexing"),
            Self::Embedding => write!(f, "embedding"),
            Self::Sync => write!(f, "sync"),
            Self::Maintenance => write!(f, "maintenance"),
            Self::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Lifecycle: Pending -> Running -> {Completed, Cancelled, Failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Latest progress reported by a running task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub phase: String,
    pub current: u64,
    pub total: u64,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskProgress {
    /// Completed share in `[0, 1]`, or `None` when the total is unknown
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.current as f64 / self.total as f64).min(1.0))
    }
}

/// Terminal record of a task; never changes once stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    /// `None` when the task was cancelled before it started
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Delivered to a task's progress observer
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Progress(TaskProgress),
    Finished(TaskResult),
}

/// Callback registered with `observe_progress`
pub type ProgressObserver = Arc<dyn Fn(&TaskUpdate) + Send + Sync>;

/// Snapshot of a pending or running task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: Option<TaskProgress>,
}

pub(crate) type ProgressSink = Arc<dyn Fn(&str, TaskProgress) + Send + Sync>;

/// Handle given to a running work unit
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    cancel: CancellationToken,
    sink: ProgressSink,
}

impl TaskContext {
    pub(crate) fn new(task_id: String, cancel: CancellationToken, sink: ProgressSink) -> Self {
        Self {
            task_id,
            cancel,
            sink,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn report_progress(
        &self,
        phase: impl Into<String>,
        current: u64,
        total: u64,
        message: Option<String>,
    ) {
        let progress = TaskProgress {
            phase: phase.into(),
            current,
            total,
            message,
            updated_at: Utc::now(),
        };
        (self.sink)(&self.task_id, progress);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

pub(crate) type TaskWork =
    Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// A unit of long-running work waiting to be submitted
pub struct BackgroundTask {
    pub name: String,
    pub kind: TaskKind,
    pub(crate) work: TaskWork,
}

impl BackgroundTask {
    pub fn new<F, Fut>(name: impl Into<String>, kind: TaskKind, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind,
            work: Box::new(move |ctx| Box::pin(work(ctx))),
        }
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
