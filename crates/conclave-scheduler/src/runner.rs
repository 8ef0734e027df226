//! Bounded-concurrency background task runner
//!
//! Tasks start in FIFO order under a semaphore sized to the concurrency
//! limit. A single drain task dequeues work as permits free up; each running
//! task holds its permit until its result has been recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::task::{
    BackgroundTask, ProgressObserver, ProgressSink, TaskContext, TaskInfo, TaskKind,
    TaskProgress, TaskResult, TaskStatus, TaskUpdate, TaskWork,
};

/// Configuration for the task runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of tasks running at once
    pub max_concurrent_tasks: usize,

    /// Terminal results kept in memory; oldest evicted first
    pub max_completed_tasks: usize,

    /// How often `submit_and_wait` checks for a result
    pub poll_interval: Duration,

    /// Deadline for `submit_and_wait` when the caller gives none
    pub default_wait_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_completed_tasks: 100,
            poll_interval: Duration::from_millis(100),
            default_wait_timeout: Duration::from_secs(3600),
        }
    }
}

/// A submitted task that has not finished yet
struct TaskEntry {
    name: String,
    kind: TaskKind,
    status: TaskStatus,
    progress: Option<TaskProgress>,
    cancel: CancellationToken,
    /// Taken when the task starts
    work: Option<TaskWork>,
    started_at: Option<chrono::DateTime<Utc>>,
    seq: u64,
}

#[derive(Default)]
struct State {
    /// Pending and running tasks
    tasks: HashMap<String, TaskEntry>,
    queue: VecDeque<String>,
    completed: HashMap<String, TaskResult>,
    observers: HashMap<String, ProgressObserver>,
    /// `submit_and_wait` callers, answered before the completed set is pruned
    waiters: HashMap<String, oneshot::Sender<TaskResult>>,
    draining: bool,
    next_seq: u64,
}

/// Observer still to be notified once the state lock is released
type Notification = (ProgressObserver, TaskUpdate);

impl State {
    /// Move a task to the completed set and prune it to `max_completed`
    fn finish(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        output: Option<Value>,
        error: Option<String>,
        max_completed: usize,
    ) -> (TaskResult, Option<Notification>) {
        let started_at = self.tasks.remove(task_id).and_then(|entry| entry.started_at);
        let result = TaskResult {
            task_id: task_id.to_string(),
            status,
            output,
            started_at,
            completed_at: Utc::now(),
            error,
        };
        self.completed.insert(task_id.to_string(), result.clone());
        if let Some(waiter) = self.waiters.remove(task_id) {
            let _ = waiter.send(result.clone());
        }

        while self.completed.len() > max_completed {
            let oldest = self
                .completed
                .values()
                .min_by_key(|r| r.completed_at)
                .map(|r| r.task_id.clone());
            match oldest {
                Some(id) => {
                    debug!("Evicting completed task {}", id);
                    self.completed.remove(&id);
                }
                None => break,
            }
        }

        let notification = self
            .observers
            .remove(task_id)
            .map(|observer| (observer, TaskUpdate::Finished(result.clone())));
        (result, notification)
    }

    fn finish_cancelled_pending(&mut self, task_id: &str, max_completed: usize) -> Option<Notification> {
        self.queue.retain(|id| id != task_id);
        let (_, notification) = self.finish(
            task_id,
            TaskStatus::Cancelled,
            None,
            Some("cancelled before start".to_string()),
            max_completed,
        );
        notification
    }
}

fn notify(notifications: impl IntoIterator<Item = Notification>) {
    for (observer, update) in notifications {
        observer(&update);
    }
}

struct Inner {
    config: RunnerConfig,
    state: Mutex<State>,
    slots: Arc<Semaphore>,
    /// Parent of every task's cancellation token
    shutdown_token: CancellationToken,
}

impl Inner {
    /// Start the drain task unless one is already running
    fn kick(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.draining || state.queue.is_empty() {
                return;
            }
            state.draining = true;
        }
        tokio::spawn(Arc::clone(self).drain());
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Task slots closed, stopping queue processing");
                    self.state.lock().draining = false;
                    return;
                }
            };

            let mut notifications = Vec::new();
            let next = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                loop {
                    let Some(id) = state.queue.pop_front() else {
                        state.draining = false;
                        break None;
                    };
                    let Some(entry) = state.tasks.get_mut(&id) else {
                        continue;
                    };
                    if entry.cancel.is_cancelled() {
                        let max = self.config.max_completed_tasks;
                        notifications.extend(state.finish_cancelled_pending(&id, max));
                        continue;
                    }
                    let Some(work) = entry.work.take() else {
                        continue;
                    };
                    entry.status = TaskStatus::Running;
                    entry.started_at = Some(Utc::now());
                    info!("Starting task {} ({}, {})", id, entry.name, entry.kind);
                    break Some((id, work, entry.cancel.clone()));
                }
            };
            notify(notifications);

            let Some((task_id, work, cancel)) = next else {
                return;
            };
            let ctx = TaskContext::new(task_id.clone(), cancel.clone(), self.progress_sink());
            tokio::spawn(Arc::clone(&self).execute(task_id, work, ctx, cancel, permit));
        }
    }

    async fn execute(
        self: Arc<Self>,
        task_id: String,
        work: TaskWork,
        ctx: TaskContext,
        cancel: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        // Panics surface as join errors
        let outcome = tokio::spawn(work(ctx)).await;

        let (status, output, error) = match outcome {
            Ok(Ok(output)) => (TaskStatus::Completed, Some(output), None),
            Ok(Err(e)) if cancel.is_cancelled() => {
                (TaskStatus::Cancelled, None, Some(format!("{:#}", e)))
            }
            Ok(Err(e)) => (TaskStatus::Failed, None, Some(format!("{:#}", e))),
            Err(join_error) => (
                TaskStatus::Failed,
                None,
                Some(format!("task panicked: {}", join_error)),
            ),
        };

        match (&status, &error) {
            (TaskStatus::Failed, Some(error)) => warn!("Task {} failed: {}", task_id, error),
            _ => info!("Task {} {}", task_id, status),
        }

        let (_, notification) = self.state.lock().finish(
            &task_id,
            status,
            output,
            error,
            self.config.max_completed_tasks,
        );
        notify(notification);
        // permit released here, after the result is visible
    }

    fn progress_sink(self: &Arc<Self>) -> ProgressSink {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |task_id: &str, progress: TaskProgress| {
            if let Some(inner) = weak.upgrade() {
                inner.record_progress(task_id, progress);
            }
        })
    }

    fn record_progress(&self, task_id: &str, progress: TaskProgress) {
        let observer = {
            let mut state = self.state.lock();
            match state.tasks.get_mut(task_id) {
                Some(entry) => entry.progress = Some(progress.clone()),
                None => return,
            }
            state.observers.get(task_id).cloned()
        };
        debug!(
            "Task {} progress: {} {}/{} ({:.0}%)",
            task_id,
            progress.phase,
            progress.current,
            progress.total,
            progress.fraction().unwrap_or(0.0) * 100.0
        );
        if let Some(observer) = observer {
            observer(&TaskUpdate::Progress(progress));
        }
    }
}

/// Runs submitted background tasks with bounded concurrency
pub struct BackgroundTaskRunner {
    inner: Arc<Inner>,
}

impl Default for BackgroundTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTaskRunner {
    pub fn new() -> Self {
        Self::with_config(RunnerConfig::default())
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                slots,
                shutdown_token: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Queue a task and return its id immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, task: BackgroundTask) -> String {
        self.enqueue(task, None)
    }

    fn enqueue(&self, task: BackgroundTask, waiter: Option<oneshot::Sender<TaskResult>>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.inner.state.lock();
            if let Some(waiter) = waiter {
                state.waiters.insert(id.clone(), waiter);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(
                id.clone(),
                TaskEntry {
                    name: task.name.clone(),
                    kind: task.kind.clone(),
                    status: TaskStatus::Pending,
                    progress: None,
                    cancel: self.inner.shutdown_token.child_token(),
                    work: Some(task.work),
                    started_at: None,
                    seq,
                },
            );
            state.queue.push_back(id.clone());
        }
        info!("Submitted task {} ({}, {})", id, task.name, task.kind);
        self.inner.kick();
        id
    }

    /// Submit a task and wait for its terminal result.
    ///
    /// Completed and cancelled results are returned as `Ok`; a failed task
    /// becomes `TaskError::Failed`. Giving up after `timeout` (or the
    /// configured default) does not stop the task.
    pub async fn submit_and_wait(
        &self,
        task: BackgroundTask,
        timeout: Option<Duration>,
    ) -> Result<TaskResult, TaskError> {
        let (tx, mut rx) = oneshot::channel();
        let task_id = self.enqueue(task, Some(tx));
        let timeout = timeout.unwrap_or(self.inner.config.default_wait_timeout);
        let deadline = Instant::now() + timeout;
        let mut sender_gone = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                self.inner.state.lock().waiters.remove(&task_id);
                debug!("Gave up waiting for task {}", task_id);
                return Err(TaskError::WaitTimeout { task_id, timeout });
            }

            tokio::select! {
                received = &mut rx, if !sender_gone => match received {
                    Ok(result) => return Self::wait_outcome(result),
                    Err(_) => sender_gone = true,
                },
                _ = tokio::time::sleep(self.inner.config.poll_interval.min(deadline - now)) => {}
            }

            // Fallback in case the waiter was dropped
            if let Some(result) = self.get_result(&task_id) {
                return Self::wait_outcome(result);
            }
        }
    }

    fn wait_outcome(result: TaskResult) -> Result<TaskResult, TaskError> {
        match result.status {
            TaskStatus::Failed => Err(TaskError::Failed {
                task_id: result.task_id,
                error: result.error.unwrap_or_default(),
            }),
            _ => Ok(result),
        }
    }

    pub fn get_status(&self, task_id: &str) -> Option<TaskStatus> {
        let state = self.inner.state.lock();
        state
            .tasks
            .get(task_id)
            .map(|entry| entry.status)
            .or_else(|| state.completed.get(task_id).map(|result| result.status))
    }

    /// Latest progress of a pending or running task
    pub fn get_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.inner
            .state
            .lock()
            .tasks
            .get(task_id)
            .and_then(|entry| entry.progress.clone())
    }

    /// Terminal result, while it is retained
    pub fn get_result(&self, task_id: &str) -> Option<TaskResult> {
        self.inner.state.lock().completed.get(task_id).cloned()
    }

    /// Request cancellation.
    ///
    /// A pending task is dropped from the queue and recorded cancelled at
    /// once. A running task is marked cancelled and must observe its token to
    /// stop. Returns `Ok(false)` if the task had already finished.
    pub fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let notification = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let status = match state.tasks.get_mut(task_id) {
                Some(entry) => {
                    entry.cancel.cancel();
                    let previous = entry.status;
                    entry.status = TaskStatus::Cancelled;
                    previous
                }
                None if state.completed.contains_key(task_id) => return Ok(false),
                None => return Err(TaskError::NotFound(task_id.to_string())),
            };
            info!("Cancelling task {} ({})", task_id, status);
            if status == TaskStatus::Pending {
                state.finish_cancelled_pending(task_id, self.inner.config.max_completed_tasks)
            } else {
                None
            }
        };
        notify(notification);
        Ok(true)
    }

    /// Pending and running tasks in submission order
    pub fn list_active_tasks(&self) -> Vec<TaskInfo> {
        let state = self.inner.state.lock();
        let mut entries: Vec<(&String, &TaskEntry)> = state.tasks.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(id, entry)| TaskInfo {
                id: id.clone(),
                name: entry.name.clone(),
                kind: entry.kind.clone(),
                status: entry.status,
                progress: entry.progress.clone(),
            })
            .collect()
    }

    /// Retained results, newest first
    pub fn list_completed_tasks(&self, limit: Option<usize>) -> Vec<TaskResult> {
        let mut results: Vec<TaskResult> =
            self.inner.state.lock().completed.values().cloned().collect();
        results.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        results
    }

    /// Register the single progress observer for a task, replacing any previous one.
    ///
    /// The observer sees every later progress report and then the terminal
    /// result, after which it is dropped. For a task that already finished it
    /// is called once with the result.
    pub fn observe_progress(
        &self,
        task_id: &str,
        observer: ProgressObserver,
    ) -> Result<(), TaskError> {
        let finished = {
            let mut state = self.inner.state.lock();
            if state.tasks.contains_key(task_id) {
                state.observers.insert(task_id.to_string(), observer);
                return Ok(());
            }
            match state.completed.get(task_id) {
                Some(result) => result.clone(),
                None => return Err(TaskError::NotFound(task_id.to_string())),
            }
        };
        observer(&TaskUpdate::Finished(finished));
        Ok(())
    }

    /// Tasks currently executing
    pub fn running_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|entry| entry.started_at.is_some())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Cancel everything: pending tasks are recorded cancelled, running ones are signalled
    pub fn shutdown(&self) {
        info!("Shutting down task runner");
        self.inner.shutdown_token.cancel();

        let notifications: Vec<Notification> = {
            let mut state = self.inner.state.lock();
            let pending: Vec<String> = state.queue.iter().cloned().collect();
            let max = self.inner.config.max_completed_tasks;
            for entry in state.tasks.values_mut() {
                entry.status = TaskStatus::Cancelled;
            }
            pending
                .iter()
                .filter_map(|id| state.finish_cancelled_pending(id, max))
                .collect()
        };
        notify(notifications);
    }
}
