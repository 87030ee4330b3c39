//! Task handles
//!
//! Every submission is split into two halves joined by a oneshot channel:
//! - [`TaskHandle`] stays with the submitter and is awaited for the outcome
//! - [`PendingTask`] sits in the scheduler queue until a tick dispatches it
//!
//! The oneshot sender is consumed on completion, so an outcome is delivered
//! at most once and there is only ever one waiter.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Arrival index of a task within its scheduler (0-based)
pub type TaskId = u64;

/// Why a submitted task produced no value
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// The callable returned an error; it is handed back untouched
    #[error("{0}")]
    Failed(E),

    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The task was dropped before it could run (scheduler dropped or runtime shut down)
    #[error("Task was dropped before it ran")]
    Abandoned,
}

impl<E> TaskError<E> {
    /// Check if the callable itself returned an error
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskError::Failed(_))
    }

    /// Take the callable's own error, if that is what happened
    pub fn into_failed(self) -> Option<E> {
        match self {
            TaskError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// How a dispatched task finished, as seen by the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Panicked,
    Abandoned,
}

type Outcome<T, E> = Result<T, TaskError<E>>;
type RunFn = Box<dyn FnOnce() -> BoxFuture<'static, TaskStatus> + Send>;

/// Waiting half of a submission
pub struct TaskHandle<T, E> {
    id: TaskId,
    rx: oneshot::Receiver<Outcome<T, E>>,
}

impl<T, E> TaskHandle<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wrap an async callable, returning the waiting and dispatch halves
    pub fn create<F, Fut>(id: TaskId, callable: F) -> (Self, PendingTask)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        debug!(task_id = id, "TaskHandle::create: called");
        let (tx, rx) = oneshot::channel();

        let run: RunFn = Box::new(move || -> BoxFuture<'static, TaskStatus> {
            Box::pin(async move {
                // Own task so a panic in the callable surfaces as a JoinError
                let joined = tokio::spawn(async move { callable().await }).await;
                complete(id, tx, joined)
            })
        });

        (Self { id, rx }, PendingTask::new(id, run))
    }

    /// Wrap a synchronous callable; it runs on the blocking pool when dispatched
    pub fn create_blocking<F>(id: TaskId, callable: F) -> (Self, PendingTask)
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        debug!(task_id = id, "TaskHandle::create_blocking: called");
        let (tx, rx) = oneshot::channel();

        let run: RunFn = Box::new(move || -> BoxFuture<'static, TaskStatus> {
            Box::pin(async move {
                let joined = tokio::task::spawn_blocking(callable).await;
                complete(id, tx, joined)
            })
        });

        (Self { id, rx }, PendingTask::new(id, run))
    }

    /// Get this task's arrival index
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to be dispatched and finish
    pub async fn wait(self) -> Result<T, TaskError<E>> {
        debug!(task_id = self.id, "TaskHandle::wait: called");
        self.rx.await.unwrap_or_else(|_| Err(TaskError::Abandoned))
    }

    /// Wait from a plain OS thread
    ///
    /// Panics if called from within an async execution context.
    pub fn wait_blocking(self) -> Result<T, TaskError<E>> {
        debug!(task_id = self.id, "TaskHandle::wait_blocking: called");
        self.rx.blocking_recv().unwrap_or_else(|_| Err(TaskError::Abandoned))
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Dispatch half of a submission, type-erased so one queue holds any task
pub struct PendingTask {
    id: TaskId,
    submitted_at: Instant,
    run: RunFn,
}

impl PendingTask {
    fn new(id: TaskId, run: RunFn) -> Self {
        Self {
            id,
            submitted_at: Instant::now(),
            run,
        }
    }

    /// Get this task's arrival index
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// When the task was created
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Run the callable and deliver its outcome to the waiter
    ///
    /// Never fails: errors and panics are captured and handed to the waiter.
    pub async fn run(self) -> TaskStatus {
        debug!(task_id = self.id, "PendingTask::run: called");
        (self.run)().await
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("id", &self.id)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

fn complete<T, E>(
    id: TaskId,
    tx: oneshot::Sender<Outcome<T, E>>,
    joined: Result<Result<T, E>, JoinError>,
) -> TaskStatus {
    let (outcome, status) = match joined {
        Ok(Ok(value)) => {
            debug!(task_id = id, "complete: succeeded");
            (Ok(value), TaskStatus::Succeeded)
        }
        Ok(Err(err)) => {
            warn!(task_id = id, "Task returned an error");
            (Err(TaskError::Failed(err)), TaskStatus::Failed)
        }
        Err(join_err) if join_err.is_panic() => {
            let message = panic_message(join_err);
            warn!(task_id = id, %message, "Task panicked");
            (Err(TaskError::Panicked(message)), TaskStatus::Panicked)
        }
        Err(_) => {
            debug!(task_id = id, "complete: cancelled by runtime shutdown");
            (Err(TaskError::Abandoned), TaskStatus::Abandoned)
        }
    };

    if tx.send(outcome).is_err() {
        debug!(task_id = id, "complete: waiter gone, outcome discarded");
    }
    status
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
