//! Scheduler error types

use thiserror::Error;

/// Errors raised directly by scheduler operations
///
/// Task failures never show up here; they reach their own submitter as a
/// [`TaskError`](super::TaskError).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Attempted to start the dispatch loop while it is running")]
    AlreadyRunning,

    #[error("Attempted to stop the dispatch loop while it is stopped")]
    NotRunning,

    #[error("max_task shall be greater than 0: got {0}")]
    InvalidMaxTask(usize),

    #[error("No tokio runtime available to run the dispatch loop")]
    NoRuntime,
}

impl SchedulerError {
    /// Check if this error comes from calling start/stop in the wrong state
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, SchedulerError::AlreadyRunning | SchedulerError::NotRunning)
    }
}
