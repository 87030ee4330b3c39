//! Queue types for the scheduler

use std::collections::VecDeque;

use super::task::{PendingTask, TaskId};

/// FIFO of tasks not yet dispatched
///
/// Tasks leave only through [`PendingQueue::take_batch`] and are never put back.
#[derive(Debug, Default)]
pub struct PendingQueue {
    tasks: VecDeque<PendingTask>,
}

impl PendingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task at the tail, returning the new depth
    pub fn push(&mut self, task: PendingTask) -> usize {
        self.tasks.push_back(task);
        self.tasks.len()
    }

    /// Remove up to `max` tasks from the front, in arrival order
    pub fn take_batch(&mut self, max: usize) -> Vec<PendingTask> {
        let count = max.min(self.tasks.len());
        self.tasks.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ids of queued tasks, front first
    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(PendingTask::id).collect()
    }
}

/// Statistics for the scheduler
///
/// `total_failed` counts both returned errors and panics. Tasks abandoned by
/// runtime shutdown are dispatched but counted in neither outcome.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_dispatched: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_wait_time_ms: u64,
    pub ticks: u64,
    pub peak_queue_depth: usize,
    pub peak_batch: usize,
}

impl SchedulerStats {
    /// Average time a task waited in the queue before dispatch
    pub fn avg_wait_ms(&self) -> Option<u64> {
        (self.total_dispatched > 0).then(|| self.total_wait_time_ms / self.total_dispatched)
    }

    /// Tasks dispatched but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.total_dispatched
            .saturating_sub(self.total_succeeded)
            .saturating_sub(self.total_failed)
    }
}
