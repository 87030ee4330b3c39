//! Rate-limited task scheduler
//!
//! Callers submit callables and wait for their outcome while a background
//! loop releases at most `max_task` queued callables every `period`.

mod config;
mod core;
mod error;
mod queue;
mod task;

pub use config::SchedulerConfig;
pub use core::{Scheduler, SchedulerGuard};
pub use error::SchedulerError;
pub use queue::{PendingQueue, SchedulerStats};
pub use task::{PendingTask, TaskError, TaskHandle, TaskId, TaskStatus};
