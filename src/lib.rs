//! reqpacer - Rate-limited task scheduler
//!
//! reqpacer throttles calls against a rate-limited resource. Callers submit
//! work and wait for its result; a control loop releases at most N pending
//! calls every fixed period, no matter how fast callers submit.
//!
//! # Modules
//!
//! - [`scheduler`] - Scheduler, task handles and dispatch loop
//! - [`demo`] - Simulated remote service driven through the scheduler
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod demo;
pub mod scheduler;

// Re-export commonly used types
pub use config::{Config, DemoConfig};
pub use demo::{DemoReport, SimulatedService};
pub use scheduler::{
    PendingTask, Scheduler, SchedulerConfig, SchedulerError, SchedulerGuard, SchedulerStats, TaskError, TaskHandle,
    TaskId, TaskStatus,
};
