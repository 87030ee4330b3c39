//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::SchedulerError;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max tasks released per tick
    #[serde(rename = "max-task", default = "default_max_task")]
    pub max_task: usize,

    /// Delay between ticks in milliseconds
    #[serde(rename = "period-ms", default = "default_period_ms")]
    pub period_ms: u64,
}

fn default_max_task() -> usize {
    5
}

fn default_period_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_task: default_max_task(),
            period_ms: default_period_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Create a config from a batch ceiling and a tick period
    ///
    /// The period is stored in whole milliseconds, so any sub-millisecond
    /// remainder is dropped. [`Scheduler::set_period`] keeps full precision.
    ///
    /// [`Scheduler::set_period`]: super::Scheduler::set_period
    pub fn new(max_task: usize, period: Duration) -> Self {
        Self {
            max_task,
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Get the tick period as a Duration
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_task == 0 {
            return Err(SchedulerError::InvalidMaxTask(self.max_task));
        }
        Ok(())
    }
}
