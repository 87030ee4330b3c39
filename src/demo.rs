//! Demo workload: a simulated remote service queried through the scheduler
//!
//! Worker threads hammer the service as fast as they can; the scheduler
//! keeps the observed query rate at or below `max_task / period`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use eyre::{Context, Result, eyre};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::DemoConfig;
use crate::scheduler::{Scheduler, SchedulerStats, TaskError};

/// Errors from the simulated service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No time has elapsed since the service started")]
    NoElapsedTime,
}

/// Outcome of one demo query as seen by its submitter
pub type QueryOutcome = Result<f64, TaskError<ServiceError>>;

/// Stand-in for a rate-limited remote service
///
/// Each query takes `query_time` and answers with the average number of
/// queries per second the service has seen since it was created.
#[derive(Debug)]
pub struct SimulatedService {
    started: Instant,
    queries: AtomicU64,
    query_time: Duration,
}

impl SimulatedService {
    pub fn new(query_time: Duration) -> Self {
        debug!(?query_time, "SimulatedService::new: called");
        Self {
            started: Instant::now(),
            queries: AtomicU64::new(0),
            query_time,
        }
    }

    /// Serve one query, blocking for the query time
    pub fn query(&self) -> Result<f64, ServiceError> {
        self.queries.fetch_add(1, Ordering::AcqRel);
        thread::sleep(self.query_time);
        self.rate().ok_or(ServiceError::NoElapsedTime)
    }

    /// Queries served so far
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Acquire)
    }

    /// Average queries per second since creation
    pub fn rate(&self) -> Option<f64> {
        let secs = self.started.elapsed().as_secs_f64();
        (secs > 0.0).then(|| self.queries() as f64 / secs)
    }
}

/// Summary of a demo run
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub observed_rate: Option<f64>,
    pub stats: SchedulerStats,
}

/// Drive `config.requests` queries from `config.workers` threads
///
/// Must run on a thread that is not executing async code but can reach a
/// tokio runtime, e.g. inside `tokio::task::spawn_blocking`. The scheduler
/// runs for the duration of the call. `on_result` sees every outcome in
/// completion order together with the query's index.
pub fn run<F>(
    scheduler: &Scheduler,
    service: Arc<SimulatedService>,
    config: &DemoConfig,
    mut on_result: F,
) -> Result<DemoReport>
where
    F: FnMut(usize, &QueryOutcome),
{
    debug!(?config, "demo::run: called");
    if config.workers == 0 {
        return Err(eyre!("Demo needs at least one worker"));
    }
    let runtime = Handle::try_current().context("Demo must run inside a tokio runtime")?;

    let started = Instant::now();
    let next_request = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, QueryOutcome)>();
    let mut succeeded = 0;
    let mut failed = 0;

    {
        let _guard = scheduler.enter()?;
        info!(requests = config.requests, workers = config.workers, "Demo started");

        thread::scope(|scope| {
            for _ in 0..config.workers {
                let tx = tx.clone();
                let service = Arc::clone(&service);
                let next_request = &next_request;
                scope.spawn(move || {
                    loop {
                        let index = next_request.fetch_add(1, Ordering::AcqRel);
                        if index >= config.requests {
                            break;
                        }
                        let service = Arc::clone(&service);
                        let outcome = scheduler.submit_blocking(move || service.query());
                        if tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (index, outcome) in rx {
                match &outcome {
                    Ok(_) => succeeded += 1,
                    Err(_) => failed += 1,
                }
                on_result(index, &outcome);
            }
        });
    }

    let stats = runtime.block_on(scheduler.stats());
    let report = DemoReport {
        succeeded,
        failed,
        elapsed: started.elapsed(),
        observed_rate: service.rate(),
        stats,
    };
    info!(succeeded, failed, elapsed = ?report.elapsed, "Demo finished");
    Ok(report)
}
