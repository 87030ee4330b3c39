//! Scheduler implementation

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::config::SchedulerConfig;
use super::error::SchedulerError;
use super::queue::{PendingQueue, SchedulerStats};
use super::task::{PendingTask, TaskError, TaskHandle, TaskId, TaskStatus};

/// Internal state protected by mutex
struct SchedulerInner {
    /// Tasks waiting for a tick, in arrival order
    queue: PendingQueue,

    /// Id handed to the next submission
    next_id: TaskId,

    /// Statistics
    stats: SchedulerStats,
}

impl SchedulerInner {
    fn next_id(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push(&mut self, task: PendingTask) {
        let depth = self.queue.push(task);
        self.stats.total_submitted += 1;
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(depth);
    }
}

/// State shared between the scheduler, its dispatch loop and dispatched tasks
struct Shared {
    running: AtomicBool,

    /// Bumped on every start so a loop left over from before a restart exits
    generation: AtomicU64,

    max_task: AtomicUsize,
    period_nanos: AtomicU64,
    inner: Mutex<SchedulerInner>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn period(&self) -> Duration {
        Duration::from_nanos(self.period_nanos.load(Ordering::Acquire))
    }

    /// Drain the next batch off the front of the queue
    async fn take_batch(&self) -> Vec<PendingTask> {
        let max_task = self.max_task.load(Ordering::Acquire);
        let mut inner = self.inner.lock().await;

        let batch = inner.queue.take_batch(max_task);
        let wait_ms: u64 = batch
            .iter()
            .map(|task| duration_millis(task.submitted_at().elapsed()))
            .fold(0, u64::saturating_add);

        inner.stats.ticks += 1;
        inner.stats.total_dispatched += batch.len() as u64;
        inner.stats.total_wait_time_ms += wait_ms;
        inner.stats.peak_batch = inner.stats.peak_batch.max(batch.len());

        if !batch.is_empty() {
            debug!(
                tick = inner.stats.ticks,
                dispatched = batch.len(),
                remaining = inner.queue.len(),
                "Shared::take_batch: dispatching"
            );
        }
        batch
    }

    async fn record(&self, status: TaskStatus) {
        let mut inner = self.inner.lock().await;
        match status {
            TaskStatus::Succeeded => inner.stats.total_succeeded += 1,
            TaskStatus::Failed | TaskStatus::Panicked => inner.stats.total_failed += 1,
            TaskStatus::Abandoned => debug!("Shared::record: task abandoned"),
        }
    }
}

/// Releases at most `max_task` queued tasks every `period`
///
/// Submissions are never refused; the queue grows without bound while the
/// dispatch loop drains it at the configured rate.
pub struct Scheduler {
    shared: Arc<Shared>,

    /// Loop task of the current run, if started
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create an idle scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        debug!(?config, "Scheduler::new: called");
        config.validate()?;
        Ok(Self::from_parts(config.max_task, config.period()))
    }

    fn from_parts(max_task: usize, period: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                max_task: AtomicUsize::new(max_task),
                period_nanos: AtomicU64::new(duration_nanos(period)),
                inner: Mutex::new(SchedulerInner {
                    queue: PendingQueue::new(),
                    next_id: 0,
                    stats: SchedulerStats::default(),
                }),
            }),
            loop_handle: std::sync::Mutex::new(None),
        }
    }

    /// Queue an async callable and return its handle without waiting
    pub async fn enqueue<F, Fut, T, E>(&self, callable: F) -> TaskHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut inner = self.shared.inner.lock().await;
        let id = inner.next_id();
        debug!(task_id = id, "Scheduler::enqueue: called");

        let (handle, pending) = TaskHandle::create(id, callable);
        inner.push(pending);
        handle
    }

    /// Queue an async callable and wait for its outcome
    ///
    /// Waits for as long as it takes the loop to reach this task and for the
    /// callable to finish. An error returned by the callable comes back as
    /// [`TaskError::Failed`] holding that same error.
    pub async fn submit<F, Fut, T, E>(&self, callable: F) -> Result<T, TaskError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        debug!("Scheduler::submit: called");
        self.enqueue(callable).await.wait().await
    }

    /// Queue a synchronous callable from a plain OS thread
    ///
    /// Panics if called from within an async execution context.
    pub fn enqueue_blocking<F, T, E>(&self, callable: F) -> TaskHandle<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut inner = self.shared.inner.blocking_lock();
        let id = inner.next_id();
        debug!(task_id = id, "Scheduler::enqueue_blocking: called");

        let (handle, pending) = TaskHandle::create_blocking(id, callable);
        inner.push(pending);
        handle
    }

    /// Queue a synchronous callable and park the current thread until it finishes
    ///
    /// Panics if called from within an async execution context.
    pub fn submit_blocking<F, T, E>(&self, callable: F) -> Result<T, TaskError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        debug!("Scheduler::submit_blocking: called");
        self.enqueue_blocking(callable).wait_blocking()
    }

    /// Spawn the dispatch loop on the current tokio runtime
    pub fn start(&self) -> Result<(), SchedulerError> {
        debug!("Scheduler::start: called");
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Scheduler::start: already running");
            return Err(SchedulerError::AlreadyRunning);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = runtime.spawn(dispatch_loop(Arc::clone(&self.shared), generation));
        *self.loop_slot() = Some(handle);

        info!(
            generation,
            max_task = self.max_task(),
            period = ?self.period(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop dispatching
    ///
    /// The loop notices at the top of its next iteration, so a tick already
    /// sleeping finishes its sleep first. Queued tasks stay queued and
    /// dispatched tasks keep running.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        debug!("Scheduler::stop: called");
        if self
            .shared
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Scheduler::stop: not running");
            return Err(SchedulerError::NotRunning);
        }

        // Detach; the loop exits on its own
        self.loop_slot().take();
        info!("Scheduler stopped");
        Ok(())
    }

    /// Start the loop for the lifetime of the returned guard
    pub fn enter(&self) -> Result<SchedulerGuard<'_>, SchedulerError> {
        debug!("Scheduler::enter: called");
        self.start()?;
        Ok(SchedulerGuard { scheduler: self })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Get the batch ceiling
    pub fn max_task(&self) -> usize {
        self.shared.max_task.load(Ordering::Acquire)
    }

    /// Replace the batch ceiling, effective from the next tick
    pub fn set_max_task(&self, max_task: usize) -> Result<(), SchedulerError> {
        debug!(max_task, "Scheduler::set_max_task: called");
        if max_task == 0 {
            return Err(SchedulerError::InvalidMaxTask(max_task));
        }
        self.shared.max_task.store(max_task, Ordering::Release);
        Ok(())
    }

    /// Get the delay between ticks
    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    /// Replace the delay between ticks, effective from the next sleep
    ///
    /// A zero period makes the loop tick as fast as the runtime lets it.
    pub fn set_period(&self, period: Duration) {
        debug!(?period, "Scheduler::set_period: called");
        self.shared.period_nanos.store(duration_nanos(period), Ordering::Release);
    }

    /// Number of tasks waiting for a tick
    pub async fn pending(&self) -> usize {
        self.shared.inner.lock().await.queue.len()
    }

    /// Ids of tasks waiting for a tick, front first
    pub async fn pending_ids(&self) -> Vec<TaskId> {
        self.shared.inner.lock().await.queue.ids()
    }

    /// Get the scheduler statistics
    pub async fn stats(&self) -> SchedulerStats {
        debug!("Scheduler::stats: called");
        self.shared.inner.lock().await.stats.clone()
    }

    fn loop_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Scheduler {
    /// Five tasks per one-second tick
    fn default() -> Self {
        let config = SchedulerConfig::default();
        Self::from_parts(config.max_task, config.period())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.loop_slot().take() {
            handle.abort();
        }
    }
}

/// Keeps the dispatch loop running until dropped
///
/// Dropping stops the loop if it is still running. Errors and panics in the
/// guarded scope pass through untouched.
pub struct SchedulerGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Deref for SchedulerGuard<'_> {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        self.scheduler
    }
}

impl Drop for SchedulerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.scheduler.stop() {
            debug!(%e, "SchedulerGuard::drop: already stopped");
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, generation: u64) {
    debug!(generation, "dispatch_loop: started");

    while shared.is_current(generation) {
        for task in shared.take_batch().await {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let status = task.run().await;
                shared.record(status).await;
            });
        }

        let period = shared.period();
        if period.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(period).await;
        }
    }

    debug!(generation, "dispatch_loop: exiting");
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn scheduler(max_task: usize, period_ms: u64) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            max_task,
            period_ms,
        })
        .unwrap()
    }

    #[test]
    fn test_new_rejects_zero_max_task() {
        let result = Scheduler::new(SchedulerConfig {
            max_task: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(SchedulerError::InvalidMaxTask(0))));
    }

    #[test]
    fn test_default_settings() {
        let scheduler = Scheduler::default();
        assert_eq!(scheduler.max_task(), 5);
        assert_eq!(scheduler.period(), Duration::from_secs(1));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_start_without_runtime() {
        let scheduler = Scheduler::default();
        assert_eq!(scheduler.start(), Err(SchedulerError::NoRuntime));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let scheduler = scheduler(1, 10);
        scheduler.start().unwrap();

        assert_eq!(scheduler.start(), Err(SchedulerError::AlreadyRunning));
        assert!(scheduler.is_running());

        // Loop is still dispatching
        let value = scheduler.submit(|| async { Ok::<_, String>(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_stop_when_idle_fails() {
        let scheduler = scheduler(1, 10);
        assert_eq!(scheduler.stop(), Err(SchedulerError::NotRunning));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_set_max_task_keeps_prior_on_error() {
        let scheduler = scheduler(3, 10);

        assert_eq!(scheduler.set_max_task(0), Err(SchedulerError::InvalidMaxTask(0)));
        assert_eq!(scheduler.max_task(), 3);

        scheduler.set_max_task(7).unwrap();
        assert_eq!(scheduler.max_task(), 7);
    }

    #[test]
    fn test_set_period() {
        let scheduler = scheduler(3, 10);
        scheduler.set_period(Duration::from_micros(1500));
        assert_eq!(scheduler.period(), Duration::from_micros(1500));

        scheduler.set_period(Duration::ZERO);
        assert_eq!(scheduler.period(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_follow_arrival_order() {
        let scheduler = scheduler(2, 100);
        let started = Arc::new(std::sync::Mutex::new(Vec::new()));
        let origin = Instant::now();

        let mut handles = Vec::new();
        for index in 0..5u64 {
            let started = Arc::clone(&started);
            handles.push(
                scheduler
                    .enqueue(move || async move {
                        let tick = origin.elapsed().as_millis() / 100;
                        started.lock().unwrap().push((index, tick));
                        Ok::<_, String>(index)
                    })
                    .await,
            );
        }

        scheduler.start().unwrap();
        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().await.unwrap(), index as u64);
        }

        let mut started = started.lock().unwrap().clone();
        started.sort();
        assert_eq!(started, vec![(0, 0), (1, 0), (2, 1), (3, 1), (4, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leftovers_stay_ahead_of_later_arrivals() {
        let scheduler = scheduler(2, 100);
        let started = Arc::new(std::sync::Mutex::new(Vec::new()));
        let origin = Instant::now();

        let sink = Arc::clone(&started);
        let record = move |index: u64| {
            let started = Arc::clone(&sink);
            move || async move {
                started.lock().unwrap().push((index, origin.elapsed().as_millis() / 100));
                Ok::<_, String>(index)
            }
        };

        let mut handles = Vec::new();
        for index in 0..3 {
            handles.push(scheduler.enqueue(record(index)).await);
        }
        scheduler.start().unwrap();

        // Task 2 missed the first tick; the next three arrive mid-period
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.pending_ids().await, vec![2]);
        for index in 3..6 {
            handles.push(scheduler.enqueue(record(index)).await);
        }
        assert_eq!(scheduler.pending_ids().await, vec![2, 3, 4, 5]);

        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().await.unwrap(), index as u64);
        }

        let mut started = started.lock().unwrap().clone();
        started.sort();
        assert_eq!(started, vec![(0, 0), (1, 0), (2, 1), (3, 1), (4, 2), (5, 2)]);
    }

    #[test]
    fn test_duration_conversions_saturate() {
        assert_eq!(duration_millis(Duration::from_micros(2500)), 2);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
        assert_eq!(duration_nanos(Duration::MAX), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeping_tasks_finish_within_three_ticks() {
        let scheduler = Arc::new(scheduler(2, 100));
        scheduler.start().unwrap();
        let origin = Instant::now();

        let mut submitters = Vec::new();
        for index in 0..5u32 {
            let scheduler = Arc::clone(&scheduler);
            submitters.push(tokio::spawn(async move {
                scheduler
                    .submit(move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(index)
                    })
                    .await
            }));
        }

        for (index, submitter) in submitters.into_iter().enumerate() {
            assert_eq!(submitter.await.unwrap().unwrap(), index as u32);
        }

        // Third batch starts on the third tick; its 50ms sleep ends the run
        let elapsed = origin.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(350), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_submit_propagates_error() {
        let scheduler = scheduler(1, 10);
        scheduler.start().unwrap();

        let result = scheduler
            .submit(|| async { Err::<u32, _>(std::io::Error::other("remote refused")) })
            .await;

        match result {
            Err(TaskError::Failed(err)) => {
                assert_eq!(err.kind(), std::io::ErrorKind::Other);
                assert_eq!(err.to_string(), "remote refused");
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let stats = scheduler.stats().await;
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_succeeded, 0);
    }

    #[tokio::test]
    async fn test_panic_does_not_stop_loop() {
        let scheduler = scheduler(2, 10);
        scheduler.start().unwrap();

        let panicked = scheduler
            .submit(|| async {
                let missing: Option<u32> = None;
                Ok::<u32, String>(missing.expect("remote exploded"))
            })
            .await;
        assert!(matches!(panicked, Err(TaskError::Panicked(_))));

        let value = scheduler.submit(|| async { Ok::<_, String>(9) }).await.unwrap();
        assert_eq!(value, 9);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_queue_intact() {
        let scheduler = scheduler(1, 100);
        let mut handles = Vec::new();
        for index in 0..3u32 {
            handles.push(scheduler.enqueue(move || async move { Ok::<_, String>(index) }).await);
        }

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(scheduler.pending_ids().await, vec![1, 2]);

        scheduler.start().unwrap();
        let results: Vec<u32> = futures::future::join_all(handles.into_iter().map(TaskHandle::wait))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(results, vec![0, 1, 2]);
        assert_eq!(scheduler.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_double_dispatch() {
        let scheduler = scheduler(1, 100);
        let origin = Instant::now();
        let started = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..4u64 {
            let started = Arc::clone(&started);
            handles.push(
                scheduler
                    .enqueue(move || async move {
                        started.lock().unwrap().push((index, origin.elapsed().as_millis() / 100));
                        Ok::<_, String>(())
                    })
                    .await,
            );
        }

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop().unwrap();
        scheduler.start().unwrap();

        for handle in handles {
            handle.wait().await.unwrap();
        }

        let mut started = started.lock().unwrap().clone();
        started.sort();
        // A leftover loop would also dispatch at tick 1, pulling task 3 forward
        assert_eq!(started.last(), Some(&(3, 2)));
    }

    #[tokio::test]
    async fn test_guard_stops_on_drop() {
        let scheduler = scheduler(1, 10);
        {
            let guard = scheduler.enter().unwrap();
            assert!(guard.is_running());
        }
        assert!(!scheduler.is_running());

        // Stopping inside the scope is fine too
        {
            let guard = scheduler.enter().unwrap();
            guard.stop().unwrap();
        }
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_dropping_scheduler_abandons_pending() {
        let scheduler = scheduler(1, 10);
        let handle = scheduler.enqueue(|| async { Ok::<_, String>(1) }).await;
        drop(scheduler);

        assert!(matches!(handle.wait().await, Err(TaskError::Abandoned)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_loses_nothing() {
        let scheduler = Arc::new(scheduler(3, 10));

        let mut enqueuers = Vec::new();
        for _ in 0..64 {
            let scheduler = Arc::clone(&scheduler);
            enqueuers.push(tokio::spawn(async move {
                scheduler.enqueue(|| async { Ok::<_, String>(()) }).await.id()
            }));
        }

        let mut ids = Vec::new();
        for enqueuer in enqueuers {
            ids.push(enqueuer.await.unwrap());
        }
        ids.sort();

        assert_eq!(ids, (0..64).collect::<Vec<TaskId>>());
        assert_eq!(scheduler.pending_ids().await, (0..64).collect::<Vec<TaskId>>());
        assert_eq!(scheduler.stats().await.total_submitted, 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_period_still_dispatches() {
        let scheduler = Arc::new(scheduler(1, 10));
        scheduler.set_period(Duration::ZERO);
        scheduler.start().unwrap();

        for index in 0..3u32 {
            let value = scheduler.submit(move || async move { Ok::<_, String>(index) }).await.unwrap();
            assert_eq!(value, index);
        }
        scheduler.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_blocking_from_thread() {
        let scheduler = Arc::new(scheduler(2, 10));
        scheduler.start().unwrap();

        let worker = Arc::clone(&scheduler);
        let result = tokio::task::spawn_blocking(move || {
            worker.submit_blocking(|| {
                std::thread::sleep(Duration::from_millis(5));
                Ok::<_, String>("pong")
            })
        })
        .await
        .unwrap();

        assert_eq!(result.unwrap(), "pong");
        assert_eq!(scheduler.stats().await.total_submitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_tracking() {
        let scheduler = scheduler(2, 100);
        let mut handles = Vec::new();
        for index in 0..5u32 {
            handles.push(
                scheduler
                    .enqueue(move || async move {
                        if index == 4 { Err("odd one out".to_string()) } else { Ok(index) }
                    })
                    .await,
            );
        }
        assert_eq!(scheduler.stats().await.peak_queue_depth, 5);

        scheduler.start().unwrap();
        for handle in handles {
            let _ = handle.wait().await;
        }
        // Let the dispatched wrappers record their outcome
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = scheduler.stats().await;
        assert_eq!(stats.total_submitted, 5);
        assert_eq!(stats.total_dispatched, 5);
        assert_eq!(stats.total_succeeded, 4);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.peak_batch, 2);
        assert!(stats.ticks >= 3);
        assert_eq!(stats.in_flight(), 0);
    }
}
