//! The worker pool: a fixed-to-elastic set of OS threads waiting on one
//! completion queue.
//!
//! Workers never spin and there is no work stealing; the completion queue
//! is the only scheduling substrate. Every queue message is one of: a
//! wake-up for a submitted work item, a direct callback, an I/O completion
//! for an associated source, or a stop sentinel. After each processed
//! event a worker samples short-interval CPU load and decides whether the
//! pool should grow by one or whether it should leave.
//!
//! Shutdown never blocks indefinitely: each drain phase waits with an
//! exponential back-off and still-running workers are abandoned (and
//! reported) rather than waited on forever.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::error::ErrorReport;
use crate::metrics::{METRICS_ID_POOL_BACKLOG, METRICS_ID_POOL_BUSY, METRICS_ID_POOL_WORKERS};

pub mod cpu;
pub mod heartbeat;
pub mod wake;

use cpu::CpuLoad;
use heartbeat::{Heartbeat, HeartbeatFn};
use wake::{SleepAborted, SleeperRegistry, WakePayload};

/// No use for a pool below this number of workers.
pub const NUM_THREADS_MINIMUM: usize = 4;
/// Default maximum number of workers.
pub const NUM_THREADS_DEFAULT: usize = 10;
/// Standard worker stack size on 64-bit architectures.
pub const THREAD_STACKSIZE: usize = 2 * 1024 * 1024;

/// Grow the pool while load stays under this fraction.
const CPU_LOAD_GROW_CEILING: f32 = 0.75;
/// Shrink the pool when load exceeds this fraction.
const CPU_LOAD_SHRINK_FLOOR: f32 = 0.9;

/// A unit of work submitted to the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Per-worker prologue installed with [`WorkerPool::set_thread_init`].
pub type ThreadInitFn = Arc<dyn Fn() + Send + Sync>;

/// Epilogue consulted after every event and on every I/O abort.
///
/// Receives `(stay_in_pool, forced_abort)` and returns whether the worker
/// stays in the pool.
pub type TryAbortFn = Arc<dyn Fn(bool, bool) -> bool + Send + Sync>;

/// One I/O completion delivered through the queue.
#[derive(Clone, Copy, Debug)]
pub struct IoEvent {
    /// The key the source was associated under.
    pub key: u64,
    /// Bytes transferred.
    pub bytes: usize,
    /// True when the source was closed and the operation aborted.
    pub aborted: bool,
}

/// Callback bound to an associated I/O source.
pub type IoCallback = Arc<dyn Fn(IoEvent) + Send + Sync>;

enum Completion {
    /// Pull the next job from the backlog.
    Work,
    /// The message itself is the callback.
    Call(Job),
    /// A completion for an associated I/O source.
    Io(IoEvent),
    /// Leave the pool.
    Stop,
}

/// Error from pool submission entry points.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has begun shutting down and rejects new work.
    #[error("pool is not open for work")]
    NotOpenForWork,
    /// A worker thread could not be spawned.
    #[error("could not spawn a worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

thread_local! {
    // Set when an aborted sleep poisons the current worker
    static LEAVE_POOL: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

struct PoolShared {
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    work: Mutex<std::collections::VecDeque<Job>>,
    cleanup: Mutex<Vec<Job>>,
    io_callbacks: Mutex<HashMap<u64, IoCallback>>,
    sleepers: SleeperRegistry,
    heartbeat: Mutex<Option<Heartbeat>>,
    thread_init: Mutex<Option<ThreadInitFn>>,
    try_abort: Mutex<Option<TryAbortFn>>,
    report: Arc<dyn ErrorReport>,
    cpu: CpuLoad,

    initialized: AtomicBool,
    open_for_work: AtomicBool,
    current: AtomicUsize,
    busy: AtomicUsize,
    min_threads: AtomicUsize,
    max_threads: AtomicUsize,
    stack_size: AtomicUsize,
    next_worker: AtomicU64,
    workers: Mutex<HashMap<u64, std::thread::JoinHandle<()>>>,
}

/// The pool itself. Cheap to clone through an [`Arc`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

/// RAII token holding one extra slot of pool concurrency.
///
/// Taken by long-running tasks just before parking or blocking; the slot
/// is given back when the guard drops.
pub struct PoolMaxGuard {
    shared: Arc<PoolShared>,
}

impl Drop for PoolMaxGuard {
    fn drop(&mut self) {
        self.shared.max_threads.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// A pool with default bounds; workers start on [`WorkerPool::run`] or
    /// on the first submission.
    pub fn new(report: Arc<dyn ErrorReport>) -> Self {
        Self::with_bounds(NUM_THREADS_MINIMUM, NUM_THREADS_DEFAULT, report)
    }

    /// A pool with explicit bounds (clamped on initialization).
    pub fn with_bounds(min: usize, max: usize, report: Arc<dyn ErrorReport>) -> Self {
        let (sender, receiver) = unbounded();
        WorkerPool {
            shared: Arc::new(PoolShared {
                sender,
                receiver,
                work: Mutex::new(std::collections::VecDeque::new()),
                cleanup: Mutex::new(Vec::new()),
                io_callbacks: Mutex::new(HashMap::new()),
                sleepers: SleeperRegistry::new(),
                heartbeat: Mutex::new(None),
                thread_init: Mutex::new(None),
                try_abort: Mutex::new(None),
                report,
                cpu: CpuLoad::new(),
                initialized: AtomicBool::new(false),
                open_for_work: AtomicBool::new(true),
                current: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                min_threads: AtomicUsize::new(min),
                max_threads: AtomicUsize::new(max),
                stack_size: AtomicUsize::new(THREAD_STACKSIZE),
                next_worker: AtomicU64::new(1),
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts the minimum number of workers. Idempotent.
    pub fn run(&self) {
        if !self.shared.open_for_work.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let upper = (4 * cpus).max(NUM_THREADS_DEFAULT);
        let max = self.shared.max_threads.load(Ordering::SeqCst).clamp(NUM_THREADS_DEFAULT, upper);
        let mut min = self.shared.min_threads.load(Ordering::SeqCst);
        if min >= max {
            min = NUM_THREADS_DEFAULT / 2;
        }
        min = min.clamp(2, (2 * cpus).min(max));
        self.shared.max_threads.store(max, Ordering::SeqCst);
        self.shared.min_threads.store(min, Ordering::SeqCst);
        tracing::debug!(min, max, "starting worker pool");

        for _ in 0..min {
            if let Err(error) = spawn_worker(&self.shared) {
                tracing::error!("could not start pool worker: {error}");
            }
        }
    }

    /// Submits a work item, waking one thread to run it.
    pub fn submit_work(&self, job: Job) -> Result<(), PoolError> {
        self.run();
        if !self.shared.open_for_work.load(Ordering::SeqCst) {
            tracing::warn!("work submitted while pool is closing; rejected");
            return Err(PoolError::NotOpenForWork);
        }
        {
            let mut work = self.shared.work.lock();
            work.push_back(job);
            metrics::gauge!(METRICS_ID_POOL_BACKLOG).set(work.len() as f64);
        }
        // Wake one thread out of the completion queue
        self.shared
            .sender
            .send(Completion::Work)
            .map_err(|_| PoolError::NotOpenForWork)
    }

    /// Submits a callback carried directly in the completion message.
    pub fn submit_call(&self, job: Job) -> Result<(), PoolError> {
        self.run();
        if !self.shared.open_for_work.load(Ordering::SeqCst) {
            return Err(PoolError::NotOpenForWork);
        }
        self.shared
            .sender
            .send(Completion::Call(job))
            .map_err(|_| PoolError::NotOpenForWork)
    }

    /// Queues a cleanup job; cleanup runs once, during shutdown.
    pub fn submit_cleanup(&self, job: Job) {
        let mut cleanup = self.shared.cleanup.lock();
        cleanup.push(job);
        tracing::trace!("cleanup queue now holds {} jobs", cleanup.len());
    }

    /// Binds an I/O source key to the completion queue.
    ///
    /// Completions posted for `key` through [`WorkerPool::post_io`] run
    /// `callback` on a pool worker.
    pub fn associate_io(&self, key: u64, callback: IoCallback) {
        self.shared.io_callbacks.lock().insert(key, callback);
    }

    /// Posts a completion for an associated I/O source.
    pub fn post_io(&self, event: IoEvent) -> Result<(), PoolError> {
        self.shared
            .sender
            .send(Completion::Io(event))
            .map_err(|_| PoolError::NotOpenForWork)
    }

    /// Installs the per-worker prologue and the abort epilogue.
    pub fn set_thread_init(&self, init: ThreadInitFn, abort: TryAbortFn) -> bool {
        if self.shared.initialized.load(Ordering::SeqCst) {
            return false;
        }
        *self.shared.thread_init.lock() = Some(init);
        *self.shared.try_abort.lock() = Some(abort);
        true
    }

    /// Tries to set the minimum number of workers.
    pub fn try_set_minimum(&self, min: usize) -> bool {
        if min < 2 || min > self.shared.max_threads.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.min_threads.store(min, Ordering::SeqCst);
        true
    }

    /// Tries to set the maximum number of workers.
    pub fn try_set_maximum(&self, max: usize) -> bool {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let upper = (4 * cpus).max(NUM_THREADS_DEFAULT);
        if max < self.shared.min_threads.load(Ordering::SeqCst) || max > upper {
            return false;
        }
        self.shared.max_threads.store(max, Ordering::SeqCst);
        true
    }

    /// Holds one extra slot of concurrency until the guard drops.
    pub fn extend_maximum(&self) -> PoolMaxGuard {
        self.shared.max_threads.fetch_add(1, Ordering::SeqCst);
        PoolMaxGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Parks the calling task under `unique` (see [`SleeperRegistry`]).
    ///
    /// The pool holds an extra concurrency slot for the duration of the
    /// park. An abort poisons the sleeper: a pool worker receiving it
    /// leaves the pool after the current item.
    pub fn sleep_task(&self, unique: u64, payload: WakePayload) -> Result<WakePayload, SleepAborted> {
        if !self.shared.open_for_work.load(Ordering::SeqCst) {
            return Err(SleepAborted(unique));
        }
        let _extra = self.extend_maximum();
        match self.shared.sleepers.sleep_task(unique, payload) {
            Ok(payload) => Ok(payload),
            Err(aborted) => {
                LEAVE_POOL.with(|leave| leave.set(true));
                Err(aborted)
            }
        }
    }

    /// Wakes the task parked under `unique`, handing off `payload`.
    pub fn wake(&self, unique: u64, payload: WakePayload) -> bool {
        self.shared.sleepers.wake(unique, payload)
    }

    /// Reads the payload parked under `unique`.
    pub fn peek_sleeping<R>(&self, unique: u64, read: impl FnOnce(&WakePayload) -> R) -> Option<R> {
        self.shared.sleepers.peek(unique, read)
    }

    /// Aborts the task parked under `unique`.
    pub fn abort_sleeping(&self, unique: u64) -> bool {
        self.shared.sleepers.abort(unique)
    }

    /// Starts the single heartbeat task. Fails when one is running.
    pub fn create_heartbeat(&self, callback: HeartbeatFn, period: Duration) -> bool {
        let mut slot = self.shared.heartbeat.lock();
        if slot.as_ref().is_some_and(Heartbeat::is_running) {
            return false;
        }
        match Heartbeat::start(callback, period, Arc::clone(&self.shared.report)) {
            Ok(heartbeat) => {
                *slot = Some(heartbeat);
                true
            }
            Err(error) => {
                tracing::error!("could not start heartbeat: {error}");
                false
            }
        }
    }

    /// Performs a single extra heartbeat.
    pub fn do_extra_heartbeat(&self) {
        if let Some(heartbeat) = self.shared.heartbeat.lock().as_ref() {
            heartbeat.pulse();
        }
    }

    /// Stops the heartbeat task, waiting briefly for it to end.
    pub fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.shared.heartbeat.lock().take() {
            heartbeat.stop();
        }
    }

    /// Signals the heartbeat to stop without waiting.
    ///
    /// Callable from inside the heartbeat callback itself.
    pub fn request_heartbeat_stop(&self) {
        if let Some(heartbeat) = self.shared.heartbeat.lock().as_ref() {
            heartbeat.request_stop();
        }
    }

    /// Stops the pool: rejects new work, wakes sleepers, stops the
    /// heartbeat, runs cleanup jobs on the calling thread, drains the
    /// work queue, and stops every worker. Never blocks indefinitely.
    pub fn shutdown(&self) {
        tracing::debug!("stopping worker pool");
        self.shared.open_for_work.store(false, Ordering::SeqCst);

        self.shared.sleepers.wake_all();
        wait_for_idle(|| self.shared.sleepers.is_empty());

        self.stop_heartbeat();

        // Cleanup runs here, on the caller's thread
        let cleanup: Vec<Job> = std::mem::take(&mut *self.shared.cleanup.lock());
        for job in cleanup {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                self.shared.report.report("pool-cleanup", &panic_text(&panic));
            }
        }

        wait_for_idle(|| self.shared.work.lock().is_empty());

        let workers = self.shared.current.load(Ordering::SeqCst);
        for _ in 0..workers.max(1) {
            if self.shared.sender.send(Completion::Stop).is_err() {
                tracing::warn!("could not post a stop to the completion queue");
                break;
            }
        }

        let idle = wait_for_idle(|| self.shared.current.load(Ordering::SeqCst) == 0);
        let mut workers = self.shared.workers.lock();
        if !idle && !workers.is_empty() {
            // Out of patience: abandon whoever is still inside user code
            self.shared.report.report(
                "pool-shutdown",
                &format!("{} workers did not stop in time; detaching", workers.len()),
            );
        }
        for (_, handle) in workers.drain() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        let dropped = self.shared.work.lock().len();
        if dropped > 0 {
            tracing::warn!("dropping {dropped} unstarted work items at shutdown");
        }
        self.shared.initialized.store(false, Ordering::SeqCst);
        tracing::debug!("worker pool stopped");
    }

    /// Whether submissions are still accepted.
    pub fn is_open_for_work(&self) -> bool {
        self.shared.open_for_work.load(Ordering::SeqCst)
    }

    /// Current number of workers.
    pub fn current_workers(&self) -> usize {
        self.shared.current.load(Ordering::SeqCst)
    }

    /// Number of workers running an item right now. Not stable while running.
    pub fn busy_workers(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Configured minimum workers.
    pub fn min_threads(&self) -> usize {
        self.shared.min_threads.load(Ordering::SeqCst)
    }

    /// Configured maximum workers.
    pub fn max_threads(&self) -> usize {
        self.shared.max_threads.load(Ordering::SeqCst)
    }

    /// Jobs submitted but not yet picked up.
    pub fn backlog(&self) -> usize {
        self.shared.work.lock().len()
    }

    /// Pending cleanup jobs.
    pub fn cleanup_jobs(&self) -> usize {
        self.shared.cleanup.lock().len()
    }

    /// Sets the worker stack size for workers spawned from now on.
    pub fn set_stack_size(&self, bytes: usize) {
        self.shared.stack_size.store(bytes, Ordering::SeqCst);
    }
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        WorkerPool {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Waits for `idle()` with the 50..6400 ms exponential back-off ladder.
fn wait_for_idle(idle: impl Fn() -> bool) -> bool {
    let mut wait = Duration::from_millis(50);
    for _ in 0..8 {
        if idle() {
            return true;
        }
        std::thread::sleep(wait);
        wait *= 2;
    }
    idle()
}

fn spawn_worker(shared: &Arc<PoolShared>) -> Result<(), PoolError> {
    let id = shared.next_worker.fetch_add(1, Ordering::SeqCst);
    let worker_shared = Arc::clone(shared);
    let handle = std::thread::Builder::new()
        .name(format!("marlin-worker-{id}"))
        .stack_size(shared.stack_size.load(Ordering::SeqCst))
        .spawn(move || run_worker(worker_shared, id))
        .map_err(PoolError::Spawn)?;
    shared.workers.lock().insert(id, handle);
    Ok(())
}

fn run_worker(shared: Arc<PoolShared>, id: u64) {
    shared.current.fetch_add(1, Ordering::SeqCst);
    shared.busy.fetch_add(1, Ordering::SeqCst);
    metrics::gauge!(METRICS_ID_POOL_WORKERS).increment(1);
    tracing::trace!(worker = id, "thread is entering the pool");

    if let Some(init) = shared.thread_init.lock().clone() {
        init();
    }

    let mut stay_in_pool = true;
    while stay_in_pool {
        shared.busy.fetch_sub(1, Ordering::SeqCst);
        let completion = shared.receiver.recv();
        shared.busy.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!(METRICS_ID_POOL_BUSY).set(shared.busy.load(Ordering::SeqCst) as f64);

        let completion = match completion {
            Ok(completion) => completion,
            // Channel closed: the pool is being torn down
            Err(_) => break,
        };

        // Should another thread join the pool?
        if shared.busy.load(Ordering::SeqCst) >= shared.current.load(Ordering::SeqCst)
            && shared.current.load(Ordering::SeqCst) < shared.max_threads.load(Ordering::SeqCst)
            && shared.cpu.sample() < CPU_LOAD_GROW_CEILING
            && shared.open_for_work.load(Ordering::SeqCst)
        {
            if let Err(error) = spawn_worker(&shared) {
                tracing::warn!("pool wanted to grow but could not: {error}");
            }
        }

        match completion {
            Completion::Stop => {
                if let Some(abort) = shared.try_abort.lock().clone() {
                    abort(false, true);
                }
                break;
            }
            Completion::Work => {
                let job = {
                    let mut work = shared.work.lock();
                    let job = work.pop_front();
                    metrics::gauge!(METRICS_ID_POOL_BACKLOG).set(work.len() as f64);
                    job
                };
                if let Some(job) = job {
                    run_job(&shared, job);
                }
            }
            Completion::Call(job) => run_job(&shared, job),
            Completion::Io(event) => {
                if event.aborted {
                    if let Some(abort) = shared.try_abort.lock().clone() {
                        stay_in_pool = abort(stay_in_pool, true);
                    }
                } else {
                    let callback = shared.io_callbacks.lock().get(&event.key).cloned();
                    match callback {
                        Some(callback) => {
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                                shared.report.report("pool-io", &panic_text(&panic));
                            }
                        }
                        None => tracing::warn!("I/O completion for unknown key {}", event.key),
                    }
                }
            }
        }

        if LEAVE_POOL.with(|leave| leave.replace(false)) {
            stay_in_pool = false;
        }

        // High load with spare headroom above the minimum: leave
        if shared.cpu.sample() > CPU_LOAD_SHRINK_FLOOR
            && shared.current.load(Ordering::SeqCst) > shared.min_threads.load(Ordering::SeqCst)
        {
            stay_in_pool = false;
        }
        if let Some(abort) = shared.try_abort.lock().clone() {
            stay_in_pool = abort(stay_in_pool, false);
        }
    }

    shared.busy.fetch_sub(1, Ordering::SeqCst);
    shared.current.fetch_sub(1, Ordering::SeqCst);
    metrics::gauge!(METRICS_ID_POOL_WORKERS).decrement(1);
    shared.workers.lock().remove(&id);
    tracing::trace!(worker = id, "thread is leaving the pool");
}

fn run_job(shared: &Arc<PoolShared>, job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        shared.report.report("pool-worker", &panic_text(&panic));
    }
}

/// Renders a caught panic payload into loggable text.
pub(crate) fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with a non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TracingErrorReport;
    use std::sync::atomic::AtomicUsize;

    fn pool(min: usize, max: usize) -> WorkerPool {
        WorkerPool::with_bounds(min, max, Arc::new(TracingErrorReport))
    }

    #[test]
    fn bounds_hold_while_running() {
        let pool = pool(4, 10);
        pool.run();
        for _ in 0..50 {
            let current = pool.current_workers();
            assert!(current <= pool.max_threads());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(pool.current_workers() >= 2);
        pool.shutdown();
        assert_eq!(pool.current_workers(), 0);
    }

    #[test]
    fn submitted_work_runs() {
        let pool = pool(2, 10);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = Arc::clone(&done);
            pool.submit_work(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 20 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
        pool.shutdown();
    }

    #[test]
    fn submission_after_shutdown_is_rejected() {
        let pool = pool(2, 10);
        pool.run();
        pool.shutdown();
        let result = pool.submit_work(Box::new(|| {}));
        assert!(matches!(result, Err(PoolError::NotOpenForWork)));
    }

    #[test]
    fn cleanup_jobs_run_exactly_once_at_shutdown() {
        let pool = pool(2, 10);
        pool.run();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.submit_cleanup(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(pool.cleanup_jobs(), 3);
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(pool.cleanup_jobs(), 0);
    }

    #[test]
    fn shutdown_drains_and_returns_quickly() {
        let pool = pool(4, 8);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let done = Arc::clone(&done);
            pool.submit_work(Box::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
        let begun = std::time::Instant::now();
        pool.shutdown();
        assert!(begun.elapsed() < Duration::from_secs(30));
        assert_eq!(pool.current_workers(), 0);
        // Every item either completed or was dropped, never half-run
        assert!(done.load(Ordering::SeqCst) <= 100);
    }

    #[test]
    fn a_panicking_job_does_not_poison_the_pool() {
        let pool = pool(2, 10);
        pool.submit_work(Box::new(|| panic!("handler crash"))).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let after = Arc::clone(&done);
        pool.submit_work(Box::new(move || {
            after.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn io_completions_dispatch_to_their_callback() {
        let pool = pool(2, 10);
        pool.run();
        let seen = Arc::new(AtomicUsize::new(0));
        let callback_seen = Arc::clone(&seen);
        pool.associate_io(
            42,
            Arc::new(move |event: IoEvent| {
                assert_eq!(event.key, 42);
                callback_seen.fetch_add(event.bytes, Ordering::SeqCst);
            }),
        );
        pool.post_io(IoEvent { key: 42, bytes: 7, aborted: false }).unwrap();
        for _ in 0..200 {
            if seen.load(Ordering::SeqCst) == 7 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        pool.shutdown();
    }

    #[test]
    fn sleeping_workers_are_woken_by_shutdown() {
        let pool = pool(2, 10);
        let inner = pool.clone();
        pool.submit_work(Box::new(move || {
            // Parked forever unless shutdown wakes us
            let _ = inner.sleep_task(1001, WakePayload::None);
        }))
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let begun = std::time::Instant::now();
        pool.shutdown();
        assert!(begun.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn minimum_and_maximum_respect_each_other() {
        let pool = pool(4, 10);
        pool.run();
        assert!(!pool.try_set_minimum(1));
        assert!(!pool.try_set_minimum(pool.max_threads() + 1));
        assert!(pool.try_set_minimum(3));
        assert!(!pool.try_set_maximum(2));
        assert!(pool.try_set_maximum(pool.min_threads()));
        pool.shutdown();
    }

    #[test]
    fn extend_maximum_is_scoped() {
        let pool = pool(2, 10);
        pool.run();
        let before = pool.max_threads();
        {
            let _guard = pool.extend_maximum();
            assert_eq!(pool.max_threads(), before + 1);
        }
        assert_eq!(pool.max_threads(), before);
        pool.shutdown();
    }
}
