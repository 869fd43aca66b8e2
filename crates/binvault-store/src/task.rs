//! Bounded parallel execution of maintenance work across stores.
//!
//! A [`MaintenanceTask`] turns each selected store into a lazy stream of
//! units. The [`ParallelTaskRunner`] submits them to a [`WorkerPool`] with a
//! fixed number of threads and a bounded queue; when the queue is full the
//! coordinating thread runs the unit itself. Cancellation is checked before
//! every submission and while waiting for the pool to drain.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::StoreResult;
use crate::store::BlobStore;

/// Selection sentinel meaning every registered store.
pub const ALL_STORES: &str = "*";

/// Worker pool and progress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelTaskConfig {
    /// Worker threads (default: 4).
    pub max_threads: usize,
    /// Units that may wait in the queue before callers run them (default: 64).
    pub queue_capacity: usize,
    /// Seconds between progress log lines (default: 60).
    pub progress_interval_secs: u64,
    /// Coordinator sleep while waiting for the pool, in ms (default: 10).
    pub poll_interval_ms: u64,
}

impl Default for ParallelTaskConfig {
    fn default() -> Self {
        Self {
            max_threads: 4,
            queue_capacity: 64,
            progress_interval_secs: 60,
            poll_interval_ms: 10,
        }
    }
}

/// One unit of maintenance work.
pub type Unit = Box<dyn FnOnce() -> StoreResult<()> + Send + 'static>;

/// Lazy, finite sequence of units for one store.
pub type JobStream = Box<dyn Iterator<Item = Unit> + Send>;

/// Resolves store names for task selection.
pub trait StoreLookup: Send + Sync {
    /// Every registered store name.
    fn store_names(&self) -> Vec<String>;
    /// The named store, if registered.
    fn lookup(&self, name: &str) -> Option<Arc<dyn BlobStore>>;
}

/// A maintenance job that runs per store.
pub trait MaintenanceTask: Send + Sync {
    /// Accumulated result returned after the run.
    type Output;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether the task runs against `store`.
    fn applies_to(&self, _store: &dyn BlobStore) -> bool {
        true
    }

    /// Units of work for one store, produced lazily.
    fn job_stream(&self, store: Arc<dyn BlobStore>, cancel: &CancelToken) -> StoreResult<JobStream>;

    /// Result accumulated by the units run so far.
    fn result(&self) -> Self::Output;
}

/// Resolves a comma-separated selection against the registry.
///
/// The [`ALL_STORES`] sentinel selects every registered store. Unknown names
/// are skipped and each store is returned at most once.
pub fn select_stores(
    lookup: &dyn StoreLookup,
    selection: &str,
    applies_to: impl Fn(&dyn BlobStore) -> bool,
) -> Vec<Arc<dyn BlobStore>> {
    let requested: Vec<String> = selection
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let names = if requested.iter().any(|n| n == ALL_STORES) {
        lookup.store_names()
    } else {
        requested
    };

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for name in names {
        if !seen.insert(name.clone()) {
            continue;
        }
        match lookup.lookup(&name) {
            Some(store) if applies_to(store.as_ref()) => selected.push(store),
            Some(_) => debug!("Store '{}' not applicable, skipping", name),
            None => debug!("Store '{}' not found, skipping", name),
        }
    }
    selected
}

struct PoolState {
    queue: VecDeque<Unit>,
    active: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: usize,
    max_threads: usize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl PoolShared {
    fn record(&self, result: StoreResult<()>) {
        match result {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Maintenance unit failed: {}", err);
            }
        }
    }
}

/// Releases a worker's active slot even if its unit panics.
struct ActiveSlot<'a>(&'a PoolShared);

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.0.state.lock().active -= 1;
    }
}

/// Fixed-size thread pool with a bounded queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `max_threads` workers (at least one) over a queue of `capacity`.
    pub fn new(max_threads: usize, capacity: usize) -> StoreResult<Self> {
        let max_threads = max_threads.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::with_capacity(capacity),
                active: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity,
            max_threads,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let mut workers = Vec::with_capacity(max_threads);
        for i in 0..max_threads {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("binvault-task-{}", i))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        Ok(Self { shared, workers })
    }

    /// Queues a unit. Hands it back when the queue is full or shut down.
    pub fn submit(&self, unit: Unit) -> Result<(), Unit> {
        let mut state = self.shared.state.lock();
        if state.shutdown || state.queue.len() >= self.shared.capacity {
            return Err(unit);
        }
        state.queue.push_back(unit);
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Pops a queued unit for the caller while some worker is idle.
    pub fn take_if_idle(&self) -> Option<Unit> {
        let mut state = self.shared.state.lock();
        if state.active < self.shared.max_threads {
            state.queue.pop_front()
        } else {
            None
        }
    }

    /// Runs a unit on the calling thread, counting its outcome.
    pub fn run_here(&self, unit: Unit) {
        self.shared.record(unit());
    }

    /// No unit is queued or running.
    pub fn is_quiescent(&self) -> bool {
        let state = self.shared.state.lock();
        state.queue.is_empty() && state.active == 0
    }

    /// Units that finished successfully.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Units that returned an error or panicked.
    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Stops the pool without waiting; returns the number of queued units dropped.
    ///
    /// Units already running finish on their worker, which then exits.
    pub fn shutdown_now(&mut self) -> usize {
        let abandoned = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            let n = state.queue.len();
            state.queue.clear();
            n
        };
        self.shared.available.notify_all();
        self.workers.clear();
        abandoned
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let unit = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(unit) = state.queue.pop_front() {
                    state.active += 1;
                    break unit;
                }
                shared.available.wait(&mut state);
            }
        };
        let slot = ActiveSlot(shared);
        shared.record(unit());
        drop(slot);
    }
}

/// Outcome of one task run.
#[derive(Debug, Clone)]
pub struct TaskReport<T> {
    /// Task name.
    pub task: String,
    /// Stores the task ran against.
    pub stores: Vec<String>,
    /// Units produced by the job streams.
    pub units_submitted: u64,
    /// Units that succeeded.
    pub units_completed: u64,
    /// Units that failed.
    pub units_failed: u64,
    /// The task's accumulated result.
    pub output: T,
}

struct ProgressLog {
    interval: Duration,
    last: Instant,
}

impl ProgressLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    fn tick(&mut self, task: &str, pool: &WorkerPool, submitted: u64) {
        if self.last.elapsed() < self.interval {
            return;
        }
        self.last = Instant::now();
        info!(
            "Task '{}' progress: {} submitted, {} completed, {} failed",
            task,
            submitted,
            pool.completed(),
            pool.failed()
        );
    }
}

/// Drives maintenance tasks over a bounded pool.
pub struct ParallelTaskRunner {
    config: ParallelTaskConfig,
}

impl ParallelTaskRunner {
    /// Creates a runner.
    pub fn new(config: ParallelTaskConfig) -> Self {
        Self { config }
    }

    /// Runs `task` against the stores named by `selection`.
    ///
    /// The pool is shut down on every path; queued work is abandoned when the
    /// run is cancelled or a job stream fails.
    pub fn run<T: MaintenanceTask + ?Sized>(
        &self,
        task: &T,
        lookup: &dyn StoreLookup,
        selection: &str,
        cancel: &CancelToken,
    ) -> StoreResult<TaskReport<T::Output>> {
        let stores = select_stores(lookup, selection, |s| task.applies_to(s));
        let names: Vec<String> = stores.iter().map(|s| s.name().to_string()).collect();
        info!(
            "Running task '{}' over {} stores: {:?}",
            task.name(),
            names.len(),
            names
        );

        let mut pool = WorkerPool::new(self.config.max_threads, self.config.queue_capacity)?;
        let outcome = self.drive(task, stores, &pool, cancel);
        let abandoned = pool.shutdown_now();
        if abandoned > 0 {
            warn!(
                "Task '{}' abandoned {} queued units on shutdown",
                task.name(),
                abandoned
            );
        }
        let submitted = outcome?;

        let report = TaskReport {
            task: task.name().to_string(),
            stores: names,
            units_submitted: submitted,
            units_completed: pool.completed(),
            units_failed: pool.failed(),
            output: task.result(),
        };
        info!(
            "Task '{}' finished: {} units, {} failed",
            report.task, report.units_submitted, report.units_failed
        );
        Ok(report)
    }

    fn drive<T: MaintenanceTask + ?Sized>(
        &self,
        task: &T,
        stores: Vec<Arc<dyn BlobStore>>,
        pool: &WorkerPool,
        cancel: &CancelToken,
    ) -> StoreResult<u64> {
        let context = format!("task '{}'", task.name());
        let mut progress = ProgressLog::new(Duration::from_secs(self.config.progress_interval_secs));
        let mut submitted = 0u64;

        for store in stores {
            debug!("Task '{}' submitting units for '{}'", task.name(), store.name());
            for unit in task.job_stream(store, cancel)? {
                cancel.check(&context)?;
                if let Err(unit) = pool.submit(unit) {
                    pool.run_here(unit);
                }
                submitted += 1;
                progress.tick(task.name(), pool, submitted);
            }
        }

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        while !pool.is_quiescent() {
            cancel.check(&context)?;
            if let Some(unit) = pool.take_if_idle() {
                pool.run_here(unit);
                continue;
            }
            thread::sleep(poll);
            progress.tick(task.name(), pool, submitted);
        }
        Ok(submitted)
    }
}
