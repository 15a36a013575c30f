//! A fixed-size pool of worker threads draining a shared FIFO queue of tasks.
//!
//! The queue is an unbounded crossbeam channel.  Every worker holds a clone of the receiver and
//! blocks on it, so an idle worker costs nothing and a pushed task wakes exactly one of them.  The
//! pool itself holds the only sender, which makes shutdown simple: dropping the sender marks the
//! channel disconnected, after which `recv` keeps handing out whatever is still queued and then
//! fails once the queue is empty.  That failure is the worker's cue to exit.
//!
//! So "finish" means: stop accepting work, let the workers drain the queue, and wait for all of
//! them to exit.  A [`crossbeam::sync::WaitGroup`] tracks the workers still running, and the join
//! handles are joined afterwards so that no thread outlives the pool.
//!
//! Panics in tasks are caught and logged; a panicking task does not take its worker down with it.
use crate::error::PoolError;
use crate::executor::{panic_message, Executor, Task};
use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::sync::WaitGroup;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::*;

/// Source of unique pool ids, so a worker thread can tell which pool it belongs to
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pool whose worker is the current thread, or 0 for threads that aren't workers
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Worker pool settings
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to start.  Zero is treated as one.
    pub workers: usize,

    /// Worker threads are named `<thread_name>-<index>`
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            thread_name: "jsonrpc-worker".to_string(),
        }
    }
}

/// The number of workers to use when the caller doesn't say: one per available CPU
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// A pool of worker threads executing tasks in FIFO order.
///
/// The lifecycle is create, [`start`](Self::start), [`push`](Self::push) any number of times,
/// then [`finish`](Self::finish).  Tasks can be pushed before the pool is started; they wait in
/// the queue until there are workers to run them.  Dropping the pool finishes it.
///
/// There is no ordering guarantee between tasks beyond the order in which workers dequeue them.
/// With more than one worker, tasks can complete in any order.
///
/// A task must not call [`finish`](Self::finish) on (or drop the last handle to) the pool that is
/// running it, since that would wait for the task itself.  If it does anyway, the pool stops
/// accepting work but the call returns immediately without waiting.
pub struct WorkerPool {
    id: usize,
    thread_name: String,

    /// `None` once shutdown has begun
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,

    running: Arc<AtomicUsize>,
    state: Mutex<PoolState>,

    /// Notified when the first `finish` call has joined every worker
    finished: Condvar,
}

/// Never held while waiting on workers, so tasks can still query the pool during `finish`
struct PoolState {
    started: bool,
    workers: Vec<JoinHandle<()>>,

    /// Each worker holds a clone; `None` once some `finish` call has taken it to wait on
    drained: Option<WaitGroup>,

    /// Set after the `finish` that took `drained` has joined every worker
    finished: bool,
}

impl WorkerPool {
    /// Create a pool with no workers.  Nothing runs until [`start`](Self::start) is called.
    pub fn new() -> Self {
        Self::with_thread_name(WorkerPoolConfig::default().thread_name)
    }

    fn with_thread_name(thread_name: String) -> Self {
        let (sender, receiver) = unbounded();

        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            thread_name,
            sender: Mutex::new(Some(sender)),
            receiver,
            running: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(PoolState {
                started: false,
                workers: Vec::new(),
                drained: Some(WaitGroup::new()),
                finished: false,
            }),
            finished: Condvar::new(),
        }
    }

    /// Create a pool and immediately start it as the config describes
    pub fn with_config(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        let pool = Self::with_thread_name(config.thread_name);
        pool.start(config.workers)?;
        Ok(pool)
    }

    /// Spawn `workers` worker threads (at least one).
    ///
    /// A pool can only be started once, and not at all after [`finish`](Self::finish).
    ///
    /// Workers run inside a span that is a child of the caller's current span, so whatever
    /// context the caller logs with follows the work onto the worker threads.
    #[instrument(skip(self), fields(pool = self.id))]
    pub fn start(&self, workers: usize) -> Result<(), PoolError> {
        let mut state = self.state.lock();

        if state.started {
            return Err(PoolError::AlreadyStarted);
        }
        let Some(drained) = state.drained.clone() else {
            return Err(PoolError::ShutDown);
        };
        if self.sender.lock().is_none() {
            return Err(PoolError::ShutDown);
        }
        state.started = true;

        let workers = workers.max(1);
        let current_span = Span::current();

        for index in 0..workers {
            let receiver = self.receiver.clone();
            let running = self.running.clone();
            let drained = drained.clone();
            let current_span = current_span.clone();
            let pool_id = self.id;

            self.running.fetch_add(1, Ordering::AcqRel);

            let handle = thread::Builder::new()
                .name(format!("{}-{index}", self.thread_name))
                .spawn(move || {
                    let span = debug_span!(parent: &current_span, "worker", index);
                    let _guard = span.enter();

                    CURRENT_POOL.with(|pool| pool.set(pool_id));
                    run_worker(receiver, running, drained);
                })
                .map_err(|source| {
                    self.running.fetch_sub(1, Ordering::AcqRel);
                    error!(index, error = %source, "Failed to spawn worker thread");
                    PoolError::Spawn { index, source }
                })?;

            state.workers.push(handle);
        }

        debug!(workers, "Worker pool started");
        Ok(())
    }

    /// Start with one worker per available CPU
    pub fn start_default(&self) -> Result<(), PoolError> {
        self.start(default_worker_count())
    }

    /// Add a task to the end of the queue.
    ///
    /// Fails with [`PoolError::ShutDown`] once [`finish`](Self::finish) has been called; the task
    /// is dropped without running.
    pub fn push<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_task(Box::new(task))
    }

    fn push_task(&self, task: Task) -> Result<(), PoolError> {
        let sender = self.sender.lock();

        let Some(sender) = sender.as_ref() else {
            debug!(pool = self.id, "Rejecting task because the pool is shutting down");
            return Err(PoolError::ShutDown);
        };

        // The pool holds a receiver for its whole lifetime, so this can't be disconnected
        sender.send(task).map_err(|_| PoolError::ShutDown)
    }

    /// Stop accepting tasks, run everything already queued, and wait until every worker has
    /// exited.
    ///
    /// Idempotent; calls after the first (including from `Drop`) return once the first has
    /// completed.  If the pool was never started there is nobody to run the queued tasks, so they
    /// are discarded.
    pub fn finish(&self) {
        if CURRENT_POOL.with(Cell::get) == self.id {
            // Waiting here would mean waiting for this very thread
            error!(
                pool = self.id,
                "finish called from one of the pool's own workers; shutting down without waiting"
            );
            self.sender.lock().take();
            return;
        }

        let (drained, workers) = {
            let mut state = self.state.lock();

            if let Some(sender) = self.sender.lock().take() {
                debug!(pool = self.id, queued = sender.len(), "Worker pool shutting down");
            }

            let Some(drained) = state.drained.take() else {
                // Another call got here first; wait for it to finish the job
                while !state.finished {
                    self.finished.wait(&mut state);
                }
                return;
            };

            if !state.started {
                let discarded = self.receiver.try_iter().count();
                if discarded > 0 {
                    warn!(
                        pool = self.id,
                        discarded, "Worker pool finished without ever being started; queued tasks discarded"
                    );
                }
            }

            (drained, std::mem::take(&mut state.workers))
        };

        drained.wait();

        for handle in workers {
            if handle.join().is_err() {
                // Tasks can't panic their worker, so this is a bug in the worker loop itself
                error!(pool = self.id, "Worker thread panicked");
            }
        }

        self.state.lock().finished = true;
        self.finished.notify_all();
    }

    /// The number of worker threads that have not yet exited
    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// The number of tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        self.push_task(task)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("thread_name", &self.thread_name)
            .field("running", &self.running_workers())
            .field("queued", &self.queued())
            .finish()
    }
}

fn run_worker(receiver: Receiver<Task>, running: Arc<AtomicUsize>, drained: WaitGroup) {
    debug!("Worker thread started");

    // Blocks while the queue is empty and the pool is still accepting work.  After shutdown it
    // keeps yielding queued tasks until the queue is empty, then ends.
    for task in receiver.iter() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                panic = panic_message(payload.as_ref()),
                "Task panicked; worker continues with the next task"
            );
        }
    }

    let remaining = running.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 {
        debug!("Last worker exiting; queue is drained");
    } else {
        debug!(remaining, "Worker thread exiting");
    }

    drop(drained);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::init_test_logging;
    use assert_matches::assert_matches;
    use rand::Rng;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn every_task_runs_exactly_once() {
        init_test_logging();

        const TASKS: usize = 10_000;
        let counters: Arc<Vec<AtomicUsize>> =
            Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());

        let pool = WorkerPool::new();
        pool.start(4).unwrap();

        for index in 0..TASKS {
            let counters = counters.clone();
            pool.push(move || {
                counters[index].fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.finish();

        assert!(counters
            .iter()
            .all(|counter| counter.load(Ordering::SeqCst) == 1));
        assert_eq!(pool.running_workers(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn random_sums() {
        init_test_logging();

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let n: u64 = rng.gen_range(0..1000);
            let workers = rng.gen_range(1..8);
            let sum = Arc::new(AtomicU64::new(0));

            let pool = WorkerPool::new();
            pool.start(workers).unwrap();
            for i in 0..n {
                let sum = sum.clone();
                pool.push(move || {
                    sum.fetch_add(i, Ordering::SeqCst);
                })
                .unwrap();
            }
            pool.finish();

            assert_eq!(sum.load(Ordering::SeqCst), n * n.saturating_sub(1) / 2);
        }
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        init_test_logging();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = WorkerPool::new();
        pool.start(1).unwrap();

        for i in 0..100 {
            let seen = seen.clone();
            pool.push(move || seen.lock().push(i)).unwrap();
        }
        pool.finish();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn finish_waits_for_slow_tasks() {
        init_test_logging();

        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new();
        pool.start(2).unwrap();

        for _ in 0..6 {
            let done = done.clone();
            pool.push(move || {
                thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.finish();

        assert_eq!(done.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn tasks_pushed_before_start_run_after_start() {
        init_test_logging();

        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new();

        for _ in 0..10 {
            let done = done.clone();
            pool.push(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(pool.queued(), 10);
        assert_eq!(done.load(Ordering::SeqCst), 0);

        pool.start(3).unwrap();
        pool.finish();

        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn lifecycle_misuse_is_reported() {
        init_test_logging();

        let pool = WorkerPool::new();
        assert!(!pool.is_started());
        pool.start(0).unwrap();
        assert!(pool.is_started());
        assert_eq!(pool.running_workers(), 1, "zero workers is floored to one");

        assert_matches!(pool.start(2), Err(PoolError::AlreadyStarted));

        pool.finish();
        assert_matches!(pool.push(|| {}), Err(PoolError::ShutDown));

        // Finishing twice is harmless
        pool.finish();
    }

    #[test]
    fn finish_without_start_discards_queue() {
        init_test_logging();

        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new();
        {
            let done = done.clone();
            pool.push(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.finish();

        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(pool.queued(), 0);
        assert_matches!(pool.start(1), Err(PoolError::ShutDown));
    }

    #[test]
    fn drop_finishes_pool() {
        init_test_logging();

        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::with_config(WorkerPoolConfig {
                workers: 2,
                thread_name: "drop-test".to_string(),
            })
            .unwrap();

            for _ in 0..50 {
                let done = done.clone();
                pool.push(move || {
                    thread::sleep(Duration::from_millis(1));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }

        assert_eq!(done.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        init_test_logging();

        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new();
        pool.start(1).unwrap();

        pool.push(|| panic!("task failure")).unwrap();
        {
            let done = done.clone();
            pool.push(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.finish();

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_threads_are_named() {
        init_test_logging();

        let names = Arc::new(Mutex::new(Vec::new()));
        let pool = WorkerPool::with_config(WorkerPoolConfig {
            workers: 1,
            thread_name: "named".to_string(),
        })
        .unwrap();

        {
            let names = names.clone();
            pool.push(move || {
                names
                    .lock()
                    .push(thread::current().name().map(str::to_string));
            })
            .unwrap();
        }
        pool.finish();

        assert_eq!(*names.lock(), vec![Some("named-0".to_string())]);
    }

    #[test]
    fn start_default_uses_available_parallelism() {
        init_test_logging();

        let pool = WorkerPool::new();
        pool.start_default().unwrap();

        assert_eq!(pool.running_workers(), default_worker_count());
        assert!(pool.running_workers() >= 1);
        assert_matches!(pool.start_default(), Err(PoolError::AlreadyStarted));

        pool.finish();
        assert_eq!(pool.running_workers(), 0);
    }

    #[test]
    fn tasks_can_query_pool_while_it_finishes() {
        init_test_logging();

        let pool = Arc::new(WorkerPool::new());
        pool.start(1).unwrap();

        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let task_pool = pool.clone();
            let observed = observed.clone();
            pool.push(move || {
                // Give `finish` time to start waiting before touching the pool
                thread::sleep(Duration::from_millis(100));
                let started = task_pool.is_started();
                let restarted = task_pool.start(1);
                observed.lock().push((started, restarted.is_err()));
            })
            .unwrap();
        }

        let (done_sender, done_receiver) = crossbeam::channel::bounded(1);
        let finisher = {
            let pool = pool.clone();
            thread::spawn(move || {
                pool.finish();
                let _ = done_sender.send(());
            })
        };

        assert!(
            done_receiver.recv_timeout(Duration::from_secs(10)).is_ok(),
            "finish did not return"
        );
        finisher.join().unwrap();

        assert_eq!(*observed.lock(), vec![(true, true)]);
    }

    #[test]
    fn concurrent_finish_calls_all_wait_for_drain() {
        init_test_logging();

        const TASKS: usize = 20;
        let done = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(WorkerPool::new());
        pool.start(2).unwrap();

        for _ in 0..TASKS {
            let done = done.clone();
            pool.push(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let finishers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let done = done.clone();
                thread::spawn(move || {
                    pool.finish();
                    done.load(Ordering::SeqCst)
                })
            })
            .collect();

        for finisher in finishers {
            assert_eq!(finisher.join().unwrap(), TASKS);
        }
        assert_eq!(pool.running_workers(), 0);
    }

    #[test]
    fn finish_from_own_worker_does_not_deadlock() {
        init_test_logging();

        let pool = Arc::new(WorkerPool::new());
        pool.start(2).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        {
            let inner_pool = pool.clone();
            let done = done.clone();
            pool.push(move || {
                inner_pool.finish();
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.finish();

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_matches!(pool.push(|| {}), Err(PoolError::ShutDown));
    }
}
