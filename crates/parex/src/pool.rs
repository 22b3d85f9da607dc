//! The thread pool: a worker set draining a concurrent work-stealing queue,
//! with recursion-aware inline-execution fallback to avoid deadlock when a
//! pool task submits more work to its own pool.
//!
//! The queue is built on [`crossbeam::deque`]: each worker owns a local
//! [`Worker`] deque, and the pool holds a shared [`Injector`] that
//! `schedule` pushes onto. Workers drain their own local deque first, then
//! steal from the injector, then from each other's stealers — the standard
//! crossbeam work-stealing pattern, which is also what lets [`TaskSet::wait`]
//! (see `crate::task_set`) steal and run tasks from the same pool it is
//! waiting on.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::deque::{Injector, Steal, Stealer, Worker};

use parex_sync::{OnceCallable, PoolRegistration};

use crate::error::PoolError;

/// A marker that forces [`ThreadPool::schedule`] to always enqueue rather
/// than ever run inline. Useful when the caller must not grow its own
/// stack, e.g. to bound worst-case recursion depth.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForceQueuing;

/// Construction options for [`ThreadPool`].
#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    /// Number of worker threads to spawn.
    pub num_threads: usize,
    /// Multiplier applied to `num_threads` to get the load factor above
    /// which non-recursive `schedule` calls run inline. Defaults to 32,
    /// matching the original implementation's `poolLoadMultiplier`.
    pub load_multiplier: usize,
    /// Prefix used for OS thread names (`"{prefix}-{n}"`).
    pub thread_name_prefix: &'static str,
}

impl PoolOptions {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            load_multiplier: 32,
            thread_name_prefix: "parex-worker",
        }
    }

    pub fn load_multiplier(mut self, multiplier: usize) -> Self {
        self.load_multiplier = multiplier;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: &'static str) -> Self {
        self.thread_name_prefix = prefix;
        self
    }
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

struct WorkerHandle {
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct PoolShared {
    id: usize,
    injector: Injector<OnceCallable>,
    work_remaining: AtomicIsize,
    num_threads: AtomicUsize,
    load_multiplier: usize,
    load_factor: AtomicIsize,
    /// Producer lanes registered by single-producer `TaskSet`s. A lane is a
    /// `TaskSet`'s own local `Worker` deque, exposed here as a `Stealer` so
    /// that pool workers (and other task sets' `wait`) can help drain it —
    /// this is `parex`'s analog of moodycamel's `ProducerToken`: cache
    /// affinity for the owning thread's push/pop, without requiring every
    /// other thread to go through the shared injector.
    lanes: Mutex<Vec<Option<Stealer<OnceCallable>>>>,
}

impl PoolShared {
    fn quick_load_factor(&self) -> isize {
        let n = self.num_threads.load(Ordering::Relaxed) as isize;
        n + n / 2
    }
}

/// The pool itself: a worker set plus the shared queue/counters they drain.
///
/// `resize` and `Drop` serialize against each other and against themselves
/// via `resize_lock`; everything else (`schedule`) is lock-free on the
/// common path.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<WorkerHandle>>,
    resize_lock: Mutex<()>,
    thread_name_prefix: &'static str,
}

impl ThreadPool {
    /// Construct a pool with `n` worker threads and the default load
    /// multiplier (32).
    pub fn new(n: usize) -> Result<Self, PoolError> {
        Self::with_options(PoolOptions::new(n))
    }

    pub fn with_options(options: PoolOptions) -> Result<Self, PoolError> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(PoolShared {
            id,
            injector: Injector::new(),
            work_remaining: AtomicIsize::new(0),
            num_threads: AtomicUsize::new(0),
            load_multiplier: options.load_multiplier,
            load_factor: AtomicIsize::new(0),
            lanes: Mutex::new(Vec::new()),
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::new()),
            resize_lock: Mutex::new(()),
            thread_name_prefix: options.thread_name_prefix,
        };

        pool.spawn_workers(options.num_threads)?;
        Ok(pool)
    }

    /// Process-wide unique identifier for this pool, used by
    /// [`parex_sync::PoolRegistration`] to detect recursive submission.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn num_threads(&self) -> usize {
        self.shared.num_threads.load(Ordering::Relaxed)
    }

    /// A racy snapshot of `enqueued - completed`. Exposed for diagnostics
    /// and tests, not for synchronization.
    pub fn work_remaining(&self) -> isize {
        self.shared.work_remaining.load(Ordering::Relaxed)
    }

    fn spawn_workers(&self, n: usize) -> Result<(), PoolError> {
        let mut workers = self.workers.lock().unwrap();
        for i in 0..n {
            let local = Worker::new_fifo();
            let running = Arc::new(AtomicBool::new(true));
            let join = spawn_worker_thread(
                self.thread_name_prefix,
                workers.len() + i,
                self.shared.clone(),
                local,
                running.clone(),
            )?;
            workers.push(WorkerHandle {
                running,
                join: Some(join),
            });
        }
        self.shared.num_threads.store(workers.len(), Ordering::Relaxed);
        self.shared.load_factor.store(
            (workers.len() * self.shared.load_multiplier) as isize,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Grow or shrink the worker set. Must not be called concurrently with
    /// itself; a concurrent call returns [`PoolError::ResizeInProgress`]
    /// rather than blocking, since `spec.md` treats overlapping resizes as
    /// a contract violation rather than something to serialize
    /// transparently.
    pub fn resize(&self, n: usize) -> Result<(), PoolError> {
        let _guard = self
            .resize_lock
            .try_lock()
            .map_err(|_| PoolError::ResizeInProgress)?;

        let mut workers = self.workers.lock().unwrap();
        let current = workers.len();
        if n < current {
            for w in &workers[n..] {
                w.running.store(false, Ordering::Release);
            }
            for w in &mut workers[n..] {
                if let Some(join) = w.join.take() {
                    let _ = join.join();
                }
            }
            workers.truncate(n);
            self.shared.num_threads.store(n, Ordering::Relaxed);
            self.shared
                .load_factor
                .store((n * self.shared.load_multiplier) as isize, Ordering::Relaxed);
        } else if n > current {
            drop(workers);
            self.spawn_workers(n - current)?;
        } else {
            self.shared
                .load_factor
                .store((n * self.shared.load_multiplier) as isize, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Schedule `f` for execution. May run inline on the calling thread per
    /// `spec.md` §4.1: either the caller is itself a worker of this pool
    /// and the pool is heavily loaded (`> 1.5x` thread count), or the pool
    /// is loaded past its configured multiplier (default `32x`) regardless
    /// of caller.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cur_work = self.shared.work_remaining.load(Ordering::Relaxed);
        let is_recursive = PoolRegistration::depth(self.shared.id) > 0;
        let quick_load = self.shared.quick_load_factor();
        let load_factor = self.shared.load_factor.load(Ordering::Relaxed);

        if (is_recursive && cur_work > quick_load) || cur_work > load_factor {
            f();
        } else {
            self.schedule_force_queuing(f);
        }
    }

    /// Schedule `f`, always enqueuing rather than ever running it inline.
    pub fn schedule_force_queuing<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.work_remaining.fetch_add(1, Ordering::Release);
        self.shared.injector.push(OnceCallable::new(f));
    }

    /// Attempt to steal and run a single task from this pool's shared
    /// injector (not from any registered lane). Returns `true` if a task
    /// was found and executed. Used by [`crate::task_set::ConcurrentTaskSet::wait`]
    /// and by the pool's own drain-on-drop.
    pub(crate) fn try_steal_and_run(&self) -> bool {
        loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => {
                    task.call();
                    self.shared.work_remaining.fetch_add(-1, Ordering::Relaxed);
                    return true;
                }
                Steal::Retry => continue,
                Steal::Empty => return false,
            }
        }
    }

    /// Attempt to steal and run one task from any registered `TaskSet` lane.
    /// Used by the worker loop and by `ConcurrentTaskSet::wait`/`tryWait` to
    /// help drain single-producer task sets so they don't depend solely on
    /// their own thread.
    pub(crate) fn try_steal_from_lanes(&self) -> bool {
        steal_from_lanes(&self.shared)
    }

    /// Account for work pushed directly onto a registered lane rather than
    /// the shared injector, so the pool's own load-based inline-execution
    /// heuristics (and `work_remaining`) still see it.
    pub(crate) fn note_external_work(&self, delta: isize) {
        self.shared.work_remaining.fetch_add(delta, Ordering::Release);
    }

    /// Register a `TaskSet`'s local deque as a producer lane, returning an
    /// id to later unregister it. Pool workers will help steal from it.
    pub(crate) fn register_lane(&self, stealer: Stealer<OnceCallable>) -> usize {
        let mut lanes = self.shared.lanes.lock().unwrap();
        lanes.push(Some(stealer));
        lanes.len() - 1
    }

    /// Remove a previously registered lane. Called once the owning
    /// `TaskSet` has drained its local deque in `wait`/`Drop`.
    pub(crate) fn unregister_lane(&self, lane_id: usize) {
        let mut lanes = self.shared.lanes.lock().unwrap();
        if let Some(slot) = lanes.get_mut(lane_id) {
            *slot = None;
        }
    }

    pub(crate) fn shared_id(&self) -> usize {
        self.shared.id
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let mut workers = self.workers.lock().unwrap();
        for w in workers.iter() {
            w.running.store(false, Ordering::Release);
        }
        // Drain whatever remains on the dropping thread, same as the
        // worker loop itself would, before joining. Lanes belonging to
        // still-live `TaskSet`s are expected to have been drained by their
        // own `wait`/`Drop` already, but a pool dropped out from under a
        // `ForceQueuing`-only submitter could still have lane work left.
        while self.try_steal_and_run() || self.try_steal_from_lanes() {}
        for w in workers.iter_mut() {
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn spawn_worker_thread(
    prefix: &'static str,
    index: usize,
    shared: Arc<PoolShared>,
    local: Worker<OnceCallable>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, PoolError> {
    thread::Builder::new()
        .name(format!("{prefix}-{index}"))
        .spawn(move || worker_loop(shared, local, running))
        .map_err(PoolError::SpawnFailed)
}

fn worker_loop(shared: Arc<PoolShared>, local: Worker<OnceCallable>, running: Arc<AtomicBool>) {
    const SLEEP_DURATION: Duration = Duration::from_micros(100);
    const BACKOFF_YIELD: u32 = 50;
    const BACKOFF_SLEEP: u32 = BACKOFF_YIELD + 5;

    log::trace!("parex pool {}: worker starting", shared.id);
    let _registration = PoolRegistration::enter(shared.id);

    let mut fail_count: u32 = 0;
    loop {
        let still_running = running.load(Ordering::Relaxed);
        let remaining = shared.work_remaining.load(Ordering::Relaxed) > 0;
        if !still_running && !remaining {
            break;
        }

        if let Some(task) = find_task(&local, &shared) {
            task.call();
            shared.work_remaining.fetch_add(-1, Ordering::Relaxed);
            fail_count = 0;
            continue;
        }

        if steal_from_lanes(&shared) {
            fail_count = 0;
            continue;
        }

        fail_count += 1;
        std::hint::spin_loop();
        if fail_count > BACKOFF_SLEEP {
            thread::sleep(SLEEP_DURATION);
        } else if fail_count > BACKOFF_YIELD {
            thread::yield_now();
        }
    }

    log::trace!("parex pool {}: worker stopping", shared.id);
}

/// Try to steal and run one task from any registered `TaskSet` lane.
fn steal_from_lanes(shared: &PoolShared) -> bool {
    let task = {
        let lanes = shared.lanes.lock().unwrap();
        let mut found = None;
        for lane in lanes.iter().flatten() {
            loop {
                match lane.steal() {
                    Steal::Success(task) => {
                        found = Some(task);
                        break;
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
            if found.is_some() {
                break;
            }
        }
        found
    };
    match task {
        Some(task) => {
            task.call();
            shared.work_remaining.fetch_add(-1, Ordering::Relaxed);
            true
        }
        None => false,
    }
}

/// Pull a task from the local deque, falling back to stealing from the
/// shared injector. Peer-to-peer stealing between workers is intentionally
/// left to the injector alone in this design: every task set and the pool
/// itself only ever submit through the injector, so workers contend there
/// rather than needing an all-pairs stealer scan.
fn find_task(local: &Worker<OnceCallable>, shared: &PoolShared) -> Option<OnceCallable> {
    if let Some(task) = local.pop() {
        return Some(task);
    }
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Retry => continue,
            Steal::Empty => return None,
        }
    }
}
