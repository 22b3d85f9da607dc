//! A single driver thread that pops a min-heap of scheduled callbacks and
//! dispatches expired ones through an arbitrary [`Invoker`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Where a [`TimedTask`]'s functor actually runs once its deadline expires.
/// An object-safe trait so a [`TimedTaskScheduler`] can be backed by the
/// global pool, a dedicated pool, or run tasks inline, without this module
/// depending on `ThreadPool` directly.
pub trait Invoker: Send + Sync {
    fn invoke(&self, f: Box<dyn FnOnce() + Send>);
}

/// Runs the functor synchronously on the scheduler's own driver thread.
#[derive(Default)]
pub struct InlineInvoker;

impl Invoker for InlineInvoker {
    fn invoke(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }
}

struct TimedTaskState {
    next_run: Mutex<Instant>,
    period: Option<Duration>,
    times_to_run: Mutex<Option<u64>>,
    in_progress: AtomicBool,
    cancelled: AtomicBool,
    detached: AtomicBool,
    functor: Mutex<Box<dyn FnMut() -> bool + Send>>,
}

/// A handle to a single scheduled (optionally repeating) callback. Dropping
/// the last handle without calling [`TimedTask::detach`] cancels the task
/// the next time it would otherwise run.
pub struct TimedTask {
    state: Arc<TimedTaskState>,
}

impl TimedTask {
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Let the task keep running after every handle to it is dropped.
    pub fn detach(self) {
        self.state.detached.store(true, Ordering::Release);
    }
}

impl Drop for TimedTask {
    fn drop(&mut self) {
        if !self.state.detached.load(Ordering::Acquire) {
            self.state.cancelled.store(true, Ordering::Release);
        }
    }
}

enum Backing {
    Invoker(Arc<dyn Invoker>),
}

struct Entry {
    deadline: Instant,
    seq: u64,
    state: Arc<TimedTaskState>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct SchedulerShared {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    wakeup: Condvar,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
    invoker: Backing,
}

/// A single background thread driving any number of [`TimedTask`]s,
/// dispatching expired ones through its backing [`Invoker`].
pub struct TimedTaskScheduler {
    shared: Arc<SchedulerShared>,
    driver: Option<JoinHandle<()>>,
}

impl TimedTaskScheduler {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        let shared = Arc::new(SchedulerShared {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            next_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            invoker: Backing::Invoker(invoker),
        });
        let driver_shared = shared.clone();
        let driver = std::thread::Builder::new()
            .name("parex-timed-task".into())
            .spawn(move || driver_loop(driver_shared))
            .expect("failed to spawn timed-task driver thread");
        Self {
            shared,
            driver: Some(driver),
        }
    }

    /// Schedule `f` to run once after `delay`. Per spec.md §9's resolved
    /// open question, even a zero delay is handed to the driver thread
    /// rather than run synchronously on the calling thread.
    pub fn schedule_once(&self, delay: Duration, f: impl FnMut() -> bool + Send + 'static) -> TimedTask {
        self.schedule_periodic(delay, None, Some(1), f)
    }

    /// Schedule `f` to run every `period`, starting after `initial_delay`,
    /// for `times_to_run` repetitions (`None` for unbounded). `f` returns
    /// whether it should keep being rescheduled (a `false` return is
    /// equivalent to the task cancelling itself).
    pub fn schedule_periodic(
        &self,
        initial_delay: Duration,
        period: Option<Duration>,
        times_to_run: Option<u64>,
        f: impl FnMut() -> bool + Send + 'static,
    ) -> TimedTask {
        let next_run = Instant::now() + initial_delay;
        let state = Arc::new(TimedTaskState {
            next_run: Mutex::new(next_run),
            period,
            times_to_run: Mutex::new(times_to_run),
            in_progress: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            functor: Mutex::new(Box::new(f)),
        });
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.heap.lock().unwrap().push(Reverse(Entry {
            deadline: next_run,
            seq,
            state: state.clone(),
        }));
        self.shared.wakeup.notify_one();
        TimedTask { state }
    }
}

impl Drop for TimedTaskScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

fn driver_loop(shared: Arc<SchedulerShared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut heap = shared.heap.lock().unwrap();
        let wait_until = match heap.peek() {
            None => None,
            Some(Reverse(entry)) => Some(entry.deadline),
        };
        let now = Instant::now();
        let heap = match wait_until {
            None => {
                let (guard, _) = shared.wakeup.wait_timeout(heap, Duration::from_secs(3600)).unwrap();
                guard
            }
            Some(deadline) if deadline > now => {
                let (guard, _) = shared
                    .wakeup
                    .wait_timeout(heap, deadline - now)
                    .unwrap();
                guard
            }
            Some(_) => heap,
        };
        let mut heap = heap;
        let mut due = Vec::new();
        let now = Instant::now();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = heap.pop().unwrap();
            due.push(entry);
        }
        drop(heap);

        for entry in due {
            dispatch_due(&shared, entry);
        }
    }
}

fn dispatch_due(shared: &Arc<SchedulerShared>, entry: Entry) {
    let Entry { seq, state, .. } = entry;
    if state.cancelled.load(Ordering::Acquire) {
        return;
    }
    state.in_progress.store(true, Ordering::Release);
    let Backing::Invoker(invoker) = &shared.invoker;
    let invoker = invoker.clone();
    let shared = shared.clone();
    invoker.invoke(Box::new(move || {
        let keep_going = (state.functor.lock().unwrap())();
        state.in_progress.store(false, Ordering::Release);
        if !keep_going || state.cancelled.load(Ordering::Acquire) {
            return;
        }
        let remaining = {
            let mut times = state.times_to_run.lock().unwrap();
            match times.as_mut() {
                Some(0) => return,
                Some(n) => {
                    *n -= 1;
                    Some(*n)
                }
                None => None,
            }
        };
        if remaining == Some(0) {
            return;
        }
        let Some(period) = state.period else { return };
        let next = Instant::now() + period;
        *state.next_run.lock().unwrap() = next;
        shared.heap.lock().unwrap().push(Reverse(Entry {
            deadline: next,
            seq,
            state: state.clone(),
        }));
        shared.wakeup.notify_one();
    }));
}
