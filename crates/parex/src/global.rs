//! Process-wide singletons: the global thread pool and the global
//! timed-task scheduler. Both are lazily initialized on first use and
//! intentionally never torn down, avoiding destruction-order hazards with
//! thread-locals ([`parex_sync::PoolRegistration`]) that reference them
//! (spec.md §9's "Global state" design note).

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::pool::ThreadPool;
use crate::timed_task::{Invoker, TimedTaskScheduler};

struct GlobalPoolInvoker;

impl Invoker for GlobalPoolInvoker {
    fn invoke(&self, f: Box<dyn FnOnce() + Send>) {
        global_thread_pool().schedule(f);
    }
}

static GLOBAL_POOL: Lazy<Arc<ThreadPool>> = Lazy::new(|| {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Arc::new(ThreadPool::new(threads).expect("failed to start the global thread pool"))
});

static GLOBAL_TIMED_TASK_SCHEDULER: Lazy<TimedTaskScheduler> =
    Lazy::new(|| TimedTaskScheduler::new(Arc::new(GlobalPoolInvoker)));

/// The process-wide thread pool, sized to the number of available CPUs on
/// first access. Never destroyed.
pub fn global_thread_pool() -> &'static ThreadPool {
    &GLOBAL_POOL
}

/// Resize the global thread pool in place.
pub fn resize_global_thread_pool(num_threads: usize) -> Result<(), crate::error::PoolError> {
    GLOBAL_POOL.resize(num_threads)
}

/// The process-wide timed-task scheduler, backed by [`global_thread_pool`].
/// Never destroyed.
pub fn global_timed_task_scheduler() -> &'static TimedTaskScheduler {
    &GLOBAL_TIMED_TASK_SCHEDULER
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{async_task, AsyncPolicy, DeferredPolicy, Future};

    #[test]
    fn global_thread_pool_runs_work() {
        let f: Future<i32> = async_task(|| 1 + 1, global_thread_pool());
        assert_eq!(f.get(), 2);
        let _ = AsyncPolicy::Async;
        let _ = DeferredPolicy::NotDeferred;
    }

    #[test]
    fn resize_global_thread_pool_does_not_panic() {
        let original = global_thread_pool().num_threads();
        resize_global_thread_pool(original + 1).unwrap();
        resize_global_thread_pool(original).unwrap();
    }
}
