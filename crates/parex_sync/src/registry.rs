//! Thread-local registry answering "is the calling thread already a worker
//! of pool P, and if so, how deeply nested is the current submission?"
//!
//! A thread pool task that itself submits work (recursive submission) needs
//! to know this to decide whether to run the new work inline rather than
//! enqueue it — see `ThreadPool::schedule` in the `parex` crate. A small
//! fixed-arity association list is enough: real programs rarely run more
//! than a handful of distinct pools from one thread.

use arrayvec::ArrayVec;
use std::cell::RefCell;

/// Maximum number of distinct pools tracked per thread. Exceeding this is
/// not unsound, only imprecise: recursion detection for the overflowing
/// pool silently falls back to "not recursive", which only costs a missed
/// inline-execution optimization, never correctness (the caller still
/// enqueues and the pool still drains).
const MAX_TRACKED_POOLS: usize = 8;

thread_local! {
    static REGISTRY: RefCell<ArrayVec<(usize, usize), MAX_TRACKED_POOLS>> =
        RefCell::new(ArrayVec::new());
}

/// Namespace for the thread-local recursion-depth registry. Pools are
/// identified by a plain `usize` id (see `ThreadPool::id` in `parex`),
/// not by address, so the registry stays valid even if a pool is moved
/// behind an `Arc`.
pub struct PoolRegistration;

impl PoolRegistration {
    /// Current recursion depth for `pool_id` on the calling thread. Zero
    /// means "this thread is not currently running a task belonging to
    /// that pool".
    pub fn depth(pool_id: usize) -> usize {
        REGISTRY.with(|r| {
            r.borrow()
                .iter()
                .find(|(id, _)| *id == pool_id)
                .map(|(_, depth)| *depth)
                .unwrap_or(0)
        })
    }

    /// Record that the calling thread has begun running a task belonging
    /// to `pool_id`. The returned guard decrements on drop.
    pub fn enter(pool_id: usize) -> PoolRegistrationGuard {
        REGISTRY.with(|r| {
            let mut reg = r.borrow_mut();
            if let Some(entry) = reg.iter_mut().find(|(id, _)| *id == pool_id) {
                entry.1 += 1;
            } else if reg.try_push((pool_id, 1)).is_err() {
                log::warn!(
                    "parex: thread is already tracking {} distinct pools; recursion detection \
                     for pool {} will be imprecise on this thread",
                    MAX_TRACKED_POOLS,
                    pool_id
                );
            }
        });
        PoolRegistrationGuard { pool_id }
    }
}

/// RAII guard returned by [`PoolRegistration::enter`]; pops the recursion
/// depth back down on drop.
pub struct PoolRegistrationGuard {
    pool_id: usize,
}

impl Drop for PoolRegistrationGuard {
    fn drop(&mut self) {
        REGISTRY.with(|r| {
            let mut reg = r.borrow_mut();
            if let Some(idx) = reg.iter().position(|(id, _)| *id == self.pool_id) {
                reg[idx].1 -= 1;
                if reg[idx].1 == 0 {
                    reg.swap_remove(idx);
                }
            }
        });
    }
}
