//! The Rust stand-in for `spec.md`'s "captured exception": a panic payload
//! caught at a task trampoline via [`std::panic::catch_unwind`] and
//! resumed later on a waiting thread via [`std::panic::resume_unwind`].
//!
//! Rust has no analogue of arbitrary C++ exception propagation across
//! threads, but `catch_unwind`/`resume_unwind` give the same shape: capture
//! once, rethrow (resume) later, exactly once, on whichever thread calls
//! `wait`/`get`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// A panic payload captured from a scheduled task.
pub type Captured = Box<dyn Any + Send + 'static>;

/// Run `f`, catching a panic as a [`Captured`] rather than letting it
/// unwind across the thread boundary.
pub fn catch<F, T>(f: F) -> Result<T, Captured>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// Resume a previously captured panic on the calling thread. This is
/// `parex`'s equivalent of dispenso's `std::rethrow_exception`.
pub fn resume(captured: Captured) -> ! {
    panic::resume_unwind(captured)
}

/// A tri-state guard for "first panic wins, every other panic from the same
/// task set is silently discarded" (spec.md §4.2's exception aggregation).
pub(crate) mod guard {
    use super::Captured;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex;

    const UNSET: u8 = 0;
    const SETTING: u8 = 1;
    const SET: u8 = 2;

    #[derive(Default)]
    pub(crate) struct ExceptionGuard {
        state: AtomicU8,
        slot: Mutex<Option<Captured>>,
    }

    impl ExceptionGuard {
        /// Attempt to record `captured` as the first exception for this
        /// guard. Later callers lose silently, matching spec.md's
        /// "additional exceptions ... are silently discarded".
        pub(crate) fn try_set(&self, captured: Captured) {
            if self
                .state
                .compare_exchange(UNSET, SETTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *self.slot.lock().unwrap() = Some(captured);
                self.state.store(SET, Ordering::Release);
            }
        }

        /// Atomically take the captured exception, if any, leaving the
        /// guard ready to capture a fresh one (used by `tryWait`-style
        /// incremental draining as well as `wait`).
        pub(crate) fn take(&self) -> Option<Captured> {
            // Busy-wait past a brief `SETTING` window; this only happens if
            // we read the flag in the narrow gap between the CAS above and
            // the slot being populated.
            loop {
                match self.state.load(Ordering::Acquire) {
                    UNSET => return None,
                    SETTING => std::hint::spin_loop(),
                    SET => {
                        let taken = self.slot.lock().unwrap().take();
                        self.state.store(UNSET, Ordering::Release);
                        return taken;
                    }
                    _ => unreachable!(),
                }
            }
        }
    }
}
