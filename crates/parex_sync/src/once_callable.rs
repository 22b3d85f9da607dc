//! A move-only, invoke-once, type-erased `FnOnce()` with a small-buffer
//! optimization.
//!
//! This is the unit of work the thread pool queues: every task, no matter
//! how it originates (a raw `schedule`, a task-set wrapper, a future's
//! functor, a graph node), is ultimately reduced to one of these. Captures
//! that fit in [`INLINE_CAPACITY`] bytes are stored inline in the
//! `OnceCallable` itself; larger captures spill to a single heap
//! allocation. Either way, exactly one invocation is possible: [`call`]
//! consumes `self`.
//!
//! The chunk-header layout trick in `spsc_queue` (a fixed struct followed by
//! raw-allocated, pointer-arithmetic-addressed payload) is the same idea
//! applied here at a smaller scale: a value whose concrete type is erased
//! behind a pair of function pointers, addressed through `*mut u8`.
//!
//! [`call`]: OnceCallable::call

use std::alloc::{self, Layout};
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;

/// Bytes of inline storage before a capture spills to the heap. Three
/// machine words on a 64-bit target: enough for a closure that captures a
/// couple of pointers and a small payload without forcing an allocation for
/// the common case (e.g. `move || counter.fetch_add(1, Ordering::Relaxed)`).
pub const INLINE_CAPACITY: usize = 24;
const INLINE_ALIGN: usize = 8;

#[repr(align(8))]
struct InlineBuf([MaybeUninit<u8>; INLINE_CAPACITY]);

impl InlineBuf {
    fn uninit() -> Self {
        InlineBuf([MaybeUninit::uninit(); INLINE_CAPACITY])
    }
}

enum Storage {
    Inline(InlineBuf),
    Heap(NonNull<u8>, Layout),
}

#[derive(Clone, Copy)]
struct VTable {
    call: unsafe fn(*mut u8),
    drop_in_place: unsafe fn(*mut u8),
}

unsafe fn call_trampoline<F: FnOnce()>(data: *mut u8) {
    let f = unsafe { std::ptr::read(data as *mut F) };
    f();
}

unsafe fn drop_trampoline<F>(data: *mut u8) {
    unsafe { std::ptr::drop_in_place(data as *mut F) };
}

/// A move-only, invoke-once `void()`. See the module docs for the storage
/// strategy.
pub struct OnceCallable {
    storage: Storage,
    vtable: VTable,
}

// Sound because `new` requires `F: Send`, and the erased bytes carry no
// interior references back into the constructing thread beyond what `F`
// itself owns.
unsafe impl Send for OnceCallable {}

impl OnceCallable {
    /// Wrap `f` for one-shot execution on another thread.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let vtable = VTable {
            call: call_trampoline::<F>,
            drop_in_place: drop_trampoline::<F>,
        };

        if mem::size_of::<F>() <= INLINE_CAPACITY && mem::align_of::<F>() <= INLINE_ALIGN {
            let mut buf = InlineBuf::uninit();
            unsafe {
                (buf.0.as_mut_ptr() as *mut F).write(f);
            }
            Self {
                storage: Storage::Inline(buf),
                vtable,
            }
        } else {
            let layout = Layout::new::<F>();
            let ptr = if layout.size() == 0 {
                NonNull::dangling()
            } else {
                let raw = unsafe { alloc::alloc(layout) };
                match NonNull::new(raw) {
                    Some(p) => p,
                    None => alloc::handle_alloc_error(layout),
                }
            };
            unsafe {
                (ptr.as_ptr() as *mut F).write(f);
            }
            Self {
                storage: Storage::Heap(ptr, layout),
                vtable,
            }
        }
    }

    /// Whether this capture is stored inline (no heap allocation was made
    /// to construct this value). Exposed for tests and for callers tuning
    /// capture size.
    pub fn is_inline(&self) -> bool {
        matches!(self.storage, Storage::Inline(_))
    }

    fn data_ptr(&mut self) -> *mut u8 {
        match &mut self.storage {
            Storage::Inline(buf) => buf.0.as_mut_ptr() as *mut u8,
            Storage::Heap(ptr, _) => ptr.as_ptr(),
        }
    }

    /// Invoke the wrapped callable. Consumes `self`: there is no way to
    /// call twice.
    pub fn call(mut self) {
        let vtable = self.vtable;
        let data_ptr = self.data_ptr();
        // SAFETY: `data_ptr` addresses a live, initialized `F` that hasn't
        // been read or dropped yet; `call_trampoline::<F>` reads it out
        // (moving it onto the stack) and then runs it.
        unsafe {
            (vtable.call)(data_ptr);
        }
        if let Storage::Heap(ptr, layout) = self.storage {
            if layout.size() != 0 {
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }
        // The capture was already moved out and invoked above; running
        // `Drop` now would double-drop/double-free it.
        mem::forget(self);
    }
}

impl Drop for OnceCallable {
    fn drop(&mut self) {
        let data_ptr = self.data_ptr();
        // SAFETY: dropped without ever calling `call`, so the capture is
        // still live and uninvoked.
        unsafe {
            (self.vtable.drop_in_place)(data_ptr);
        }
        if let Storage::Heap(ptr, layout) = self.storage {
            if layout.size() != 0 {
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn small_capture_is_inline() {
        let x = 5usize;
        let c = OnceCallable::new(move || {
            let _ = x;
        });
        assert!(c.is_inline());
    }

    #[test]
    fn large_capture_spills_to_heap() {
        let big = [0u8; 256];
        let c = OnceCallable::new(move || {
            let _ = big.len();
        });
        assert!(!c.is_inline());
    }

    #[test]
    fn call_runs_exactly_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let c = OnceCallable::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        c.call();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_without_calling_runs_destructor_once() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let guard = DropCounter(counter.clone());
        let c = OnceCallable::new(move || {
            let _keep_alive = &guard;
        });
        drop(c);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn heap_capture_runs_and_frees() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let big = [7u8; 256];
        let c = OnceCallable::new(move || {
            ran2.fetch_add(big.iter().map(|&b| b as usize).sum::<usize>(), Ordering::SeqCst);
        });
        assert!(!c.is_inline());
        c.call();
        assert_eq!(ran.load(Ordering::SeqCst), 256 * 7);
    }

    #[test]
    fn zero_sized_capture_works() {
        let c = OnceCallable::new(|| {});
        assert!(c.is_inline());
        c.call();
    }

    #[test]
    fn is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<OnceCallable>();
    }
}
