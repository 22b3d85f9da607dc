//! Error types for the resource-acquisition-failure category described in
//! `spec.md` §7: failures that happen before a task is ever queued. User
//! code failures (panics inside scheduled work) are represented separately
//! by [`Captured`](crate::Captured), since they are not returned from these
//! APIs but rethrown from `wait`/`get`.

use std::io;

/// Failures that can occur constructing or resizing a [`crate::ThreadPool`].
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn pool worker thread: {0}")]
    SpawnFailed(#[from] io::Error),

    /// `resize` was called while another `resize` call was already running
    /// on a different thread. `spec.md` §3 documents concurrent resize as a
    /// contract violation; this crate surfaces it as a recoverable error
    /// instead of undefined behavior, since Rust gives us a cheap way to
    /// detect it (a `try_lock`) where the original relied on the caller
    /// simply not doing that.
    #[error("resize is already in progress on another thread")]
    ResizeInProgress,

    /// A pool (or anything built on one) was asked to run with zero
    /// threads and zero fallback capacity in a context that requires at
    /// least one worker.
    #[error("pool requires at least one thread")]
    NoThreads,
}
