//! Leaf synchronization primitives shared by the `parex` runtime.
//!
//! This crate provides the pieces that sit underneath the thread pool:
//! a move-only, invoke-once type-erased callable with a small-buffer
//! optimization ([`once_callable`]), a futex-like integer event usable by
//! any number of waiters ([`completion_event`]), and a thread-local registry
//! that lets a pool know whether the calling thread is already one of its
//! own workers ([`registry`]).
//!
//! None of these types know about thread pools, task sets, or queues. They
//! are building blocks, not policy.

pub mod completion_event;
pub mod once_callable;
pub mod registry;
mod sync;

pub use completion_event::CompletionEvent;
pub use once_callable::OnceCallable;
pub use registry::{PoolRegistration, PoolRegistrationGuard};
