//! `parex`: a process-local, synchronous work-stealing runtime.
//!
//! Built from five tightly coupled subsystems — a recursion-aware thread
//! pool ([`pool`]), completion-tracking task sets ([`task_set`]), a
//! parallel-for engine ([`parfor`]), reference-counted futures with a
//! lock-free then-chain ([`future`]), and a dependency-graph executor with
//! bidirectional-propagation incrementality ([`graph`]) — plus a pipeline
//! ([`pipeline`]) and a timed-task scheduler ([`timed_task`]) built on top
//! of them.
//!
//! The small, move-only callable and the thread-local recursion registry
//! that make the pool deadlock-resistant live in the leaf crate
//! [`parex_sync`] and are re-exported here for convenience.

pub mod captured;
pub mod error;
pub mod future;
pub mod global;
pub mod graph;
pub mod parfor;
pub mod pipeline;
pub mod pool;
pub mod task_set;
pub mod timed_task;

pub use captured::Captured;
pub use error::PoolError;
pub use future::{
    async_task, make_ready_future, when_all, AsyncPolicy, DeferredPolicy, Future, FutureWaitStatus,
    ImmediateInvoker, NewThreadInvoker, Scheduler,
};
pub use global::{global_thread_pool, global_timed_task_scheduler, resize_global_thread_pool};
pub use graph::{
    propagate_incomplete_state, set_all_nodes_incomplete, set_incomplete, BiPropGraph, BiPropNode,
    ConcurrentTaskSetExecutor, ForwardPropagator, Graph, NodeIndex, ParallelForExecutor,
    SingleThreadExecutor,
};
pub use parfor::{for_each, for_each_n, parallel_for, parallel_for_with_state, ChunkedRange, ChunkingMode, ForEachOptions, ParForOptions};
pub use pipeline::{GatedScheduler, Pipeline, PipelineOptions, Stage};
pub use pool::{ForceQueuing, PoolOptions, ThreadPool};
pub use task_set::{ConcurrentTaskSet, TaskSet, DEFAULT_LOAD_FACTOR_MULTIPLIER};
pub use timed_task::{InlineInvoker, Invoker, TimedTask, TimedTaskScheduler};

pub use parex_sync::{CompletionEvent, OnceCallable, PoolRegistration};
