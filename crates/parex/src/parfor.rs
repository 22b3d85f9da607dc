//! Data-parallel loops over an index range: [`ChunkedRange`], [`ParForOptions`],
//! [`parallel_for`], the stateful per-worker-state variant, and the
//! iterator-oriented [`for_each`]/[`for_each_n`] convenience layer.
//!
//! Every entry point reduces to scheduling closures on a [`TaskSet`] and
//! either waiting inline or leaving the caller to wait externally — there is
//! no separate execution engine here, only range partitioning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parex_sync::PoolRegistration;

use crate::pool::ForceQueuing;
use crate::task_set::TaskSet;

/// Options controlling [`parallel_for`] and the `for_each` family.
#[derive(Clone, Copy, Debug)]
pub struct ParForOptions {
    /// Upper bound on the number of worker tasks launched, independent of
    /// pool size. `0` forces fully serial execution on the calling thread.
    pub max_threads: usize,
    /// Whether the call blocks until the loop has finished. When `false`,
    /// the caller must externally wait on the backing [`TaskSet`].
    pub wait: bool,
}

impl Default for ParForOptions {
    fn default() -> Self {
        Self {
            max_threads: usize::MAX,
            wait: true,
        }
    }
}

/// Identical shape to [`ParForOptions`]; a distinct type per spec.md §6's
/// separate `ForEachOptions` name for the iterator-oriented entry points.
pub type ForEachOptions = ParForOptions;

/// A chunking strategy for a [`ChunkedRange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkingMode {
    /// Dynamic load balancing: workers atomically claim chunks sized at
    /// roughly `1/16` of a fair per-worker share, so faster workers claim
    /// more chunks.
    Auto,
    /// Exactly one (contiguous, unequal-if-necessary) chunk per launched
    /// worker, computed up front.
    Static,
    /// A fixed chunk size in indices.
    Chunked(usize),
}

/// A lazy partition of `[start, end)` plus a chunking strategy. Empty
/// (`start >= end`) ranges are valid and simply never invoke the user
/// closure.
#[derive(Clone, Copy, Debug)]
pub struct ChunkedRange {
    pub start: usize,
    pub end: usize,
    pub mode: ChunkingMode,
}

impl ChunkedRange {
    pub fn new(start: usize, end: usize, mode: ChunkingMode) -> Self {
        Self { start, end, mode }
    }

    pub fn auto(start: usize, end: usize) -> Self {
        Self::new(start, end, ChunkingMode::Auto)
    }

    pub fn static_chunks(start: usize, end: usize) -> Self {
        Self::new(start, end, ChunkingMode::Static)
    }

    pub fn chunked(start: usize, end: usize, chunk: usize) -> Self {
        Self::new(start, end, ChunkingMode::Chunked(chunk))
    }

    /// Number of indices in the range. Zero for a reversed or empty range.
    pub fn size(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    fn is_static(&self) -> bool {
        matches!(self.mode, ChunkingMode::Static)
    }

    /// Chunk size to use for `Auto`/`Chunked` submission, given the number
    /// of workers that will pull from the shared index (including the
    /// caller, if it participates).
    fn auto_chunk_size(&self, working_threads: usize) -> usize {
        match self.mode {
            ChunkingMode::Chunked(c) => c.max(1),
            ChunkingMode::Auto => {
                if working_threads <= 1 {
                    return self.size().max(1);
                }
                const DYN_FACTOR: usize = 16;
                let chunks = DYN_FACTOR * working_threads;
                // ceil(size / chunks), overflow-safely: size is bounded by
                // usize::MAX - start already (ranges come from valid
                // allocations), so size + chunks cannot realistically
                // overflow, but we still saturate rather than wrap.
                self.size().saturating_add(chunks).saturating_sub(1) / chunks.max(1)
            }
            ChunkingMode::Static => unreachable!("static ranges use parallel_for_static"),
        }
    }
}

/// Optimal static chunking: `ceil_chunk_size` items for the first
/// `transition_task_index` chunks, `ceil_chunk_size - 1` for the rest, so
/// that `transition_task_index * ceil + (chunks - transition_task_index) *
/// (ceil - 1) == items` exactly. Grounded on
/// `examples/original_source/dispenso/util.h`'s `staticChunkSize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticChunking {
    pub ceil_chunk_size: usize,
    pub transition_task_index: usize,
}

pub fn static_chunk_size(items: usize, chunks: usize) -> StaticChunking {
    assert!(chunks > 0, "staticChunkSize requires chunks > 0");
    let floor_chunk_size = items / chunks;
    // `(items + chunks - 1) / chunks` overflows when `items` is near
    // `usize::MAX`; compute the ceiling from the floor instead so no
    // intermediate sum ever exceeds `items` itself.
    let ceil_chunk_size = floor_chunk_size + (items % chunks != 0) as usize;
    let transition_task_index = items - floor_chunk_size * chunks;
    StaticChunking {
        ceil_chunk_size,
        transition_task_index,
    }
}

/// Execute `f(begin, end)` in parallel over `range`'s index space, scheduled
/// on `task_set`. See spec.md §4.3 for the full submission algorithm.
pub fn parallel_for<F>(task_set: &TaskSet<'_>, range: ChunkedRange, options: ParForOptions, f: F)
where
    F: Fn(usize, usize) + Send + Sync + Clone + 'static,
{
    if range.start >= range.end {
        return;
    }

    if options.max_threads == 0 || PoolRegistration::depth(task_set.pool().id()) > 0 {
        f(range.start, range.end);
        return;
    }

    if range.is_static() {
        parallel_for_static(task_set, range, options, f);
        return;
    }

    let n = task_set.num_pool_threads();
    let use_calling_thread = options.wait;
    let num_to_launch = options.max_threads.min(n.saturating_sub(use_calling_thread as usize));
    let working_threads = num_to_launch + use_calling_thread as usize;
    let chunk = range.auto_chunk_size(working_threads.max(1));
    let end = range.end;

    if options.wait {
        let index = Arc::new(AtomicUsize::new(range.start));
        let worker = {
            let index = index.clone();
            let f = f.clone();
            move || auto_worker_loop(&index, end, chunk, &f)
        };
        for _ in 0..num_to_launch {
            task_set.schedule(worker.clone());
        }
        worker();
        task_set.wait();
    } else {
        let index = Arc::new(AtomicUsize::new(range.start));
        for _ in 0..num_to_launch {
            let index = index.clone();
            let f = f.clone();
            task_set.schedule_force_queuing(move || auto_worker_loop(&index, end, chunk, &f));
        }
    }
}

fn auto_worker_loop<F>(index: &AtomicUsize, end: usize, chunk: usize, f: &F)
where
    F: Fn(usize, usize),
{
    loop {
        let cur = index.fetch_add(chunk, Ordering::Relaxed);
        // `cur >= end` (not `cur + chunk > end`) tolerates the index
        // eventually wrapping past `usize::MAX` under pathological chunk
        // counts, per spec.md §4.3's numeric-semantics paragraph.
        if cur >= end {
            break;
        }
        f(cur, cur.saturating_add(chunk).min(end));
    }
}

fn parallel_for_static<F>(task_set: &TaskSet<'_>, range: ChunkedRange, options: ParForOptions, f: F)
where
    F: Fn(usize, usize) + Send + Sync + Clone + 'static,
{
    let num_threads = task_set
        .num_pool_threads()
        .min(options.max_threads)
        .min(range.size())
        .max(1);

    let chunking = static_chunk_size(range.size(), num_threads);
    let mut chunk_size = chunking.ceil_chunk_size;
    let perfectly_chunked = chunking.transition_task_index == num_threads;
    let first_loop_len = chunking.transition_task_index - perfectly_chunked as usize;

    let mut start = range.start;
    let mut t = 0;
    while t < first_loop_len {
        let next = start + chunk_size;
        let f = f.clone();
        task_set.schedule(move || f(start, next));
        start = next;
        t += 1;
    }

    chunk_size -= !perfectly_chunked as usize;
    while t < num_threads - 1 {
        let next = start + chunk_size;
        let f = f.clone();
        task_set.schedule(move || f(start, next));
        start = next;
        t += 1;
    }

    if options.wait {
        f(start, range.end);
        task_set.wait();
    } else {
        let end = range.end;
        task_set.schedule_with(move || f(start, end), ForceQueuing);
    }
}

/// Per-worker stateful variant: one `State` instance is emplaced per
/// launched task (plus one for the caller, if it participates), and `f`
/// receives the instance by reference alongside its sub-range. The caller
/// is responsible for reducing `states` once `parallel_for_with_state`
/// returns.
pub fn parallel_for_with_state<State, F, Gen>(
    task_set: &TaskSet<'_>,
    range: ChunkedRange,
    options: ParForOptions,
    make_state: Gen,
    f: F,
) -> Vec<State>
where
    State: Send + 'static,
    F: Fn(&mut State, usize, usize) + Send + Sync + Clone + 'static,
    Gen: Fn() -> State,
{
    if range.start >= range.end {
        return Vec::new();
    }
    if options.max_threads == 0 || PoolRegistration::depth(task_set.pool().id()) > 0 {
        let mut state = make_state();
        f(&mut state, range.start, range.end);
        return vec![state];
    }

    let num_threads = task_set
        .num_pool_threads()
        .min(options.max_threads)
        .min(range.size())
        .max(1);

    let states: Arc<Vec<std::sync::Mutex<State>>> =
        Arc::new((0..num_threads).map(|_| std::sync::Mutex::new(make_state())).collect());

    let chunking = static_chunk_size(range.size(), num_threads);
    let mut chunk_size = chunking.ceil_chunk_size;
    let perfectly_chunked = chunking.transition_task_index == num_threads;
    let first_loop_len = chunking.transition_task_index - perfectly_chunked as usize;

    let mut start = range.start;
    let mut t = 0;
    while t < first_loop_len {
        let next = start + chunk_size;
        let states = states.clone();
        let f = f.clone();
        let idx = t;
        task_set.schedule(move || f(&mut states[idx].lock().unwrap(), start, next));
        start = next;
        t += 1;
    }

    chunk_size -= !perfectly_chunked as usize;
    while t < num_threads - 1 {
        let next = start + chunk_size;
        let states = states.clone();
        let f = f.clone();
        let idx = t;
        task_set.schedule(move || f(&mut states[idx].lock().unwrap(), start, next));
        start = next;
        t += 1;
    }

    {
        let idx = num_threads - 1;
        f(&mut states[idx].lock().unwrap(), start, range.end);
    }
    task_set.wait();

    Arc::try_unwrap(states)
        .unwrap_or_else(|_| unreachable!("task_set.wait() guarantees exclusive ownership"))
        .into_iter()
        .map(|m| m.into_inner().unwrap())
        .collect()
}

/// Parallel version of `std::iter::Iterator::for_each` over `n` elements
/// starting at `start`, invoking `f(item)` for each. Internally delegates
/// to the same static chunking as `parallel_for`.
pub fn for_each_n<T, F>(task_set: &TaskSet<'_>, items: &[T], options: ForEachOptions, f: F)
where
    T: Sync,
    F: Fn(&T) + Send + Sync + Clone + 'static,
{
    // `options.wait` is forced on: every scheduled sub-range closure below
    // captures a raw pointer into `items` rather than a borrow, because
    // `OnceCallable` requires `'static` captures. That pointer is only ever
    // dereferenced while `items` is still alive, which `parallel_for`'s
    // `wait` branch guarantees by fully draining the task set (running the
    // caller's own sub-range and then `task_set.wait()`) before this
    // function returns — matching the original's "this overload must
    // always wait" contract (spec.md's `for_each`/`for_each_n`).
    let mut options = options;
    options.wait = true;
    let len = items.len();
    let ptr = items.as_ptr() as usize;
    parallel_for(task_set, ChunkedRange::static_chunks(0, len), options, move |b, e| {
        // SAFETY: see the comment above `options.wait = true`: every
        // closure this pointer is embedded in has finished running by the
        // time `parallel_for` (and thus `for_each_n`) returns.
        let items = unsafe { std::slice::from_raw_parts(ptr as *const T, len) };
        for it in &items[b..e] {
            f(it);
        }
    });
}

/// Parallel version of `std::iter::Iterator::for_each` over a full slice.
pub fn for_each<T, F>(task_set: &TaskSet<'_>, items: &[T], options: ForEachOptions, f: F)
where
    T: Sync,
    F: Fn(&T) + Send + Sync + Clone + 'static,
{
    for_each_n(task_set, items, options, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadPool;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn empty_range_never_invokes_closure() {
        let pool = ThreadPool::new(4).unwrap();
        let ts = TaskSet::new(&pool);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        parallel_for(
            &ts,
            ChunkedRange::auto(5, 5),
            ParForOptions::default(),
            move |_, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reversed_range_never_invokes_closure() {
        let pool = ThreadPool::new(4).unwrap();
        let ts = TaskSet::new(&pool);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        parallel_for(
            &ts,
            ChunkedRange::static_chunks(10, 2),
            ParForOptions::default(),
            move |_, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn max_threads_zero_runs_serially() {
        let pool = ThreadPool::new(4).unwrap();
        let ts = TaskSet::new(&pool);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        parallel_for(
            &ts,
            ChunkedRange::auto(0, 10),
            ParForOptions {
                max_threads: 0,
                wait: true,
            },
            move |b, e| seen2.lock().unwrap().push((b, e)),
        );
        assert_eq!(*seen.lock().unwrap(), vec![(0, 10)]);
    }

    #[test]
    fn static_chunking_distributes_all_items() {
        let c = static_chunk_size(100, 8);
        assert_eq!(c.ceil_chunk_size, 13);
        assert_eq!(c.transition_task_index, 4);
        let total: usize = (0..8)
            .map(|i| {
                if i < c.transition_task_index {
                    c.ceil_chunk_size
                } else {
                    c.ceil_chunk_size - 1
                }
            })
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn perfectly_divisible_static_chunking() {
        let c = static_chunk_size(100, 10);
        assert_eq!(c.ceil_chunk_size, 10);
        assert_eq!(c.transition_task_index, 10);
    }

    #[test]
    fn sum_all_sevens_with_per_worker_state() {
        let pool = ThreadPool::new(4).unwrap();
        let ts = TaskSet::new(&pool);
        const N: usize = 1000;
        let image = vec![7i64; N * N];
        let states = parallel_for_with_state(
            &ts,
            ChunkedRange::static_chunks(0, image.len()),
            ParForOptions::default(),
            || 0i64,
            {
                let image = Arc::new(image.clone());
                move |acc: &mut i64, b, e| {
                    for i in b..e {
                        *acc += image[i];
                    }
                }
            },
        );
        let total: i64 = states.into_iter().sum();
        assert_eq!(total, 7 * (N as i64) * (N as i64));
    }

    #[test]
    fn auto_mode_covers_every_index_exactly_once() {
        let pool = ThreadPool::new(4).unwrap();
        let ts = TaskSet::new(&pool);
        const N: usize = 5000;
        let hits: Arc<Vec<AtomicI64>> = Arc::new((0..N).map(|_| AtomicI64::new(0)).collect());
        let hits2 = hits.clone();
        parallel_for(
            &ts,
            ChunkedRange::auto(0, N),
            ParForOptions::default(),
            move |b, e| {
                for i in b..e {
                    hits2[i].fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        for h in hits.iter() {
            assert_eq!(h.load(Ordering::SeqCst), 1);
        }
    }

    proptest::proptest! {
        /// `static_chunk_size` must distribute every item across every
        /// chunk exactly once, for any `(items, chunks)` pair, including
        /// sizes close to `usize::MAX` where a naive `ceil` computation
        /// would overflow (spec.md §4.3's numeric-semantics paragraph).
        #[test]
        fn static_chunk_size_accounts_for_every_item(
            items in 0usize..=1_000_000,
            chunks in 1usize..=256,
        ) {
            let c = static_chunk_size(items, chunks);
            let total: usize = (0..chunks)
                .map(|i| {
                    if i < c.transition_task_index {
                        c.ceil_chunk_size
                    } else {
                        c.ceil_chunk_size.saturating_sub(1)
                    }
                })
                .sum();
            proptest::prop_assert_eq!(total, items);
            proptest::prop_assert!(c.transition_task_index <= chunks);
        }

        /// Near `usize::MAX`, the chunk-size computation must not panic or
        /// wrap around to a nonsensical (tiny or huge) result.
        #[test]
        fn static_chunk_size_near_usize_max_does_not_overflow(
            headroom in 0usize..=4096,
            chunks in 1usize..=64,
        ) {
            let items = usize::MAX - headroom;
            let c = static_chunk_size(items, chunks);
            proptest::prop_assert!(c.ceil_chunk_size >= items / chunks);
        }

        /// `auto_chunk_size` must always return at least 1, and never more
        /// than the range's own size, regardless of worker count.
        #[test]
        fn auto_chunk_size_is_at_least_one_and_bounded(
            start in 0usize..=10_000,
            len in 0usize..=10_000,
            working_threads in 1usize..=128,
        ) {
            let range = ChunkedRange::auto(start, start + len);
            let chunk = range.auto_chunk_size(working_threads);
            proptest::prop_assert!(chunk >= 1);
            if len > 0 {
                proptest::prop_assert!(chunk <= len.max(1));
            }
        }
    }

    #[test]
    fn for_each_visits_every_element() {
        let pool = ThreadPool::new(4).unwrap();
        let ts = TaskSet::new(&pool);
        let items: Vec<i64> = (0..2000).collect();
        let sum = Arc::new(AtomicI64::new(0));
        let sum2 = sum.clone();
        for_each(&ts, &items, ForEachOptions::default(), move |x| {
            sum2.fetch_add(*x, Ordering::SeqCst);
        });
        assert_eq!(sum.load(Ordering::SeqCst), (0..2000i64).sum::<i64>());
    }
}
