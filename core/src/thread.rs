//! Fork-join thread pool for per-frame parallel work.
//!
//! A frame's parallel regions (visibility finalization, light processing,
//! queue sorting, geometry updates) all follow the same shape: split a
//! workload into fixed partitions, run them to completion on a bounded set
//! of threads, and block until every partition is done. There is no
//! cooperative suspension and no cancellation; [`WorkQueue::complete`]-style
//! barriers are implicit in scope exit.
//!
//! The calling thread always participates as one extra partition, so a
//! workload is split `worker_threads + 1` ways.

/// A thread pool for scoped parallel execution.
///
/// Uses [`std::thread::scope`], so tasks may borrow local state; all tasks
/// are guaranteed to complete before [`ThreadPool::scope`] returns.
///
/// # Example
///
/// ```
/// use nightshade_core::thread::ThreadPool;
///
/// let pool = ThreadPool::new(4);
///
/// let mut results = vec![0u32; 4];
/// pool.scope(|s| {
///     for (i, slot) in results.iter_mut().enumerate() {
///         s.spawn(move || {
///             *slot = (i as u32) * 10;
///         });
///     }
/// });
/// assert_eq!(results, vec![0, 10, 20, 30]);
/// ```
pub struct ThreadPool {
    num_threads: usize,
}

impl ThreadPool {
    /// Creates a new thread pool with the given number of worker threads.
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
        }
    }

    /// Creates a thread pool sized to the number of available CPU cores.
    pub fn default_threads() -> Self {
        Self::new(std::thread::available_parallelism().map_or(1, |n| n.get()))
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Executes tasks within a scoped context.
    ///
    /// All tasks spawned within the closure are guaranteed to complete
    /// before this method returns.
    pub fn scope<'env, F>(&self, f: F)
    where
        F: for<'scope> FnOnce(&Scope<'scope, 'env>),
    {
        std::thread::scope(|s| {
            let scope = Scope { inner: s };
            f(&scope);
        });
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::default_threads()
    }
}

/// A scope for spawning tasks that must complete before the scope exits.
pub struct Scope<'scope, 'env: 'scope> {
    inner: &'scope std::thread::Scope<'scope, 'env>,
}

impl<'scope, 'env> Scope<'scope, 'env> {
    /// Spawns a task within this scope.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        self.inner.spawn(f);
    }
}

/// Fork-join workload partitioner over a [`ThreadPool`].
///
/// [`for_each_partition`](WorkQueue::for_each_partition) splits a slice into
/// `num_partitions()` contiguous chunks, runs the work function once per
/// chunk with a dedicated result slot, and blocks until every chunk
/// completes. The last chunk runs on the calling thread.
pub struct WorkQueue {
    pool: ThreadPool,
}

impl WorkQueue {
    /// Create with an explicit worker thread count.
    pub fn new(num_threads: usize) -> Self {
        Self {
            pool: ThreadPool::new(num_threads),
        }
    }

    /// Create sized to the available hardware threads.
    pub fn with_default_threads() -> Self {
        Self {
            pool: ThreadPool::default_threads(),
        }
    }

    /// Worker threads plus the calling thread.
    pub fn num_partitions(&self) -> usize {
        self.pool.num_threads() + 1
    }

    /// The underlying pool, for ad-hoc task scopes (e.g. parallel sorts).
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Run `work` over `items` split into `num_partitions()` chunks.
    ///
    /// `results` must hold exactly one slot per partition; each invocation
    /// receives `(partition_index, chunk, result_slot)`. Partition results
    /// are independent; merging them afterwards is the caller's business.
    /// Ordering across partitions is not guaranteed.
    pub fn for_each_partition<T, R, F>(&self, items: &[T], results: &mut [R], work: F)
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &[T], &mut R) + Sync,
    {
        let partitions = self.num_partitions();
        assert_eq!(
            results.len(),
            partitions,
            "one result slot required per partition"
        );

        if items.is_empty() {
            return;
        }
        log::trace!(
            "Dispatching {} items across {} partitions",
            items.len(),
            partitions
        );

        // Evenly sized chunks; the last partition absorbs the remainder.
        let per_partition = (items.len() / partitions).max(1);

        std::thread::scope(|s| {
            let work = &work;
            let mut item_rest = items;
            let mut result_rest = results;
            for index in 0..partitions {
                let is_last = index == partitions - 1;
                let take = if !is_last && item_rest.len() > per_partition {
                    per_partition
                } else {
                    item_rest.len()
                };
                let (chunk, items_tail) = item_rest.split_at(take);
                let (slot, results_tail) = result_rest.split_at_mut(1);
                item_rest = items_tail;
                result_rest = results_tail;

                if chunk.is_empty() {
                    continue;
                }
                if is_last {
                    // Calling thread participates as the final partition.
                    work(index, chunk, &mut slot[0]);
                } else {
                    s.spawn(move || work(index, chunk, &mut slot[0]));
                }
            }
        });
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::with_default_threads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn scope_runs_multiple_tasks() {
        let pool = ThreadPool::new(4);
        let counter = AtomicU32::new(0);
        pool.scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn partitions_cover_every_item() {
        let queue = WorkQueue::new(3);
        let items: Vec<u32> = (0..1000).collect();
        let mut results: Vec<Vec<u32>> = vec![Vec::new(); queue.num_partitions()];

        queue.for_each_partition(&items, &mut results, |_, chunk, out| {
            out.extend_from_slice(chunk);
        });

        let mut merged: Vec<u32> = results.into_iter().flatten().collect();
        merged.sort_unstable();
        assert_eq!(merged, items);
    }

    #[test]
    fn partition_count_includes_calling_thread() {
        let queue = WorkQueue::new(3);
        assert_eq!(queue.num_partitions(), 4);
    }

    #[test]
    fn small_workload_still_completes() {
        let queue = WorkQueue::new(8);
        let items = [1u32, 2];
        let mut results = vec![0u32; queue.num_partitions()];

        queue.for_each_partition(&items, &mut results, |_, chunk, out| {
            *out = chunk.iter().sum();
        });

        assert_eq!(results.iter().sum::<u32>(), 3);
    }

    #[test]
    fn empty_workload_is_noop() {
        let queue = WorkQueue::new(2);
        let items: [u32; 0] = [];
        let mut results = vec![0u32; queue.num_partitions()];
        queue.for_each_partition(&items, &mut results, |_, _, out| {
            *out = 1;
        });
        assert!(results.iter().all(|&r| r == 0));
    }

    #[test]
    fn min_max_reduction_across_partitions() {
        let queue = WorkQueue::new(4);
        let items: Vec<f32> = (0..500).map(|i| i as f32).collect();
        let mut results = vec![(f32::INFINITY, f32::NEG_INFINITY); queue.num_partitions()];

        queue.for_each_partition(&items, &mut results, |_, chunk, out| {
            for &v in chunk {
                out.0 = out.0.min(v);
                out.1 = out.1.max(v);
            }
        });

        let min = results.iter().fold(f32::INFINITY, |a, r| a.min(r.0));
        let max = results.iter().fold(f32::NEG_INFINITY, |a, r| a.max(r.1));
        assert_eq!(min, 0.0);
        assert_eq!(max, 499.0);
    }
}
