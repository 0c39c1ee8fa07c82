//! Data-parallel loops over an index range.
//!
//! [`for_each`] (and the [`ParallelFor`] builder behind it) splits `0..count`
//! into batches and hands them out through a [`Partitioner`]: a single atomic
//! cursor advanced with `fetch_add`, so every index is claimed by exactly one
//! caller and claiming never blocks. Up to [`MAX_PARALLEL_TASKS`] tasks drain
//! the partitioner on the scheduler while the calling thread drains it too.
use crate::{task::Task, Awaiter, TaskPriority, TaskScheduler};
use core::{
    any::Any,
    fmt,
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering::*},
};
use hyphae_util::{fatal_assert, sync::CachePadded};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};

/// The most tasks a single parallel loop spawns, not counting the caller.
pub const MAX_PARALLEL_TASKS: usize = 32;

/// Hands out consecutive batches of `0..count` to any number of claimants.
pub struct Partitioner {
    cursor: CachePadded<AtomicUsize>,
    count: usize,
    batch: usize,
}

/// Configures a parallel loop on a [`TaskScheduler`].
#[derive(Debug, Clone, Copy)]
#[must_use = "a `ParallelFor` does nothing until `run` is called"]
pub struct ParallelFor<'s> {
    scheduler: &'s TaskScheduler,
    batch: usize,
    workers: Option<usize>,
}

/// Describes a completed parallel loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ForSummary {
    /// How many tasks were spawned to help the calling thread.
    pub spawned_tasks: usize,
}

/// Calls `callback(first, count)` for consecutive slices of `0..count`, each
/// at most `batch` long, in parallel, then calls `finalize(count)`.
///
/// The slices partition the range: every index is covered by exactly one
/// call. The calling thread takes part, and `finalize` runs on it once every
/// slice has been processed. If `count` is zero, `finalize(0)` is called
/// immediately.
///
/// If any call to `callback` panics, the panic is resumed on the calling
/// thread once every helper task has finished, and `finalize` is not called.
/// Slices that other claimants had already taken still run to completion.
///
/// A `batch` of zero is fatal.
#[track_caller]
pub fn for_each<F, G>(
    scheduler: &TaskScheduler,
    count: usize,
    batch: usize,
    callback: F,
    finalize: G,
) -> ForSummary
where
    F: Fn(usize, usize) + Sync,
    G: FnOnce(usize),
{
    ParallelFor::new(scheduler)
        .batch(batch)
        .run(count, callback, finalize)
}

// === impl Partitioner ===

impl Partitioner {
    /// Returns a partitioner over `0..count` handing out `batch` indices at a
    /// time. Batches larger than `count` are clamped to it.
    ///
    /// A `batch` of zero is fatal.
    #[track_caller]
    #[must_use]
    pub fn new(count: usize, batch: usize) -> Self {
        fatal_assert!(batch > 0, "parallel loop batch size must be non-zero");
        Self {
            cursor: CachePadded::new(AtomicUsize::new(0)),
            count,
            batch: batch.min(count.max(1)),
        }
    }

    /// Claims the next batch, or returns `None` once the whole range has been
    /// claimed.
    pub fn partition(&self) -> Option<Range<usize>> {
        // keeps the cursor from running far past `count` once exhausted.
        if self.is_exhausted() {
            return None;
        }
        let first = self.cursor.fetch_add(self.batch, Relaxed);
        if first >= self.count {
            return None;
        }
        Some(first..first.saturating_add(self.batch).min(self.count))
    }

    /// Returns `true` once every index has been claimed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.cursor.load(Relaxed) >= self.count
    }

    /// Returns the number of batches the range splits into.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.count / self.batch + usize::from(self.count % self.batch != 0)
    }

    /// Returns the batch size.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Claims batches until the range is exhausted, passing each to
    /// `callback` as `(first, len)`.
    fn drain(&self, callback: &(impl Fn(usize, usize) + Sync)) -> usize {
        let mut claimed = 0;
        while let Some(range) = self.partition() {
            callback(range.start, range.len());
            claimed += 1;
        }
        claimed
    }
}

impl fmt::Debug for Partitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partitioner")
            .field("cursor", &self.cursor.load(Relaxed))
            .field("count", &self.count)
            .field("batch", &self.batch)
            .finish()
    }
}

// === impl ParallelFor ===

impl<'s> ParallelFor<'s> {
    /// Returns a loop on `scheduler` with a batch size of 1 and one helper
    /// task per worker thread.
    pub fn new(scheduler: &'s TaskScheduler) -> Self {
        Self {
            scheduler,
            batch: 1,
            workers: None,
        }
    }

    /// Sets how many consecutive indices each callback invocation covers.
    pub fn batch(self, batch: usize) -> Self {
        Self { batch, ..self }
    }

    /// Sets how many helper tasks to spawn. Clamped to
    /// [`MAX_PARALLEL_TASKS`] and to the number of batches.
    pub fn workers(self, workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..self
        }
    }

    /// Runs the loop over `0..count`. See [`for_each`], including how panics
    /// in `callback` are propagated.
    #[track_caller]
    pub fn run<F, G>(self, count: usize, callback: F, finalize: G) -> ForSummary
    where
        F: Fn(usize, usize) + Sync,
        G: FnOnce(usize),
    {
        let partitioner = Partitioner::new(count, self.batch);
        if count == 0 {
            finalize(0);
            return ForSummary { spawned_tasks: 0 };
        }

        let spawned_tasks = self
            .workers
            .unwrap_or_else(|| self.scheduler.threads_count())
            .min(partitioner.partitions())
            .min(MAX_PARALLEL_TASKS);
        let _span = tracing::debug_span!(
            "parallel_for",
            count,
            batch = partitioner.batch(),
            spawned_tasks
        )
        .entered();

        let panicked: Mutex<Option<Box<dyn Any + Send>>> = Mutex::new(None);
        {
            let join = Awaiter::new(spawned_tasks);
            let fork = Awaiter::satisfied();
            let guard = JoinGuard {
                scheduler: self.scheduler,
                join: &join,
            };
            for _ in 0..spawned_tasks {
                let partitioner = &partitioner;
                let callback = &callback;
                let panicked = &panicked;
                let body: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                    match panic::catch_unwind(AssertUnwindSafe(|| partitioner.drain(callback))) {
                        Ok(claimed) => tracing::trace!(claimed, "helper finished"),
                        Err(payload) => {
                            tracing::debug!("helper slice panicked");
                            panicked.lock().get_or_insert(payload);
                        }
                    }
                });
                // Safety: `guard` waits for `join` before `partitioner`,
                // `callback` and `panicked` go out of scope, even if the
                // caller unwinds.
                let task = unsafe { Task::scoped(body) };
                self.scheduler
                    .schedule(&task, &join, &fork, TaskPriority::Normal);
            }

            let claimed = partitioner.drain(&callback);
            tracing::trace!(claimed, "caller finished");
            drop(guard);
        }

        if let Some(payload) = panicked.into_inner() {
            panic::resume_unwind(payload);
        }
        finalize(count);
        ForSummary { spawned_tasks }
    }
}

/// Waits for a loop's helper tasks, including while unwinding.
struct JoinGuard<'a> {
    scheduler: &'a TaskScheduler,
    join: &'a Awaiter,
}

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.wait(self.join);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{fatal_panics, trace_init};
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[test]
    fn partitions_are_clamped() {
        let partitioner = Partitioner::new(10, 4);
        assert_eq!(partitioner.partitions(), 3);
        assert_eq!(partitioner.partition(), Some(0..4));
        assert_eq!(partitioner.partition(), Some(4..8));
        assert_eq!(partitioner.partition(), Some(8..10));
        assert_eq!(partitioner.partition(), None);
        assert!(partitioner.is_exhausted());

        let oversized = Partitioner::new(3, 100);
        assert_eq!(oversized.batch(), 3);
        assert_eq!(oversized.partition(), Some(0..3));
        assert_eq!(oversized.partition(), None);
    }

    #[test]
    fn empty_range() {
        let partitioner = Partitioner::new(0, 8);
        assert_eq!(partitioner.partitions(), 0);
        assert_eq!(partitioner.partition(), None);
    }

    #[test]
    #[should_panic = "batch size must be non-zero"]
    fn zero_batch_is_fatal() {
        fatal_panics();
        let _ = Partitioner::new(10, 0);
    }

    #[test]
    fn zero_count_finalizes_immediately() {
        let _trace = trace_init();
        let scheduler = TaskScheduler::builder().worker_threads(2).build();
        let mut finalized = Vec::new();
        let summary = for_each(
            &scheduler,
            0,
            16,
            |_, _| panic!("no slices for an empty range"),
            |count| finalized.push(count),
        );
        assert_eq!(finalized, vec![0]);
        assert_eq!(summary.spawned_tasks, 0);
    }

    #[test]
    fn single_worker_covers_range() {
        let _trace = trace_init();
        let scheduler = TaskScheduler::builder().worker_threads(1).build();
        let seen = Mutex::new(vec![false; 1000]);
        let summary = ParallelFor::new(&scheduler).batch(7).workers(1).run(
            1000,
            |first, count| {
                let mut seen = seen.lock().unwrap();
                for index in first..first + count {
                    assert!(!seen[index], "index {index} claimed twice");
                    seen[index] = true;
                }
            },
            |count| assert_eq!(count, 1000),
        );
        assert_eq!(summary.spawned_tasks, 1);
        assert!(seen.into_inner().unwrap().iter().all(|&seen| seen));
    }

    #[test]
    fn slice_panic_reaches_caller_without_finalizing() {
        let _trace = trace_init();
        let scheduler = TaskScheduler::builder().worker_threads(2).build();
        let finalized = AtomicUsize::new(0);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            ParallelFor::new(&scheduler).batch(1).workers(4).run(
                64,
                |first, _| {
                    if first == 13 {
                        panic!("slice {first} failed");
                    }
                },
                |count| finalized.store(count, SeqCst),
            )
        }));

        let payload = result.expect_err("the slice panic is resumed");
        let message = payload
            .downcast_ref::<String>()
            .expect("formatted panics carry a String");
        assert_eq!(message, "slice 13 failed");
        assert_eq!(finalized.load(SeqCst), 0);

        // the scheduler is still usable afterwards.
        let total = AtomicUsize::new(0);
        for_each(
            &scheduler,
            10,
            3,
            |_, count| {
                total.fetch_add(count, SeqCst);
            },
            |_| {},
        );
        assert_eq!(total.load(SeqCst), 10);
    }

    proptest! {
        #[test]
        fn partitions_tile_the_range(count in 0usize..5_000, batch in 1usize..300) {
            let partitioner = Partitioner::new(count, batch);
            let mut next = 0;
            let mut partitions = 0;
            while let Some(range) = partitioner.partition() {
                prop_assert_eq!(range.start, next);
                prop_assert!(range.end > range.start);
                prop_assert!(range.len() <= batch);
                next = range.end;
                partitions += 1;
            }
            prop_assert_eq!(next, count);
            prop_assert_eq!(partitions, partitioner.partitions());
        }
    }
}
