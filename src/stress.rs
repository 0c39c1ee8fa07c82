use color_eyre::eyre::{ensure, eyre, Result};
use hyphae::{
    stack::{AtomicStack, Linked, Links},
    tasks::parallel::{self, ParallelFor, MAX_PARALLEL_TASKS},
    thread::Builder,
    util::sync::{Mutex, RwLock, SequentialLock},
    Runtime,
};
use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering::*},
    time::Instant,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Scenario {
    /// Push every node of a lock-free stack from a parallel loop, then drain it.
    Stack,
    /// Check that a parallel loop claims every index exactly once.
    Partition,
    /// Sum a range in parallel and check the helper task cap.
    ParallelFor,
    /// Contend on the futex-backed mutex and the reader/writer lock.
    CriticalSection,
    /// Read a sequence lock from a parallel loop while a thread writes it.
    Seqlock,
    /// Every scenario above.
    All,
}

#[derive(Debug)]
pub(crate) struct Params {
    pub(crate) count: usize,
    pub(crate) batch: usize,
}

struct Node {
    links: Links,
    value: u64,
}

impl Scenario {
    pub(crate) fn expand(&self) -> &'static [Scenario] {
        match self {
            Scenario::Stack => &[Scenario::Stack],
            Scenario::Partition => &[Scenario::Partition],
            Scenario::ParallelFor => &[Scenario::ParallelFor],
            Scenario::CriticalSection => &[Scenario::CriticalSection],
            Scenario::Seqlock => &[Scenario::Seqlock],
            Scenario::All => &[
                Scenario::Stack,
                Scenario::Partition,
                Scenario::ParallelFor,
                Scenario::CriticalSection,
                Scenario::Seqlock,
            ],
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use clap::ValueEnum;
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => fmt::Debug::fmt(self, f),
        }
    }
}

impl Linked for Node {
    fn links(&self) -> &Links {
        &self.links
    }
}

pub(crate) fn run(runtime: &Runtime, scenario: Scenario, params: &Params) -> Result<()> {
    let _span = tracing::info_span!("scenario", %scenario, params.count, params.batch).entered();
    let started = Instant::now();
    match scenario {
        Scenario::Stack => stack(runtime, params)?,
        Scenario::Partition => partition(runtime, params)?,
        Scenario::ParallelFor => parallel_for(runtime, params)?,
        Scenario::CriticalSection => critical_section(runtime, params)?,
        Scenario::Seqlock => seqlock(runtime, params)?,
        Scenario::All => {
            for &scenario in scenario.expand() {
                run(runtime, scenario, params)?;
            }
        }
    }
    tracing::info!(elapsed = ?started.elapsed(), "passed");
    Ok(())
}

fn stack(runtime: &Runtime, params: &Params) -> Result<()> {
    let n = params.count;
    let stack = AtomicStack::new(
        (0..n as u64)
            .map(|value| Node {
                links: Links::new(),
                value,
            })
            .collect::<Vec<_>>(),
    );
    parallel::for_each(
        runtime.scheduler(),
        n,
        params.batch,
        |first, count| {
            for index in first..first + count {
                stack.push_index(index);
            }
        },
        |_| {},
    );

    let mut seen = vec![false; n];
    let mut sum = 0u64;
    for node in stack.drain() {
        let value = node.value as usize;
        ensure!(!seen[value], "node {value} was popped twice");
        seen[value] = true;
        sum += node.value;
    }
    let expected = (n as u64) * (n as u64).saturating_sub(1) / 2;
    ensure!(sum == expected, "node values summed to {sum}, expected {expected}");
    ensure!(seen.iter().all(|&seen| seen), "some nodes were lost");
    Ok(())
}

fn partition(runtime: &Runtime, params: &Params) -> Result<()> {
    let hits = (0..params.count).map(|_| AtomicU8::new(0)).collect::<Vec<_>>();
    let finalized = AtomicUsize::new(usize::MAX);
    let summary = parallel::for_each(
        runtime.scheduler(),
        params.count,
        params.batch,
        |first, count| {
            for hit in &hits[first..first + count] {
                hit.fetch_add(1, Relaxed);
            }
        },
        |count| finalized.store(count, Release),
    );
    tracing::debug!(summary.spawned_tasks, "partitioned");

    if let Some(index) = hits.iter().position(|hit| hit.load(Relaxed) != 1) {
        return Err(eyre!(
            "index {index} was claimed {} times",
            hits[index].load(Relaxed)
        ));
    }
    ensure!(
        finalized.load(Acquire) == params.count,
        "finalize was not called with the loop's count"
    );
    Ok(())
}

fn parallel_for(runtime: &Runtime, params: &Params) -> Result<()> {
    let n = params.count as u64;
    let sum = AtomicU64::new(0);
    parallel::for_each(
        runtime.scheduler(),
        params.count,
        params.batch,
        |first, count| {
            let slice: u64 = (first as u64..(first + count) as u64).sum();
            sum.fetch_add(slice, Relaxed);
        },
        |_| {},
    );
    let expected = n * n.saturating_sub(1) / 2;
    ensure!(sum.load(Relaxed) == expected, "sum was {sum:?}, expected {expected}");

    // ask for far more helpers than the cap allows.
    let active = AtomicUsize::new(0);
    let max_active = AtomicUsize::new(0);
    let summary = ParallelFor::new(runtime.scheduler())
        .batch(1)
        .workers(1000)
        .run(
            params.count.saturating_mul(10),
            |_, _| {
                let now = active.fetch_add(1, AcqRel) + 1;
                max_active.fetch_max(now, AcqRel);
                active.fetch_sub(1, AcqRel);
            },
            |_| {},
        );
    let max_active = max_active.into_inner();
    tracing::debug!(summary.spawned_tasks, max_active, "capped loop finished");
    ensure!(
        summary.spawned_tasks <= MAX_PARALLEL_TASKS,
        "spawned {} helper tasks",
        summary.spawned_tasks
    );
    ensure!(
        max_active <= MAX_PARALLEL_TASKS + 1,
        "{max_active} slices ran at once"
    );
    Ok(())
}

fn critical_section(runtime: &Runtime, params: &Params) -> Result<()> {
    let counter = Mutex::new(0usize);
    let table = RwLock::new(vec![0usize; 64]);
    parallel::for_each(
        runtime.scheduler(),
        params.count,
        params.batch,
        |first, count| {
            for index in first..first + count {
                *counter.lock() += 1;
                if index % 8 == 0 {
                    table.write()[index % 64] += 1;
                } else {
                    let table = table.read();
                    // readers never see a write in progress.
                    let _ = table.iter().sum::<usize>();
                }
            }
        },
        |_| {},
    );

    let total = counter.into_inner();
    ensure!(total == params.count, "counter was {total}, expected {}", params.count);
    let writes = table.into_inner().into_iter().sum::<usize>();
    let expected = (params.count + 7) / 8;
    ensure!(writes == expected, "{writes} table writes, expected {expected}");
    Ok(())
}

fn seqlock(runtime: &Runtime, params: &Params) -> Result<()> {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct Pair {
        a: u64,
        b: u64,
        sum: u64,
    }

    let writes = params.count as u64;
    let lock = std::sync::Arc::new(SequentialLock::new(Pair { a: 0, b: 0, sum: 0 }));
    let done = std::sync::Arc::new(AtomicBool::new(false));
    let writer = Builder::new().name("seqlock-writer").spawn({
        let lock = lock.clone();
        let done = done.clone();
        move || {
            for i in 1..=writes {
                lock.write(Pair { a: i, b: i, sum: i * 2 });
            }
            done.store(true, Release);
        }
    });

    let torn = AtomicUsize::new(0);
    let reads = AtomicUsize::new(0);
    while !done.load(Acquire) {
        parallel::for_each(
            runtime.scheduler(),
            params.count,
            params.batch,
            |_, count| {
                for _ in 0..count {
                    let Pair { a, b, sum } = lock.read();
                    if a != b || sum != a * 2 {
                        torn.fetch_add(1, Relaxed);
                    }
                }
                reads.fetch_add(count, Relaxed);
            },
            |_| {},
        );
    }
    writer
        .join()
        .map_err(|error| eyre!("seqlock writer failed: {error}"))?;

    let torn = torn.into_inner();
    tracing::debug!(reads = reads.into_inner(), torn, "seqlock readers finished");
    ensure!(torn == 0, "{torn} torn reads");
    ensure!(lock.read().a == writes, "last write was lost");
    Ok(())
}
