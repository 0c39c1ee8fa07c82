use super::Shared;
use crate::Task;
use core::{
    cell::RefCell,
    ptr,
    sync::atomic::{self, Ordering::*},
};
use crossbeam_deque::Worker;
use hyphae_util::sync::SpinWait;
use std::{sync::Arc, thread};

struct Context {
    shared: Arc<Shared>,
    index: usize,
    local: Worker<Arc<Task>>,
}

std::thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Calls `f` with the calling worker's index and local queue, if the caller
/// is one of `shared`'s workers.
pub(super) fn with_local<T>(
    shared: &Shared,
    f: impl FnOnce(usize, &Worker<Arc<Task>>) -> T,
) -> Option<T> {
    CONTEXT.with(|cx| {
        let cx = cx.borrow();
        let cx = cx.as_ref().filter(|cx| ptr::eq(Arc::as_ptr(&cx.shared), shared))?;
        Some(f(cx.index, &cx.local))
    })
}

/// Pushes `task` to the calling worker's local queue, handing it back if the
/// caller is not one of `shared`'s workers.
pub(super) fn push_local(shared: &Shared, task: Arc<Task>) -> Result<(), Arc<Task>> {
    CONTEXT.with(|cx| match cx.borrow().as_ref() {
        Some(cx) if ptr::eq(Arc::as_ptr(&cx.shared), shared) => {
            cx.local.push(task);
            Ok(())
        }
        _ => Err(task),
    })
}

pub(super) fn run(shared: Arc<Shared>, index: usize, local: Worker<Arc<Task>>) {
    let _span = tracing::info_span!("worker", index).entered();
    let sleeper = &shared.sleepers.storage()[index];
    let _ = sleeper.thread.set(thread::current());
    CONTEXT.with(|cx| {
        *cx.borrow_mut() = Some(Context {
            shared: shared.clone(),
            index,
            local,
        })
    });
    tracing::debug!("worker started");

    let mut executed = 0usize;
    let mut parks = 0usize;
    let mut spin = SpinWait::new();
    while shared.is_running() {
        let task =
            with_local(&shared, |index, local| shared.find_task(Some((index, local)))).flatten();
        if let Some(task) = task {
            shared.run(task);
            executed += 1;
            spin.reset();
            continue;
        }

        if !spin.next_spin_will_yield() {
            spin.spin_once();
            continue;
        }

        if !sleeper.links.is_linked() {
            shared.sleepers.push_index(index);
        }
        sleeper.parked.store(true, SeqCst);
        // pairs with the fence in `Shared::enqueue`: either the enqueuer sees
        // this worker parked in `sleepers`, or this worker sees its task.
        atomic::fence(SeqCst);
        if shared.has_work() || !shared.is_running() {
            sleeper.parked.store(false, SeqCst);
            continue;
        }
        test_trace!("parking");
        thread::park_timeout(shared.idle_timeout);
        // woken or timed out, this worker is awake; a stale entry left in
        // `sleepers` is skipped by `wake_one`.
        sleeper.parked.store(false, SeqCst);
        parks += 1;
        spin.reset();
    }

    let Some(cx) = CONTEXT.with(|cx| cx.borrow_mut().take()) else {
        hyphae_util::fatal!("worker {index} lost its context");
    };
    let mut abandoned = 0;
    while let Some(task) = cx.local.pop() {
        if task.abandon() {
            abandoned += 1;
        }
    }
    shared.abandoned.fetch_add(abandoned, Relaxed);
    tracing::debug!(executed, abandoned, parks, "worker stopped");
}
