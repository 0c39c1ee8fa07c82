//! A fixed pool of worker threads executing [`Task`]s.
//!
//! # Queues
//!
//! Each [`TaskPriority`] has a global injector queue. Every worker also owns a
//! LIFO local queue: `Normal` and `Low` tasks scheduled *from* a worker land
//! there, and idle workers steal from each other's local queues. Workers look
//! for work in this order:
//!
//! 1. the `High` injector,
//! 2. their own local queue,
//! 3. the `Normal` and then the `Low` injector, moving a batch into the local
//!    queue,
//! 4. the other workers' local queues.
//!
//! # Waiting
//!
//! [`TaskScheduler::wait`] and [`TaskScheduler::try_wait`] never just block:
//! while the awaiter is unsatisfied, the waiting thread runs queued tasks
//! itself. A task may therefore wait for a batch it spawned, even on a
//! scheduler whose every worker is doing the same.
//!
//! # Dependencies
//!
//! A task whose dependency awaiter is not yet satisfied is parked on that
//! awaiter in the `Pending` state and enqueued by whichever thread delivers
//! the final signal. Shutting the scheduler down detaches every such task from
//! its dependency and abandons it.
use crate::{
    task::{Task, TaskId, TaskPriority},
    Awaiter,
};
use core::{
    fmt,
    sync::atomic::{self, AtomicBool, AtomicUsize, Ordering::*},
    time::Duration,
};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use hyphae_stack::{AtomicStack, Linked, Links};
use hyphae_thread::{Priority, Thread};
use hyphae_util::sync::SpinWait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};

mod worker;

/// Schedules and runs [`Task`]s on a fixed pool of worker threads.
///
/// Dropping the scheduler shuts it down; see [`shutdown`](Self::shutdown).
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Vec<Thread>,
}

/// Configures a [`TaskScheduler`].
#[derive(Debug, Clone)]
pub struct Builder {
    worker_threads: Option<usize>,
    thread_name_prefix: String,
    stack_size: Option<usize>,
    priority: Priority,
    idle_timeout: Duration,
}

/// State shared between the scheduler handle and its workers.
pub(crate) struct Shared {
    injectors: [Injector<Arc<Task>>; TaskPriority::COUNT],
    stealers: Box<[Stealer<Arc<Task>>]>,
    /// Workers that are parked or about to park.
    sleepers: AtomicStack<Sleeper>,
    running: AtomicBool,
    /// Tasks registered on a dependency that has not been satisfied yet.
    waiting: Mutex<HashMap<TaskId, Arc<Task>>>,
    idle_timeout: Duration,
    executed: AtomicUsize,
    abandoned: AtomicUsize,
}

struct Sleeper {
    links: Links,
    thread: OnceLock<std::thread::Thread>,
    /// Set while the worker is committed to parking. Entries in `sleepers`
    /// whose flag is clear belong to workers that already woke up on their
    /// own.
    parked: AtomicBool,
}

/// A task parked on an unsatisfied dependency.
pub(crate) struct Dependent {
    task: Arc<Task>,
    scheduler: Weak<Shared>,
}

/// How long a helping waiter blocks before looking for work again.
const WAIT_SLICE: Duration = Duration::from_millis(1);

// === impl TaskScheduler ===

impl TaskScheduler {
    /// Returns a scheduler with the default configuration.
    ///
    /// The pool has one worker for each logical core, minus one for the
    /// calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a [`Builder`] for configuring a scheduler.
    #[must_use]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Schedules `task` to run once `dependency` is satisfied, signalling
    /// `awaiter` when it finishes.
    ///
    /// `awaiter` must have been created (or [extended]) with a pending
    /// signal for this task. Scheduling a task twice, or with the same
    /// awaiter as both its completion awaiter and its dependency, is fatal.
    ///
    /// If the scheduler is shutting down, the task is abandoned instead.
    ///
    /// [extended]: Awaiter::add_pending
    #[track_caller]
    pub fn schedule(
        &self,
        task: &Arc<Task>,
        awaiter: &Arc<Awaiter>,
        dependency: &Arc<Awaiter>,
        priority: TaskPriority,
    ) {
        self.shared.schedule(task, awaiter, dependency, priority);
    }

    /// Runs `f` on the scheduler, returning an awaiter satisfied when it
    /// finishes.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) -> Arc<Awaiter> {
        self.spawn_after(&Awaiter::satisfied(), f)
    }

    /// Runs `f` on the scheduler once `dependency` is satisfied, returning an
    /// awaiter satisfied when it finishes.
    pub fn spawn_after(
        &self,
        dependency: &Arc<Awaiter>,
        f: impl FnOnce() + Send + 'static,
    ) -> Arc<Awaiter> {
        let awaiter = Awaiter::new(1);
        let task = Task::scheduler_owned(f);
        self.shared
            .schedule(&task, &awaiter, dependency, TaskPriority::Normal);
        awaiter
    }

    /// Blocks until `awaiter` is satisfied, running queued tasks meanwhile.
    pub fn wait(&self, awaiter: &Awaiter) {
        self.shared.wait_until(awaiter, None);
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns whether the awaiter was satisfied. Timing out does not cancel
    /// anything; the awaiter may still be waited on later.
    #[must_use]
    pub fn try_wait(&self, awaiter: &Awaiter, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        self.shared.wait_until(awaiter, deadline)
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn threads_count(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Returns `true` if called from one of this scheduler's workers.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        self.current_worker_index().is_some()
    }

    /// Returns the index of the calling worker thread, or `None` if the
    /// caller is not one of this scheduler's workers.
    #[must_use]
    pub fn current_worker_index(&self) -> Option<usize> {
        worker::with_local(&self.shared, |index, _| index)
    }

    /// Stops the workers and abandons every task that has not started.
    ///
    /// Tasks that are running finish first. Tasks still waiting for a
    /// dependency are abandoned too, even if the dependency is never
    /// satisfied. Abandoned tasks signal their awaiters, so nothing waiting on
    /// them hangs.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if !self.shared.running.swap(false, AcqRel) {
            return;
        }
        tracing::debug!(workers = self.workers.len(), "shutting down");
        atomic::fence(SeqCst);
        for worker in &self.workers {
            worker.unpark();
        }
        for worker in self.workers.drain(..) {
            if let Err(error) = worker.join() {
                hyphae_util::report_error!("{error}");
            }
        }
        self.shared.abandon_queued();
        self.shared.abandon_waiting();
        tracing::info!(
            executed = self.shared.executed.load(Relaxed),
            abandoned = self.shared.abandoned.load(Relaxed),
            "scheduler stopped"
        );
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("threads", &self.threads_count())
            .field("running", &self.shared.is_running())
            .field("executed", &self.shared.executed.load(Relaxed))
            .field("waiting", &self.shared.waiting.lock().len())
            .finish_non_exhaustive()
    }
}

// === impl Builder ===

impl Builder {
    /// Sets the number of worker threads.
    ///
    /// Zero is allowed: tasks then only run on threads that wait for them.
    #[must_use]
    pub fn worker_threads(self, n: usize) -> Self {
        Self {
            worker_threads: Some(n),
            ..self
        }
    }

    /// Sets the prefix of worker thread names. Workers are named
    /// `{prefix}-{index}`.
    #[must_use]
    pub fn thread_name_prefix(self, prefix: impl Into<String>) -> Self {
        Self {
            thread_name_prefix: prefix.into(),
            ..self
        }
    }

    /// Sets the worker threads' stack size in bytes.
    #[must_use]
    pub fn stack_size(self, bytes: usize) -> Self {
        Self {
            stack_size: Some(bytes),
            ..self
        }
    }

    /// Sets the worker threads' priority.
    #[must_use]
    pub fn priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    /// Sets how long an idle worker parks before checking for work again.
    #[must_use]
    pub fn idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: timeout,
            ..self
        }
    }

    /// Starts the worker threads.
    ///
    /// Failing to start a worker thread is fatal.
    #[track_caller]
    pub fn build(self) -> TaskScheduler {
        let threads = self
            .worker_threads
            .unwrap_or_else(|| hyphae_thread::logical_core_count().saturating_sub(1));
        let (shared, locals) = Shared::new(threads, self.idle_timeout);
        let shared = Arc::new(shared);

        let workers = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let mut builder = hyphae_thread::Builder::new()
                    .name(format!("{}-{index}", self.thread_name_prefix))
                    .priority(self.priority);
                if let Some(bytes) = self.stack_size {
                    builder = builder.stack_size(bytes);
                }
                let shared = shared.clone();
                builder.spawn(move || worker::run(shared, index, local))
            })
            .collect::<Vec<_>>();

        tracing::info!(
            threads,
            prefix = %self.thread_name_prefix,
            priority = %self.priority,
            "scheduler started"
        );
        TaskScheduler { shared, workers }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name_prefix: String::from("hyphae-worker"),
            stack_size: None,
            priority: Priority::Normal,
            idle_timeout: Duration::from_millis(100),
        }
    }
}

// === impl Shared ===

impl Shared {
    /// Returns the shared state for `threads` workers, along with each
    /// worker's local queue.
    fn new(threads: usize, idle_timeout: Duration) -> (Self, Vec<Worker<Arc<Task>>>) {
        let locals = (0..threads)
            .map(|_| Worker::new_lifo())
            .collect::<Vec<_>>();
        let shared = Self {
            injectors: [Injector::new(), Injector::new(), Injector::new()],
            stealers: locals.iter().map(Worker::stealer).collect(),
            sleepers: AtomicStack::new(
                (0..threads)
                    .map(|_| Sleeper {
                        links: Links::new(),
                        thread: OnceLock::new(),
                        parked: AtomicBool::new(false),
                    })
                    .collect::<Box<[_]>>(),
            ),
            running: AtomicBool::new(true),
            waiting: Mutex::new(HashMap::new()),
            idle_timeout,
            executed: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        };
        (shared, locals)
    }

    fn is_running(&self) -> bool {
        self.running.load(Acquire)
    }

    #[track_caller]
    fn schedule(
        self: &Arc<Self>,
        task: &Arc<Task>,
        awaiter: &Arc<Awaiter>,
        dependency: &Arc<Awaiter>,
        priority: TaskPriority,
    ) {
        let id = TaskId::next();
        task.dispatch(id, awaiter, dependency, priority);

        if !dependency.is_satisfied() && task.dispatched_to_pending() {
            // tracked before registering, so a release racing with this call
            // always finds the entry it removes.
            self.waiting.lock().insert(id, task.clone());
            let dependent = Dependent {
                task: task.clone(),
                scheduler: Arc::downgrade(self),
            };
            match dependency.register(dependent) {
                Ok(()) => {
                    test_trace!(%task, "waiting for dependency");
                    if !self.is_running() {
                        // raced with `stop`, which may already have swept.
                        self.abandon_waiting();
                    }
                    return;
                }
                // satisfied in the meantime
                Err(dependent) => {
                    self.waiting.lock().remove(&id);
                    if !dependent.task.pending_to_dispatched() {
                        return;
                    }
                }
            }
        }

        self.enqueue(task.clone());
    }

    fn enqueue(self: &Arc<Self>, task: Arc<Task>) {
        if !self.is_running() {
            if task.abandon() {
                self.abandoned.fetch_add(1, Relaxed);
            }
            return;
        }

        let priority = task.priority().unwrap_or_default();
        let task = match priority {
            TaskPriority::High => Err(task),
            _ => worker::push_local(self, task),
        };
        if let Err(task) = task {
            self.injectors[priority.index()].push(task);
        }

        atomic::fence(SeqCst);
        self.wake_one();

        // lost a race with `stop`; make sure nothing is stranded.
        if !self.is_running() {
            self.abandon_queued();
        }
    }

    /// Wakes one parked worker, discarding stale entries for workers that
    /// are already awake.
    fn wake_one(&self) -> bool {
        while let Some(sleeper) = self.sleepers.pop() {
            if !sleeper.parked.swap(false, SeqCst) {
                test_trace!(worker = self.sleepers.index_of(sleeper), "skipping awake worker");
                continue;
            }
            if let Some(thread) = sleeper.thread.get() {
                test_trace!(worker = self.sleepers.index_of(sleeper), "waking worker");
                thread.unpark();
                return true;
            }
        }
        false
    }

    fn has_work(&self) -> bool {
        self.injectors.iter().any(|injector| !injector.is_empty())
            || self.stealers.iter().any(|stealer| !stealer.is_empty())
    }

    /// Finds a task for the calling thread, which is the worker at `index`
    /// with local queue `local`, or some other thread if `None`.
    fn find_task(&self, local: Option<(usize, &Worker<Arc<Task>>)>) -> Option<Arc<Task>> {
        loop {
            match self.try_find_task(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => core::hint::spin_loop(),
            }
        }
    }

    fn try_find_task(&self, local: Option<(usize, &Worker<Arc<Task>>)>) -> Steal<Arc<Task>> {
        let [high, normal, low] = &self.injectors;
        match local {
            Some((index, local)) => high
                .steal()
                .or_else(|| local.pop().map_or(Steal::Empty, Steal::Success))
                .or_else(|| normal.steal_batch_and_pop(local))
                .or_else(|| low.steal_batch_and_pop(local))
                .or_else(|| self.steal_from_workers(Some(index))),
            None => high
                .steal()
                .or_else(|| normal.steal())
                .or_else(|| low.steal())
                .or_else(|| self.steal_from_workers(None)),
        }
    }

    /// Tries every other worker's local queue, starting after `index`.
    fn steal_from_workers(&self, index: Option<usize>) -> Steal<Arc<Task>> {
        let len = self.stealers.len();
        let start = index.map_or(0, |index| index + 1);
        (0..len)
            .map(|offset| (start + offset) % len)
            .filter(|&victim| Some(victim) != index)
            .map(|victim| self.stealers[victim].steal())
            .collect()
    }

    fn run(&self, task: Arc<Task>) {
        task.execute();
        self.executed.fetch_add(1, Relaxed);
    }

    /// Finds and runs one task on the calling thread.
    fn run_one(&self) -> bool {
        let task = worker::with_local(self, |index, local| self.find_task(Some((index, local))))
            .unwrap_or_else(|| self.find_task(None));
        match task {
            Some(task) => {
                self.run(task);
                true
            }
            None => false,
        }
    }

    fn wait_until(&self, awaiter: &Awaiter, deadline: Option<Instant>) -> bool {
        let mut spin = SpinWait::new();
        loop {
            if awaiter.is_satisfied() {
                return true;
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return awaiter.is_satisfied();
            }

            if self.run_one() {
                spin.reset();
                continue;
            }

            if !spin.next_spin_will_yield() {
                spin.spin_once();
                continue;
            }

            let slice = now + WAIT_SLICE;
            let until = deadline.map_or(slice, |deadline| deadline.min(slice));
            if awaiter.block_until(until) {
                return true;
            }
        }
    }

    /// Abandons every task left in the injector queues, returning how many
    /// were abandoned.
    fn abandon_queued(&self) -> usize {
        let mut abandoned = 0;
        for injector in &self.injectors {
            loop {
                match injector.steal() {
                    Steal::Success(task) => {
                        if task.abandon() {
                            abandoned += 1;
                        }
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        if abandoned > 0 {
            self.abandoned.fetch_add(abandoned, Relaxed);
            tracing::debug!(abandoned, "abandoned queued tasks");
        }
        abandoned
    }

    /// Detaches every task still waiting for a dependency and abandons it,
    /// returning how many were abandoned.
    ///
    /// The dependency's list of dependents is the only other owner of such a
    /// task, and the task owns its dependency, so unregistering is what lets
    /// both be freed.
    fn abandon_waiting(&self) -> usize {
        let waiting = std::mem::take(&mut *self.waiting.lock());
        let mut abandoned = 0;
        for task in waiting.into_values() {
            if let Some(dependency) = task.dependency() {
                dependency.unregister(&task);
            }
            if task.abandon() {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            self.abandoned.fetch_add(abandoned, Relaxed);
            tracing::debug!(abandoned, "abandoned tasks waiting for a dependency");
        }
        abandoned
    }
}

// === impl Dependent ===

impl Dependent {
    /// Enqueues a task whose dependency was just satisfied.
    pub(crate) fn release(self) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            // the scheduler is gone; nothing will ever run it.
            self.task.abandon();
            return;
        };
        if let Some(id) = self.task.id() {
            scheduler.waiting.lock().remove(&id);
        }
        if self.task.pending_to_dispatched() {
            scheduler.enqueue(self.task);
        }
    }

    pub(crate) fn is_for(&self, task: &Arc<Task>) -> bool {
        Arc::ptr_eq(&self.task, task)
    }
}

impl fmt::Debug for Dependent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependent")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

// === impl Sleeper ===

impl Linked for Sleeper {
    fn links(&self) -> &Links {
        &self.links
    }
}
