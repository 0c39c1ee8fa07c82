//! Schedulable units of work.
//!
//! A [`Task`] owns a one-shot closure and tracks its progress through the
//! [`TaskStatus`] state machine. Tasks are handed out as [`Arc<Task>`]; the
//! caller, the scheduler's run queues, and any awaiter the task is parked on
//! each hold a reference, and the task is freed when the last one drops.
//!
//! Every transition is a compare-and-swap on the task's status, so racing
//! calls to [`Task::execute`], [`Task::abandon`] and [`Task::cancel`] agree on
//! a single winner. The task's completion awaiter is signalled exactly once
//! per dispatched task, whichever of those paths ends it.
use crate::{util::panic_message, Awaiter};
use core::{cell::UnsafeCell, fmt};
use hyphae_util::{fatal, fatal_assert, report_error};
use std::{
    borrow::Cow,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};

mod id;
mod state;

pub use self::{id::TaskId, state::TaskStatus};
use self::state::StatusCell;

type Body = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work that runs at most once on a
/// [`TaskScheduler`](crate::TaskScheduler).
pub struct Task {
    status: StatusCell,
    binding: OnceLock<Binding>,
    /// Taken by whichever caller wins the transition out of `Created`,
    /// `Dispatched` or `Pending`.
    body: UnsafeCell<Option<Body>>,
    name: Option<Cow<'static, str>>,
    ownership: Ownership,
}

/// Records who keeps a [`Task`] alive once it has been scheduled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The caller holds its own `Arc<Task>` and may inspect the task after
    /// it finishes.
    #[default]
    Caller,
    /// Only the scheduler references the task; it is freed as soon as it
    /// finishes running or is abandoned.
    Scheduler,
}

/// Selects which run queue a task is placed in.
///
/// Workers always look for `High` tasks first. `Normal` and `Low` tasks
/// scheduled from a worker thread go to that worker's local queue, where
/// other workers may steal them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    /// Run before anything else.
    High = 0,
    /// The default.
    #[default]
    Normal = 1,
    /// Run when no `High` or `Normal` work is available.
    Low = 2,
}

/// Assigned once, when the task is dispatched.
#[derive(Debug)]
struct Binding {
    id: TaskId,
    awaiter: Arc<Awaiter>,
    dependency: Arc<Awaiter>,
    priority: TaskPriority,
}

// Safety: `body` is only touched by the thread that won the status
// transition that consumes it, so at most one thread ever accesses it.
unsafe impl Sync for Task {}

// === impl Task ===

impl Task {
    /// Returns a new caller-owned task that runs `f`.
    #[must_use]
    pub fn new(f: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self::from_parts(None, Ownership::Caller, Box::new(f)))
    }

    /// Returns a new caller-owned task named `name` that runs `f`.
    ///
    /// The name is recorded on the task's tracing span and in diagnostics.
    #[must_use]
    pub fn with_name(
        name: impl Into<Cow<'static, str>>,
        f: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::from_parts(Some(name.into()), Ownership::Caller, Box::new(f)))
    }

    pub(crate) fn scheduler_owned(f: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self::from_parts(None, Ownership::Scheduler, Box::new(f)))
    }

    /// Returns a scheduler-owned task whose body borrows from the caller's
    /// stack.
    ///
    /// # Safety
    ///
    /// The caller must not let anything `body` borrows go out of scope until
    /// the task's completion awaiter is satisfied.
    pub(crate) unsafe fn scoped<'a>(body: Box<dyn FnOnce() + Send + 'a>) -> Arc<Self> {
        // Safety: only the lifetime changes; the caller upholds it.
        let body = unsafe { std::mem::transmute::<Box<dyn FnOnce() + Send + 'a>, Body>(body) };
        Arc::new(Self::from_parts(None, Ownership::Scheduler, body))
    }

    fn from_parts(name: Option<Cow<'static, str>>, ownership: Ownership, body: Body) -> Self {
        Self {
            status: StatusCell::new(),
            binding: OnceLock::new(),
            body: UnsafeCell::new(Some(body)),
            name,
            ownership,
        }
    }

    /// Returns the task's current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    /// Returns the task's ID, or `None` if it has not been dispatched.
    #[must_use]
    pub fn id(&self) -> Option<TaskId> {
        self.binding.get().map(|binding| binding.id)
    }

    /// Returns the task's name, if it was given one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the priority the task was scheduled with, or `None` if it has
    /// not been dispatched.
    #[must_use]
    pub fn priority(&self) -> Option<TaskPriority> {
        self.binding.get().map(|binding| binding.priority)
    }

    /// Returns the awaiter signalled when the task finishes, or `None` if it
    /// has not been dispatched.
    #[must_use]
    pub fn awaiter(&self) -> Option<&Arc<Awaiter>> {
        self.binding.get().map(|binding| &binding.awaiter)
    }

    /// Returns the awaiter that must be satisfied before the task runs, or
    /// `None` if it has not been dispatched.
    #[must_use]
    pub fn dependency(&self) -> Option<&Arc<Awaiter>> {
        self.binding.get().map(|binding| &binding.dependency)
    }

    /// Returns who keeps this task alive.
    #[must_use]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Returns the number of live handles to `task`.
    ///
    /// Cloning the `Arc` acquires a reference and dropping it releases one.
    #[must_use]
    pub fn reference_count(task: &Arc<Self>) -> usize {
        Arc::strong_count(task)
    }

    /// Binds the task to its ID and awaiters and moves it from `Created` to
    /// `Dispatched`.
    ///
    /// Dispatching a task twice, or with the same awaiter as both its
    /// completion awaiter and its dependency, is fatal.
    #[track_caller]
    pub(crate) fn dispatch(
        &self,
        id: TaskId,
        awaiter: &Arc<Awaiter>,
        dependency: &Arc<Awaiter>,
        priority: TaskPriority,
    ) {
        fatal_assert!(
            !Arc::ptr_eq(awaiter, dependency),
            "task {self} cannot depend on its own completion awaiter"
        );
        let binding = Binding {
            id,
            awaiter: awaiter.clone(),
            dependency: dependency.clone(),
            priority,
        };
        if self.binding.set(binding).is_err() {
            fatal!("task {self} was dispatched twice");
        }

        if let Err(actual) = self.status.transition(|status| match status {
            TaskStatus::Created => Some(TaskStatus::Dispatched),
            _ => None,
        }) {
            fatal!("task {self} cannot be dispatched from {actual}");
        }
        test_trace!(task = %self, ?priority, "dispatched");
    }

    /// Parks a dispatched task until its dependency is satisfied.
    ///
    /// Returns `false` if the task was cancelled or abandoned first.
    #[track_caller]
    pub(crate) fn dispatched_to_pending(&self) -> bool {
        self.move_between(TaskStatus::Dispatched, TaskStatus::Pending)
    }

    /// Makes a pending task runnable again.
    ///
    /// Returns `false` if the task was cancelled or abandoned while pending.
    #[track_caller]
    pub(crate) fn pending_to_dispatched(&self) -> bool {
        self.move_between(TaskStatus::Pending, TaskStatus::Dispatched)
    }

    #[track_caller]
    fn move_between(&self, from: TaskStatus, to: TaskStatus) -> bool {
        match self
            .status
            .transition(|status| (status == from).then_some(to))
        {
            Ok(_) => true,
            Err(TaskStatus::Cancelled | TaskStatus::Abandoned) => false,
            Err(actual) => fatal!("task {self} cannot move from {from} to {to}: it is {actual}"),
        }
    }

    /// Runs the task's body and signals its completion awaiter.
    ///
    /// Executing a cancelled or abandoned task does nothing. Executing a
    /// task that was never dispatched, is already running, or has completed
    /// is fatal, as is executing one whose dependency is not yet satisfied.
    ///
    /// A panic in the body is caught and reported; the task still completes.
    #[track_caller]
    pub fn execute(&self) {
        match self.status.transition(|status| match status {
            TaskStatus::Dispatched | TaskStatus::Pending => Some(TaskStatus::Executing),
            _ => None,
        }) {
            Ok(_) => {}
            Err(TaskStatus::Cancelled | TaskStatus::Abandoned) => {
                test_trace!(task = %self, "skipping finished task");
                return;
            }
            Err(actual) => fatal!("task {self} cannot be executed: it is {actual}"),
        }

        let Some(binding) = self.binding.get() else {
            fatal!("task {self} is executing without being dispatched");
        };
        fatal_assert!(
            binding.dependency.is_satisfied(),
            "task {self} started before its dependency was satisfied ({} pending)",
            binding.dependency.pending()
        );

        // Safety: winning the transition to `Executing` grants exclusive
        // access to the body.
        let body = unsafe { (*self.body.get()).take() };
        if let Some(body) = body {
            let span = tracing::debug_span!("task", id = %binding.id, name = self.name());
            let _enter = span.enter();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                report_error!("task {self} panicked: {}", panic_message(&*payload));
            }
        }

        // an abandon that raced with the body leaves the task `Abandoned`.
        let _ = self.status.transition(|status| match status {
            TaskStatus::Executing => Some(TaskStatus::Completed),
            _ => None,
        });
        binding.awaiter.signal();
    }

    /// Abandons the task without running it.
    ///
    /// A dispatched or pending task drops its body and signals its awaiter.
    /// A running task is marked `Abandoned` but its body finishes, and the
    /// awaiter is signalled when it does. Returns `false` if the task had
    /// already finished, been cancelled, or been abandoned.
    ///
    /// Abandoning a task that was never dispatched is fatal.
    #[track_caller]
    pub fn abandon(&self) -> bool {
        match self.status.transition(|status| match status {
            TaskStatus::Dispatched | TaskStatus::Pending | TaskStatus::Executing => {
                Some(TaskStatus::Abandoned)
            }
            _ => None,
        }) {
            Ok(TaskStatus::Executing) => true,
            Ok(_) => {
                self.finish_unrun();
                true
            }
            Err(TaskStatus::Created) => fatal!("task {self} was abandoned before being dispatched"),
            Err(_) => false,
        }
    }

    /// Cancels the task if it has not started running.
    ///
    /// Returns `false` if the task is running or already finished.
    pub fn cancel(&self) -> bool {
        match self.status.transition(|status| match status {
            TaskStatus::Created | TaskStatus::Dispatched | TaskStatus::Pending => {
                Some(TaskStatus::Cancelled)
            }
            _ => None,
        }) {
            Ok(TaskStatus::Created) => {
                // Safety: winning the transition out of `Created` grants
                // exclusive access to the body.
                drop(unsafe { (*self.body.get()).take() });
                true
            }
            Ok(_) => {
                self.finish_unrun();
                true
            }
            Err(_) => false,
        }
    }

    /// Drops the body of a task that will never run and signals its awaiter.
    fn finish_unrun(&self) {
        // Safety: the caller won the transition out of `Dispatched` or
        // `Pending`, which grants exclusive access to the body.
        drop(unsafe { (*self.body.get()).take() });
        if let Some(binding) = self.binding.get() {
            test_trace!(task = %self, status = %self.status(), "finished without running");
            binding.awaiter.signal();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.binding.get();
        f.debug_struct("Task")
            .field("id", &binding.map(|b| b.id))
            .field("name", &self.name)
            .field("status", &self.status)
            .field("priority", &binding.map(|b| b.priority))
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.id(), self.name()) {
            (Some(id), Some(name)) => write!(f, "{name} ({id})"),
            (Some(id), None) => write!(f, "{id}"),
            (None, Some(name)) => write!(f, "{name} (undispatched)"),
            (None, None) => f.write_str("<undispatched>"),
        }
    }
}

// === impl TaskPriority ===

impl TaskPriority {
    pub(crate) const COUNT: usize = 3;

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{fatal_panics, trace_init};
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    fn dispatched(f: impl FnOnce() + Send + 'static) -> (Arc<Task>, Arc<Awaiter>) {
        let task = Task::with_name("test", f);
        let awaiter = Awaiter::new(1);
        task.dispatch(TaskId::next(), &awaiter, &Awaiter::satisfied(), TaskPriority::Normal);
        (task, awaiter)
    }

    #[test]
    fn execute_runs_once_and_signals() {
        let _trace = trace_init();
        let runs = Arc::new(AtomicUsize::new(0));
        let (task, awaiter) = dispatched({
            let runs = runs.clone();
            move || {
                runs.fetch_add(1, SeqCst);
            }
        });

        assert_eq!(task.status(), TaskStatus::Dispatched);
        assert!(task.id().is_some());
        task.execute();
        assert_eq!(runs.load(SeqCst), 1);
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(awaiter.is_satisfied());
        assert!(!task.abandon());
        assert!(!task.cancel());
    }

    #[test]
    fn panicking_body_still_completes() {
        let _trace = trace_init();
        let (task, awaiter) = dispatched(|| panic!("task body failed"));
        task.execute();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(awaiter.is_satisfied());
    }

    #[test]
    fn abandon_signals_without_running() {
        let _trace = trace_init();
        let (task, awaiter) = dispatched(|| panic!("abandoned tasks must not run"));
        assert!(task.abandon());
        assert_eq!(task.status(), TaskStatus::Abandoned);
        assert!(awaiter.is_satisfied());

        // idempotent, and executing is now a no-op.
        assert!(!task.abandon());
        task.execute();
        assert_eq!(task.status(), TaskStatus::Abandoned);
    }

    #[test]
    fn cancel_before_dispatch() {
        let _trace = trace_init();
        let task = Task::new(|| panic!("cancelled tasks must not run"));
        assert!(task.cancel());
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.id(), None);
    }

    #[test]
    fn cancel_dispatched_signals() {
        let _trace = trace_init();
        let (task, awaiter) = dispatched(|| panic!("cancelled tasks must not run"));
        assert!(task.cancel());
        assert!(awaiter.is_satisfied());
        task.execute();
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn pending_round_trip() {
        let _trace = trace_init();
        let (task, _awaiter) = dispatched(|| {});
        assert!(task.dispatched_to_pending());
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.pending_to_dispatched());
        assert_eq!(task.status(), TaskStatus::Dispatched);
        assert!(task.abandon());
        assert!(!task.dispatched_to_pending());
    }

    #[test]
    fn abandon_while_executing_keeps_abandoned() {
        let _trace = trace_init();
        let slot: Arc<OnceLock<Arc<Task>>> = Arc::new(OnceLock::new());
        let (task, awaiter) = dispatched({
            let slot = slot.clone();
            move || {
                let this = slot.get().expect("task handle is set before execution");
                assert!(this.abandon());
            }
        });
        slot.set(task.clone()).expect("slot is empty");
        task.execute();
        assert_eq!(task.status(), TaskStatus::Abandoned);
        assert!(awaiter.is_satisfied());
    }

    #[test]
    fn reference_count_tracks_handles() {
        let task = Task::new(|| {});
        assert_eq!(Task::reference_count(&task), 1);
        let other = task.clone();
        assert_eq!(Task::reference_count(&task), 2);
        drop(other);
        assert_eq!(Task::reference_count(&task), 1);
        assert_eq!(task.ownership(), Ownership::Caller);
    }

    #[test]
    #[should_panic = "cannot be executed"]
    fn execute_created_is_fatal() {
        fatal_panics();
        Task::new(|| {}).execute();
    }

    #[test]
    #[should_panic = "cannot be executed"]
    fn execute_completed_is_fatal() {
        fatal_panics();
        let (task, _awaiter) = dispatched(|| {});
        task.execute();
        task.execute();
    }

    struct Matching {
        needle: &'static str,
        seen: Arc<AtomicUsize>,
    }

    impl hyphae_util::diag::TraceListener for Matching {
        fn on_record(&self, record: &hyphae_util::diag::Record<'_>) {
            if record.to_string().contains(self.needle) {
                self.seen.fetch_add(1, SeqCst);
            }
        }
    }

    #[test]
    fn execute_executing_is_fatal() {
        let _trace = trace_init();
        fatal_panics();
        let seen = Arc::new(AtomicUsize::new(0));
        let listener = hyphae_util::diag::add_listener(Matching {
            needle: "nested-execute",
            seen: seen.clone(),
        });

        let slot: Arc<OnceLock<Arc<Task>>> = Arc::new(OnceLock::new());
        let task = Task::with_name("nested-execute", {
            let slot = slot.clone();
            move || slot.get().expect("task handle is set before execution").execute()
        });
        let awaiter = Awaiter::new(1);
        task.dispatch(TaskId::next(), &awaiter, &Awaiter::satisfied(), TaskPriority::Normal);
        slot.set(task.clone()).expect("slot is empty");

        // the nested fatal unwinds out of the body, where it is caught and
        // reported; the outer execution still completes.
        task.execute();
        hyphae_util::diag::remove_listener(listener);
        assert!(seen.load(SeqCst) >= 1, "nested execute was not fatal");
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(awaiter.is_satisfied());
    }

    #[test]
    #[should_panic = "dispatched twice"]
    fn double_dispatch_is_fatal() {
        fatal_panics();
        let (task, awaiter) = dispatched(|| {});
        task.dispatch(TaskId::next(), &awaiter, &Awaiter::satisfied(), TaskPriority::Normal);
    }

    #[test]
    #[should_panic = "its own completion awaiter"]
    fn self_dependency_is_fatal() {
        fatal_panics();
        let task = Task::new(|| {});
        let awaiter = Awaiter::new(1);
        task.dispatch(TaskId::next(), &awaiter, &awaiter, TaskPriority::Normal);
    }

    #[test]
    #[should_panic = "before being dispatched"]
    fn abandon_created_is_fatal() {
        fatal_panics();
        Task::new(|| {}).abandon();
    }
}
