//! OS threads for the hyphae runtime.
//!
//! A [`Thread`] is a thin wrapper around [`std::thread`] that adds a
//! scheduling [`Priority`] and join-on-drop semantics: a `Thread` that is
//! neither [joined](Thread::join) nor [detached](Thread::detach) is joined
//! when it is dropped.
//!
//! ```
//! use hyphae_thread::{Builder, Priority};
//! use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
//!
//! let hits = Arc::new(AtomicUsize::new(0));
//! let thread = Builder::new()
//!     .name("counter")
//!     .priority(Priority::BelowNormal)
//!     .spawn({
//!         let hits = hits.clone();
//!         move || {
//!             hits.fetch_add(1, Ordering::Relaxed);
//!         }
//!     });
//! thread.join().unwrap();
//! assert_eq!(hits.load(Ordering::Relaxed), 1);
//! ```
#![warn(missing_docs, missing_debug_implementations)]

mod priority;

use std::{
    fmt, io,
    sync::OnceLock,
    thread::{self, JoinHandle},
};

pub use self::priority::Priority;

/// A unit of work that runs on a new thread.
///
/// This is implemented for every `FnOnce() + Send + 'static` closure.
pub trait Runnable: Send + 'static {
    /// Runs the work, consuming it.
    fn run(self: Box<Self>);
}

impl<F> Runnable for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Everything needed to start a [`Thread`].
///
/// [`Builder`] is usually more convenient; `ThreadConfig` exists for callers
/// that assemble the configuration as plain data.
#[derive(Default)]
pub struct ThreadConfig {
    /// The work to run. Starting a thread without one is a fatal error.
    pub callback: Option<Box<dyn Runnable>>,
    /// The thread's name, visible in debuggers and in diagnostics.
    pub name: Option<String>,
    /// The thread's stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
    /// The thread's scheduling priority.
    pub priority: Priority,
}

/// Configures and spawns a new [`Thread`].
#[derive(Debug, Default)]
#[must_use = "a thread builder does nothing until spawned"]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    priority: Priority,
}

/// A handle to a running OS thread.
///
/// Dropping a `Thread` that has not been detached blocks until the thread
/// exits.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    thread: thread::Thread,
}

/// Errors returned by [`Builder::try_spawn`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// The [`ThreadConfig`] had no callback.
    #[error("no callback was provided for thread {name:?}")]
    MissingCallback {
        /// The name of the thread that could not be started.
        name: Option<String>,
    },
    /// The operating system refused to create the thread.
    #[error("failed to spawn thread {name:?}")]
    Os {
        /// The name of the thread that could not be started.
        name: Option<String>,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Errors returned by [`Thread::join`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JoinError {
    /// The thread's callback panicked.
    #[error("thread {name:?} panicked")]
    Panicked {
        /// The name of the thread that panicked.
        name: Option<String>,
    },
    /// The thread was detached and can no longer be joined.
    #[error("thread {name:?} was detached")]
    Detached {
        /// The name of the detached thread.
        name: Option<String>,
    },
}

/// Returns the number of logical processors available to this process.
///
/// The value is computed once and cached. If the platform cannot report it,
/// this returns 1.
#[must_use]
pub fn logical_core_count() -> usize {
    static COUNT: OnceLock<usize> = OnceLock::new();
    *COUNT.get_or_init(|| match thread::available_parallelism() {
        Ok(count) => count.get(),
        Err(error) => {
            tracing::warn!(%error, "could not determine the number of logical cores; assuming 1");
            1
        }
    })
}

/// Returns the name of the calling thread, if it has one.
#[must_use]
pub fn current_name() -> Option<String> {
    thread::current().name().map(String::from)
}

// === impl Builder ===

impl Builder {
    /// Returns a builder with no name, the default stack size, and
    /// [`Priority::Normal`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the thread.
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the thread's stack size in bytes.
    pub fn stack_size(self, bytes: usize) -> Self {
        Self {
            stack_size: Some(bytes),
            ..self
        }
    }

    /// Sets the thread's scheduling priority.
    pub fn priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    /// Spawns a thread running `f`.
    ///
    /// Failing to create the thread is a fatal error; use
    /// [`try_spawn`](Self::try_spawn) to handle it instead.
    #[track_caller]
    pub fn spawn(self, f: impl Runnable) -> Thread {
        match self.try_spawn(f) {
            Ok(thread) => thread,
            Err(error) => hyphae_util::fatal!("{}", ErrorChain(&error)),
        }
    }

    /// Spawns a thread running `f`, returning an error if the operating
    /// system refuses to create it.
    pub fn try_spawn(self, f: impl Runnable) -> Result<Thread, SpawnError> {
        Thread::try_start(ThreadConfig {
            callback: Some(Box::new(f)),
            name: self.name,
            stack_size: self.stack_size,
            priority: self.priority,
        })
    }
}

// === impl Thread ===

impl Thread {
    /// Starts a thread from a [`ThreadConfig`].
    ///
    /// A configuration without a callback, or an OS failure to create the
    /// thread, is a fatal error.
    #[track_caller]
    pub fn start(config: ThreadConfig) -> Self {
        match Self::try_start(config) {
            Ok(thread) => thread,
            Err(error) => hyphae_util::fatal!("{}", ErrorChain(&error)),
        }
    }

    /// Starts a thread from a [`ThreadConfig`], returning an error on
    /// failure.
    pub fn try_start(config: ThreadConfig) -> Result<Self, SpawnError> {
        let ThreadConfig {
            callback,
            name,
            stack_size,
            priority,
        } = config;
        let Some(callback) = callback else {
            return Err(SpawnError::MissingCallback { name });
        };

        let mut builder = thread::Builder::new();
        if let Some(ref name) = name {
            builder = builder.name(name.clone());
        }
        if let Some(bytes) = stack_size {
            builder = builder.stack_size(bytes);
        }

        // threads inherit the spawning thread's default subscriber.
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let handle = builder
            .spawn(move || {
                let _subscriber = tracing::dispatcher::set_default(&dispatch);
                priority::apply(priority);
                callback.run();
            })
            .map_err(|source| SpawnError::Os {
                name: name.clone(),
                source,
            })?;

        tracing::debug!(thread.name = ?name, ?priority, ?stack_size, "thread started");
        let thread = handle.thread().clone();
        Ok(Self {
            handle: Some(handle),
            thread,
        })
    }

    /// Returns the thread's name, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.thread.name()
    }

    /// Returns the thread's unique identifier.
    #[must_use]
    pub fn id(&self) -> thread::ThreadId {
        self.thread.id()
    }

    /// Returns a handle that can be used to [unpark] the thread.
    ///
    /// [unpark]: thread::Thread::unpark
    #[must_use]
    pub fn handle(&self) -> &thread::Thread {
        &self.thread
    }

    /// Wakes the thread if it is parked.
    pub fn unpark(&self) {
        self.thread.unpark()
    }

    /// Returns `true` if the thread's callback has returned (or panicked).
    ///
    /// A detached thread always reports `false`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Blocks until the thread exits.
    ///
    /// Returns an error if the thread's callback panicked.
    pub fn join(mut self) -> Result<(), JoinError> {
        self.join_inner()
    }

    /// Lets the thread run on without being joined.
    pub fn detach(mut self) {
        self.handle = None;
    }

    fn join_inner(&mut self) -> Result<(), JoinError> {
        let name = || self.thread.name().map(String::from);
        let Some(handle) = self.handle.take() else {
            return Err(JoinError::Detached { name: name() });
        };
        handle.join().map_err(|_| JoinError::Panicked { name: name() })
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if let Err(error) = self.join_inner() {
            hyphae_util::report_error!("{error} (joined on drop)");
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.thread.name())
            .field("id", &self.thread.id())
            .field("detached", &self.handle.is_none())
            .finish()
    }
}

impl fmt::Debug for ThreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadConfig")
            .field("has_callback", &self.callback.is_some())
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Formats an error followed by its chain of sources.
struct ErrorChain<'a>(&'a dyn std::error::Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
        time::Duration,
    };

    fn trace_init() -> impl Drop {
        use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};
        tracing_subscriber::fmt()
            .with_test_writer()
            .without_time()
            .with_env_filter(EnvFilter::from_env("RUST_LOG"))
            .with_thread_names(true)
            .set_default()
    }

    #[test]
    fn name_is_visible_inside_thread() {
        let _trace = trace_init();
        let (tx, rx) = mpsc::channel();
        let thread = Builder::new()
            .name("hyphae-test-named")
            .stack_size(256 * 1024)
            .spawn(move || tx.send(current_name()).unwrap());
        assert_eq!(thread.name(), Some("hyphae-test-named"));
        assert_eq!(
            rx.recv().unwrap().as_deref(),
            Some("hyphae-test-named")
        );
        thread.join().unwrap();
    }

    #[test]
    fn drop_joins() {
        let _trace = trace_init();
        let done = Arc::new(AtomicBool::new(false));
        let thread = Builder::new().spawn({
            let done = done.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                done.store(true, Ordering::Release);
            }
        });
        drop(thread);
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn join_reports_panics() {
        let _trace = trace_init();
        let thread = Builder::new()
            .name("hyphae-test-panics")
            .spawn(|| panic!("callback failed"));
        let error = thread.join().expect_err("callback panicked");
        assert!(matches!(
            error,
            JoinError::Panicked { name: Some(ref name) } if name == "hyphae-test-panics"
        ));
    }

    #[test]
    fn park_and_unpark() {
        let _trace = trace_init();
        let ready = Arc::new(AtomicBool::new(false));
        let thread = Builder::new().spawn({
            let ready = ready.clone();
            move || {
                while !ready.load(Ordering::Acquire) {
                    std::thread::park();
                }
            }
        });
        ready.store(true, Ordering::Release);
        thread.unpark();
        thread.join().unwrap();
    }

    #[test]
    fn missing_callback() {
        let error = Thread::try_start(ThreadConfig {
            name: Some("nothing-to-do".into()),
            ..Default::default()
        })
        .expect_err("no callback");
        assert!(matches!(error, SpawnError::MissingCallback { .. }));
        assert_eq!(
            error.to_string(),
            "no callback was provided for thread Some(\"nothing-to-do\")"
        );
    }

    #[test]
    #[should_panic(expected = "no callback was provided")]
    fn start_without_callback_is_fatal() {
        hyphae_util::diag::set_fatal_policy(hyphae_util::diag::FatalPolicy::Panic);
        let _ = Thread::start(ThreadConfig::default());
    }

    #[test]
    fn every_priority_runs() {
        let _trace = trace_init();
        for priority in Priority::ALL {
            Builder::new()
                .priority(priority)
                .spawn(|| {})
                .join()
                .unwrap();
        }
    }

    #[test]
    fn core_count_is_positive() {
        assert!(logical_core_count() >= 1);
        assert_eq!(logical_core_count(), logical_core_count());
    }
}
