//! Fatal-error and diagnostic reporting.
//!
//! Runtime invariants are checked with [`fatal_assert!`] and [`fatal!`] rather
//! than `assert!`/`panic!`. A fatal error is first emitted as a `tracing`
//! event, then forwarded to every [`TraceListener`] registered with
//! [`add_listener`], and finally handled according to the process-wide
//! [`FatalPolicy`]: by default the process aborts, but tests (and embedders
//! that prefer unwinding) can select [`FatalPolicy::Panic`].
//!
//! Recoverable problems are reported through [`report`] (or the
//! [`report_warn!`] and [`report_error!`] macros), which reach the same
//! listeners without terminating anything.
//!
//! [`fatal_assert!`]: crate::fatal_assert
//! [`fatal!`]: crate::fatal
//! [`report_warn!`]: crate::report_warn
//! [`report_error!`]: crate::report_error
use crate::sync::RwLock;
use core::{
    cell::Cell,
    fmt,
    panic::Location,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};
use std::{
    backtrace::{Backtrace, BacktraceStatus},
    io::{self, Write},
    sync::Arc,
};

/// How severe a reported [`Record`] is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Something unexpected happened, but execution continues normally.
    Warn,
    /// An operation failed; the process keeps running.
    Error,
    /// An invariant was violated; the process is about to terminate.
    Fatal,
}

/// What the process does after a fatal error has been reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FatalPolicy {
    /// Abort the process immediately.
    #[default]
    Abort = 0,
    /// Unwind with a panic carrying the formatted record.
    Panic = 1,
}

/// A single diagnostic, as delivered to [`TraceListener`]s.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    severity: Severity,
    location: &'static Location<'static>,
    condition: Option<&'a str>,
    message: fmt::Arguments<'a>,
    thread: Option<&'a str>,
}

/// Receives every diagnostic reported by this process.
///
/// Listeners are invoked on the reporting thread, after the registry lock has
/// been released. A listener may therefore register or remove listeners, but
/// it must not report a fatal error itself: a fatal error raised while another
/// is being reported on the same thread skips the listeners entirely.
pub trait TraceListener: Send + Sync {
    /// Called once for each reported record.
    fn on_record(&self, record: &Record<'_>);

    /// Flushes any buffered output.
    ///
    /// This is called after a fatal record has been delivered to every
    /// listener, before the process terminates.
    fn flush(&self) {}
}

/// Identifies a listener registered with [`add_listener`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A [`TraceListener`] that writes each record to standard error.
#[derive(Copy, Clone, Debug, Default)]
pub struct StderrListener;

struct Registered {
    id: ListenerId,
    listener: Arc<dyn TraceListener>,
}

static LISTENERS: RwLock<Vec<Registered>> = RwLock::new(Vec::new());
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);
static FATAL_POLICY: AtomicU8 = AtomicU8::new(FatalPolicy::Abort as u8);

std::thread_local! {
    static IN_FATAL: Cell<bool> = const { Cell::new(false) };
}

/// Registers a listener that will receive every subsequent record.
pub fn add_listener(listener: impl TraceListener + 'static) -> ListenerId {
    let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
    LISTENERS.write().push(Registered {
        id,
        listener: Arc::new(listener),
    });
    tracing::trace!(?id, "diagnostic listener added");
    id
}

/// Removes a previously registered listener.
///
/// Returns `false` if no listener with that id is registered.
pub fn remove_listener(id: ListenerId) -> bool {
    let mut listeners = LISTENERS.write();
    let before = listeners.len();
    listeners.retain(|registered| registered.id != id);
    before != listeners.len()
}

/// Sets the process-wide [`FatalPolicy`], returning the previous one.
pub fn set_fatal_policy(policy: FatalPolicy) -> FatalPolicy {
    match FATAL_POLICY.swap(policy as u8, Ordering::AcqRel) {
        1 => FatalPolicy::Panic,
        _ => FatalPolicy::Abort,
    }
}

/// Returns the current process-wide [`FatalPolicy`].
#[must_use]
pub fn fatal_policy() -> FatalPolicy {
    match FATAL_POLICY.load(Ordering::Acquire) {
        1 => FatalPolicy::Panic,
        _ => FatalPolicy::Abort,
    }
}

/// Reports a fatal error and terminates according to the [`FatalPolicy`].
///
/// This is the function behind [`fatal!`](crate::fatal) and
/// [`fatal_assert!`](crate::fatal_assert); prefer the macros, which capture
/// `location` and `condition` automatically.
#[cold]
#[inline(never)]
pub fn fatal(
    location: &'static Location<'static>,
    condition: Option<&'static str>,
    message: fmt::Arguments<'_>,
) -> ! {
    let current = std::thread::current();
    let record = Record {
        severity: Severity::Fatal,
        location,
        condition,
        message,
        thread: current.name(),
    };

    let policy = fatal_policy();
    if IN_FATAL.with(|in_fatal| in_fatal.replace(true)) {
        // reporting the first fatal error failed; don't try again.
        if policy == FatalPolicy::Abort {
            std::process::abort();
        }
    } else {
        tracing::error!(target: "hyphae::fatal", %location, condition, "{message}");
        dispatch(&record);
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            tracing::error!(target: "hyphae::fatal", "backtrace:\n{backtrace}");
        }
    }

    match policy {
        FatalPolicy::Abort => std::process::abort(),
        FatalPolicy::Panic => {
            IN_FATAL.with(|in_fatal| in_fatal.set(false));
            panic!("{record}")
        }
    }
}

/// Reports a recoverable diagnostic to `tracing` and every registered
/// listener.
///
/// Reporting a [`Severity::Fatal`] record through this function does *not*
/// terminate the process; use [`fatal!`](crate::fatal) for that.
pub fn report(
    severity: Severity,
    location: &'static Location<'static>,
    message: fmt::Arguments<'_>,
) {
    match severity {
        Severity::Warn => tracing::warn!(target: "hyphae::diag", %location, "{message}"),
        Severity::Error | Severity::Fatal => {
            tracing::error!(target: "hyphae::diag", %location, "{message}")
        }
    }
    let current = std::thread::current();
    dispatch(&Record {
        severity,
        location,
        condition: None,
        message,
        thread: current.name(),
    });
}

fn dispatch(record: &Record<'_>) {
    let listeners = LISTENERS
        .read()
        .iter()
        .map(|registered| registered.listener.clone())
        .collect::<Vec<_>>();
    for listener in &listeners {
        listener.on_record(record);
    }
    if record.severity == Severity::Fatal {
        for listener in &listeners {
            listener.flush();
        }
    }
}

// === impl Record ===

impl<'a> Record<'a> {
    /// Returns the record's severity.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Returns the source location that reported the record.
    #[must_use]
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Returns the text of the failed condition, for records produced by
    /// [`fatal_assert!`](crate::fatal_assert).
    #[must_use]
    pub fn condition(&self) -> Option<&'a str> {
        self.condition
    }

    /// Returns the formatted message.
    #[must_use]
    pub fn message(&self) -> fmt::Arguments<'a> {
        self.message
    }

    /// Returns the name of the thread that reported the record, if it has one.
    #[must_use]
    pub fn thread(&self) -> Option<&'a str> {
        self.thread
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.severity)?;
        if let Some(thread) = self.thread {
            write!(f, " [{thread}]")?;
        }
        if let Some(condition) = self.condition {
            write!(f, " (`{condition}` failed)")?;
        }
        write!(f, ": {}", self.message)
    }
}

// === impl Severity ===

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Severity::Warn => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal error",
        })
    }
}

// === impl TraceListener ===

impl<F> TraceListener for F
where
    F: Fn(&Record<'_>) + Send + Sync,
{
    fn on_record(&self, record: &Record<'_>) {
        self(record)
    }
}

impl TraceListener for StderrListener {
    fn on_record(&self, record: &Record<'_>) {
        // nothing useful to do if stderr is gone
        let _ = writeln!(io::stderr().lock(), "{record}");
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::{trace_init, with_fatal_panics};
    use std::sync::Mutex;

    fn capture(token: &'static str) -> (ListenerId, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = add_listener(move |record: &Record<'_>| {
            let line = record.to_string();
            if line.contains(token) {
                sink.lock().unwrap().push(line);
            }
        });
        (id, seen)
    }

    #[test]
    fn report_reaches_listeners() {
        let _trace = trace_init();
        let (id, seen) = capture("report-reaches-listeners");

        crate::report_warn!("report-reaches-listeners {}", 1);
        crate::report_error!("report-reaches-listeners {}", 2);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("warning"), "{seen:?}");
        assert!(seen[1].contains("error"), "{seen:?}");
        assert!(remove_listener(id));
        assert!(!remove_listener(id));
    }

    #[test]
    fn removed_listener_is_not_called() {
        let _trace = trace_init();
        let (id, seen) = capture("removed-listener");
        assert!(remove_listener(id));

        crate::report_warn!("removed-listener");

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn fatal_assert_notifies_listeners_then_panics() {
        let _trace = trace_init();
        let (id, seen) = capture("fatal-assert-listener");

        let result = with_fatal_panics(|| {
            std::panic::catch_unwind(|| {
                let value = 3;
                crate::fatal_assert!(value == 4, "fatal-assert-listener: value was {value}");
            })
        });

        let payload = result.expect_err("fatal_assert! must not return");
        let message = payload
            .downcast_ref::<String>()
            .expect("fatal panics carry a formatted String");
        assert!(message.contains("`value == 4` failed"), "{message}");
        assert!(message.contains("value was 3"), "{message}");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1, "{seen:?}");
        assert!(seen[0].contains("fatal error"), "{seen:?}");
        assert!(seen[0].contains(file!()), "{seen:?}");
        remove_listener(id);
    }

    #[test]
    #[should_panic(expected = "fatal-macro-panics")]
    fn fatal_macro_panics_under_panic_policy() {
        with_fatal_panics(|| crate::fatal!("fatal-macro-panics {}", "now"))
    }

    #[test]
    fn passing_fatal_assert_is_silent() {
        let (id, seen) = capture("passing-fatal-assert");
        crate::fatal_assert!(1 + 1 == 2, "passing-fatal-assert");
        assert!(seen.lock().unwrap().is_empty());
        remove_listener(id);
    }
}
