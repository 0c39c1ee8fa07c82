/// Reports an unrecoverable error and terminates the process.
///
/// The call site, the formatted message, and the current thread's name are
/// handed to [`diag::fatal`], which emits them as a `tracing` event, forwards
/// them to every registered [`TraceListener`], and then applies the
/// process-wide [`FatalPolicy`].
///
/// [`diag::fatal`]: crate::diag::fatal
/// [`TraceListener`]: crate::diag::TraceListener
/// [`FatalPolicy`]: crate::diag::FatalPolicy
///
/// # Examples
///
/// ```should_panic
/// use hyphae_util::{diag, fatal};
///
/// diag::set_fatal_policy(diag::FatalPolicy::Panic);
/// let slot = 7;
/// fatal!("slot {slot} was released twice");
/// ```
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::diag::fatal(
            $crate::__private::Location::caller(),
            None,
            format_args!($($arg)+),
        )
    };
}

/// Checks a condition that must hold, reporting a fatal error if it does not.
///
/// Unlike `assert!`, this check is never compiled out: a violated
/// `fatal_assert!` always reaches [`diag::fatal`], along with the text of the
/// failed condition.
///
/// [`diag::fatal`]: crate::diag::fatal
///
/// # Examples
///
/// ```should_panic
/// use hyphae_util::{diag, fatal_assert};
///
/// diag::set_fatal_policy(diag::FatalPolicy::Panic);
/// let batch = 0;
/// fatal_assert!(batch > 0, "batch size must be non-zero");
/// ```
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::diag::fatal(
                $crate::__private::Location::caller(),
                Some(stringify!($cond)),
                format_args!("assertion failed"),
            )
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::diag::fatal(
                $crate::__private::Location::caller(),
                Some(stringify!($cond)),
                format_args!($($arg)+),
            )
        }
    };
}

/// Reports a recoverable problem with [`Severity::Warn`](crate::diag::Severity::Warn).
#[macro_export]
macro_rules! report_warn {
    ($($arg:tt)+) => {
        $crate::diag::report(
            $crate::diag::Severity::Warn,
            $crate::__private::Location::caller(),
            format_args!($($arg)+),
        )
    };
}

/// Reports a recoverable problem with [`Severity::Error`](crate::diag::Severity::Error).
#[macro_export]
macro_rules! report_error {
    ($($arg:tt)+) => {
        $crate::diag::report(
            $crate::diag::Severity::Error,
            $crate::__private::Location::caller(),
            format_args!($($arg)+),
        )
    };
}

macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    }
}

#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(not(test))]
macro_rules! test_trace {
    ($($t:tt)*) => {};
}

#[cfg(test)]
macro_rules! test_trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}
