use hyphae_tasks::TaskScheduler;
use hyphae_util::diag::{self, FatalPolicy, ListenerId, StderrListener};
use std::{env::VarError, fmt, num::ParseIntError};

/// Configures a [`Runtime`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct RuntimeConfig {
    /// Number of scheduler worker threads. Defaults to one per logical core,
    /// minus one for the thread that owns the runtime.
    pub worker_threads: Option<usize>,
    /// Stack size of each worker thread, in bytes.
    pub worker_stack_size: Option<usize>,
    /// What a fatal error does to the process.
    pub fatal_policy: FatalPolicy,
    /// Whether diagnostics are also written to standard error.
    pub stderr_diagnostics: bool,
}

/// A malformed runtime configuration variable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable that should hold a count held something else.
    #[error("`{var}` must be a non-negative integer, not {value:?}")]
    InvalidNumber {
        /// The variable's name.
        var: &'static str,
        /// What it held.
        value: String,
        /// Why it didn't parse.
        #[source]
        source: ParseIntError,
    },
    /// The fatal policy variable held something other than a policy name.
    #[error("`{var}` must be `abort` or `panic`, not {value:?}")]
    InvalidFatalPolicy {
        /// The variable's name.
        var: &'static str,
        /// What it held.
        value: String,
    },
    /// A variable was not valid unicode.
    #[error("`{var}` is not valid unicode")]
    NotUnicode {
        /// The variable's name.
        var: &'static str,
    },
}

/// Owns the process-wide pieces of the concurrency core.
///
/// Creating a runtime installs its diagnostics configuration (fatal policy
/// and, optionally, a standard error listener) and then starts the task
/// scheduler. Dropping it stops the scheduler first and then restores the
/// diagnostics configuration it replaced.
pub struct Runtime {
    scheduler: Option<TaskScheduler>,
    listener: Option<ListenerId>,
    previous_policy: FatalPolicy,
}

// === impl RuntimeConfig ===

impl RuntimeConfig {
    /// Sets the number of worker threads.
    pub const WORKER_THREADS: &'static str = "HYPHAE_WORKER_THREADS";
    /// Sets the worker stack size in bytes.
    pub const WORKER_STACK_SIZE: &'static str = "HYPHAE_WORKER_STACK_SIZE";
    /// Sets the fatal policy: `abort` or `panic`.
    pub const FATAL: &'static str = "HYPHAE_FATAL";

    /// Reads the configuration from the process environment.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var))
    }

    /// Reads the configuration from `lookup`, which behaves like
    /// [`std::env::var`].
    pub fn from_lookup(
        lookup: impl Fn(&'static str) -> Result<String, VarError>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &'static str| match lookup(name) {
            Ok(value) => Ok(Some(value)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode { var: name }),
        };
        let number = |name: &'static str| -> Result<Option<usize>, ConfigError> {
            let Some(value) = var(name)? else {
                return Ok(None);
            };
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|source| ConfigError::InvalidNumber {
                    var: name,
                    value,
                    source,
                })
        };

        let mut config = Self::default();
        config.worker_threads = number(Self::WORKER_THREADS)?;
        config.worker_stack_size = number(Self::WORKER_STACK_SIZE)?;
        if let Some(value) = var(Self::FATAL)? {
            config.fatal_policy = match value.trim().to_ascii_lowercase().as_str() {
                "abort" => FatalPolicy::Abort,
                "panic" => FatalPolicy::Panic,
                _ => {
                    return Err(ConfigError::InvalidFatalPolicy {
                        var: Self::FATAL,
                        value,
                    })
                }
            };
        }
        tracing::debug!(?config, "runtime configuration");
        Ok(config)
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_worker_threads(self, threads: usize) -> Self {
        Self {
            worker_threads: Some(threads),
            ..self
        }
    }

    /// Sets the fatal policy.
    #[must_use]
    pub fn with_fatal_policy(self, policy: FatalPolicy) -> Self {
        Self {
            fatal_policy: policy,
            ..self
        }
    }

    /// Sets whether diagnostics are also written to standard error.
    #[must_use]
    pub fn with_stderr_diagnostics(self, enabled: bool) -> Self {
        Self {
            stderr_diagnostics: enabled,
            ..self
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            worker_stack_size: None,
            fatal_policy: FatalPolicy::Abort,
            stderr_diagnostics: true,
        }
    }
}

// === impl Runtime ===

impl Runtime {
    /// Installs diagnostics and starts the scheduler.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let previous_policy = diag::set_fatal_policy(config.fatal_policy);
        let listener = config
            .stderr_diagnostics
            .then(|| diag::add_listener(StderrListener));

        let mut builder = TaskScheduler::builder();
        if let Some(threads) = config.worker_threads {
            builder = builder.worker_threads(threads);
        }
        if let Some(bytes) = config.worker_stack_size {
            builder = builder.stack_size(bytes);
        }
        let scheduler = builder.build();

        tracing::info!(
            threads = scheduler.threads_count(),
            fatal_policy = ?config.fatal_policy,
            "runtime started"
        );
        Self {
            scheduler: Some(scheduler),
            listener,
            previous_policy,
        }
    }

    /// Reads a [`RuntimeConfig`] from the environment and starts a runtime
    /// with it.
    pub fn from_env() -> Result<Self, ConfigError> {
        RuntimeConfig::from_env().map(Self::new)
    }

    /// Returns the task scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &TaskScheduler {
        match self.scheduler.as_ref() {
            Some(scheduler) => scheduler,
            None => hyphae_util::fatal!("runtime scheduler used after shutdown"),
        }
    }

    /// Stops the scheduler and restores the previous diagnostics
    /// configuration.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(listener) = self.listener.take() {
            diag::remove_listener(listener);
        }
        diag::set_fatal_policy(self.previous_policy);
        tracing::info!("runtime stopped");
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler)
            .field("listener", &self.listener)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Result<String, VarError> {
        let vars = vars
            .iter()
            .map(|&(k, v)| (k, v.to_string()))
            .collect::<HashMap<_, _>>();
        move |var| vars.get(var).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn defaults_when_unset() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (RuntimeConfig::WORKER_THREADS, "3"),
            (RuntimeConfig::WORKER_STACK_SIZE, " 65536 "),
            (RuntimeConfig::FATAL, "Panic"),
        ]))
        .unwrap();
        assert_eq!(config.worker_threads, Some(3));
        assert_eq!(config.worker_stack_size, Some(65536));
        assert_eq!(config.fatal_policy, FatalPolicy::Panic);
    }

    #[test]
    fn rejects_bad_values() {
        let err = RuntimeConfig::from_lookup(lookup(&[(RuntimeConfig::WORKER_THREADS, "lots")]))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidNumber { var: "HYPHAE_WORKER_THREADS", .. }),
            "{err}"
        );

        let err =
            RuntimeConfig::from_lookup(lookup(&[(RuntimeConfig::FATAL, "explode")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFatalPolicy { .. }), "{err}");
        assert!(err.to_string().contains("explode"));

        let err = RuntimeConfig::from_lookup(|_| Err(VarError::NotUnicode("\u{fffd}".into())))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotUnicode { .. }), "{err}");
    }

    #[test]
    fn runtime_restores_fatal_policy() {
        let before = diag::fatal_policy();
        let other = match before {
            FatalPolicy::Abort => FatalPolicy::Panic,
            FatalPolicy::Panic => FatalPolicy::Abort,
        };
        let runtime = Runtime::new(
            RuntimeConfig::default()
                .with_worker_threads(1)
                .with_fatal_policy(other)
                .with_stderr_diagnostics(false),
        );
        assert_eq!(diag::fatal_policy(), other);
        assert_eq!(runtime.scheduler().threads_count(), 1);
        let done = runtime.scheduler().spawn(|| {});
        runtime.scheduler().wait(&done);
        runtime.shutdown();
        assert_eq!(diag::fatal_policy(), before);
    }

    proptest! {
        #[test]
        fn worker_threads_round_trip(threads in 0usize..4096) {
            let value = threads.to_string();
            let vars = [(RuntimeConfig::WORKER_THREADS, value.as_str())];
            let config = RuntimeConfig::from_lookup(lookup(&vars)).unwrap();
            prop_assert_eq!(config.worker_threads, Some(threads));
        }
    }
}
