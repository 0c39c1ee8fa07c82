#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod util;

pub mod awaiter;
pub mod parallel;
pub mod scheduler;
pub mod task;

#[doc(inline)]
pub use self::{
    awaiter::Awaiter,
    scheduler::TaskScheduler,
    task::{Ownership, Task, TaskId, TaskPriority, TaskStatus},
};

#[cfg(test)]
pub(crate) mod test_util {
    pub(crate) fn trace_init() -> impl Drop {
        use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};
        tracing_subscriber::fmt()
            .with_test_writer()
            .without_time()
            .with_env_filter(EnvFilter::from_env("RUST_LOG"))
            .with_thread_names(true)
            .set_default()
    }

    pub(crate) fn fatal_panics() {
        hyphae_util::diag::set_fatal_policy(hyphae_util::diag::FatalPolicy::Panic);
    }
}
