#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

mod runtime;

pub use self::runtime::{ConfigError, Runtime, RuntimeConfig};
#[doc(inline)]
pub use hyphae_stack as stack;
#[doc(inline)]
pub use hyphae_tasks as tasks;
#[doc(inline)]
pub use hyphae_thread as thread;
#[doc(inline)]
pub use hyphae_util as util;
pub use hyphae_util::{fatal, fatal_assert, report_error, report_warn};
