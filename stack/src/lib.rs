#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
pub(crate) mod util;

pub mod atomic_stack;
pub(crate) mod loom;

#[doc(inline)]
pub use atomic_stack::{AtomicStack, Drain, Links};

/// Trait implemented by types that can be linked into an [`AtomicStack`].
///
/// A linked type embeds a [`Links`] value, which the stack uses to record
/// which node sits beneath it. A node may be linked into at most one stack
/// at a time; pushing a node that is already linked is a fatal error.
pub trait Linked {
    /// Returns the links embedded in this node.
    fn links(&self) -> &Links;
}

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
}
