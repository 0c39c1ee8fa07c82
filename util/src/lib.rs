#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
mod macros;

pub mod diag;
pub mod sync;

pub(crate) mod loom;

#[doc(hidden)]
pub mod __private {
    pub use core::panic::Location;
}
