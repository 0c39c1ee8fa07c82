#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #[cfg(test)]
    pub(crate) use loom::{model, thread};
    pub(crate) use loom::sync;
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]
    pub(crate) use std::sync;

    #[cfg(test)]
    pub(crate) use std::thread;

    #[cfg(test)]
    pub(crate) fn model(f: impl Fn()) {
        let _trace = crate::test_util::trace_init();
        f()
    }
}
