#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    pub(crate) use loom::{hint, model, sync, thread};
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) use std::{hint, sync};

    pub(crate) mod thread {
        pub(crate) use std::thread::{yield_now, JoinHandle};

        #[cfg(test)]
        pub(crate) fn spawn<F, T>(f: F) -> JoinHandle<T>
        where
            F: FnOnce() -> T,
            F: Send + 'static,
            T: Send + 'static,
        {
            let dispatch = tracing::dispatcher::get_default(|current| current.clone());
            std::thread::spawn(move || {
                let _guard = tracing::dispatcher::set_default(&dispatch);
                f()
            })
        }
    }

    #[cfg(test)]
    pub(crate) fn model(f: impl Fn()) {
        let _trace = crate::test_util::trace_init();
        f()
    }
}
