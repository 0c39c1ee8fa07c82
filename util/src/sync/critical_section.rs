use super::RawMutex;
use crate::loom::sync::atomic::{AtomicU32, Ordering::*};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A non-recursive mutual-exclusion lock that sleeps in the kernel while
/// contended.
///
/// The lock is a single 32-bit word. [`enter`](Self::enter) swaps in
/// `LOCKED`; if the previous value was already `LOCKED`, the thread waits on
/// the word's address (a futex on Linux, `WaitOnAddress` on Windows,
/// `__ulock_wait` on macOS) until a [`leave`](Self::leave) wakes it, and
/// tries again. There is no fairness guarantee, and no record of which thread
/// holds the lock: recursive entry deadlocks.
///
/// This is the default lock of [`Mutex`](super::Mutex).
#[derive(Debug)]
pub struct UserCriticalSection {
    state: AtomicU32,
}

impl UserCriticalSection {
    loom_const_fn! {
        /// Returns a new, unlocked critical section.
        #[must_use]
        pub fn new() -> Self {
            Self { state: AtomicU32::new(UNLOCKED) }
        }
    }

    /// Acquires the lock, sleeping until it becomes available.
    #[inline]
    pub fn enter(&self) {
        while test_dbg!(self.state.swap(LOCKED, Acquire)) == LOCKED {
            futex::wait(&self.state, LOCKED);
        }
    }

    /// Attempts to acquire the lock with a single exchange, without waiting.
    #[inline]
    #[must_use]
    pub fn try_enter(&self) -> bool {
        test_dbg!(self.state.swap(LOCKED, Acquire)) == UNLOCKED
    }

    /// Releases the lock and wakes one waiting thread, if any.
    ///
    /// Releasing a critical section that is not held is a fatal error.
    #[track_caller]
    #[inline]
    pub fn leave(&self) {
        let prev = test_dbg!(self.state.swap(UNLOCKED, Release));
        fatal_assert!(
            prev == LOCKED,
            "released a critical section that was not held"
        );
        futex::wake_one(&self.state);
    }

    /// Returns `true` if some thread currently holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Relaxed) == LOCKED
    }
}

impl Default for UserCriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for UserCriticalSection {
    #[inline]
    fn lock(&self) {
        self.enter()
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.try_enter()
    }

    #[track_caller]
    #[inline]
    unsafe fn unlock(&self) {
        self.leave()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        UserCriticalSection::is_locked(self)
    }
}

#[cfg(not(loom))]
mod futex {
    use core::sync::atomic::AtomicU32;

    #[inline]
    pub(super) fn wait(word: &AtomicU32, expected: u32) {
        atomic_wait::wait(word, expected)
    }

    #[inline]
    pub(super) fn wake_one(word: &AtomicU32) {
        atomic_wait::wake_one(word)
    }
}

// loom cannot model a thread sleeping in the kernel; yielding lets the model
// schedule the holder instead.
#[cfg(loom)]
mod futex {
    use loom::sync::atomic::AtomicU32;

    pub(super) fn wait(_: &AtomicU32, _: u32) {
        loom::thread::yield_now();
    }

    pub(super) fn wake_one(_: &AtomicU32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};
    use crate::sync::Mutex;

    #[test]
    fn try_enter_fails_while_held() {
        loom::model(|| {
            let cs = UserCriticalSection::new();
            assert!(cs.try_enter());
            assert!(cs.is_locked());
            assert!(!cs.try_enter());
            cs.leave();
            assert!(!cs.is_locked());
            assert!(cs.try_enter());
            cs.leave();
        });
    }

    #[test]
    fn mutual_exclusion() {
        loom::model(|| {
            let counter = Arc::new(Mutex::new(0usize));
            let other = counter.clone();
            let t = thread::spawn(move || {
                *other.lock() += 1;
            });
            *counter.lock() += 1;
            t.join().unwrap();
            assert_eq!(*counter.lock(), 2);
        });
    }

    #[cfg(not(loom))]
    #[test]
    #[should_panic(expected = "released a critical section that was not held")]
    fn leave_without_enter_is_fatal() {
        crate::test_util::with_fatal_panics(|| {
            let cs = UserCriticalSection::new();
            cs.leave();
        })
    }

    #[cfg(not(loom))]
    #[test]
    fn contended_counter() {
        const THREADS: usize = 8;
        const ITERS: usize = 100_000;

        struct Racy(core::cell::UnsafeCell<usize>);
        unsafe impl Sync for Racy {}

        let _trace = crate::test_util::trace_init();
        let cs = Arc::new(UserCriticalSection::new());
        let count = Arc::new(Racy(core::cell::UnsafeCell::new(0)));

        let threads = (0..THREADS)
            .map(|_| {
                let cs = cs.clone();
                let count = count.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        cs.enter();
                        // Safety: only mutated while the critical section is held.
                        unsafe { *count.0.get() += 1 };
                        cs.leave();
                    }
                })
            })
            .collect::<Vec<_>>();
        for t in threads {
            t.join().unwrap();
        }

        assert!(!cs.is_locked());
        assert_eq!(unsafe { *count.0.get() }, THREADS * ITERS);
    }
}
