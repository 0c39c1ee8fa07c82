use super::{RawMutex, RawRwLock, SpinWait};
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering::*};
use core::fmt;

/// A mutual-exclusion lock that waits with a [`SpinWait`] while contended.
///
/// Short waits busy-spin; longer ones yield and eventually sleep, so a
/// preempted holder does not burn a whole core on every waiter. Still,
/// prefer [`UserCriticalSection`](super::UserCriticalSection) unless the
/// critical section is only a handful of instructions long.
///
/// Releasing a `Spinlock` that is not held is fatal.
#[derive(Debug)]
pub struct Spinlock {
    locked: AtomicBool,
}

/// A writer-preferring reader-writer lock that waits with a [`SpinWait`].
///
/// A writer that has to wait raises a flag that turns away new readers, so
/// a steady stream of readers cannot starve it. Readers already inside
/// finish normally.
///
/// Releasing a lock mode that is not held is fatal.
pub struct RwSpinlock {
    state: AtomicUsize,
}

// === impl Spinlock ===

impl Spinlock {
    loom_const_fn! {
        /// Returns a new `Spinlock`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { locked: AtomicBool::new(false) }
        }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for Spinlock {
    fn lock(&self) {
        let mut spin = SpinWait::new();
        loop {
            if self.try_lock() {
                return;
            }
            // wait on plain loads, so waiters don't bounce the cache line.
            while self.is_locked() {
                spin.spin_once();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        test_dbg!(self
            .locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .is_ok())
    }

    #[track_caller]
    #[inline]
    unsafe fn unlock(&self) {
        let was_locked = test_dbg!(self.locked.swap(false, Release));
        fatal_assert!(was_locked, "released a spinlock that was not held");
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

// === impl RwSpinlock ===

/// Held by a writer.
const WRITER: usize = 1 << 0;
/// A writer is waiting; new readers back off.
const WRITER_WAITING: usize = 1 << 1;
/// One reader. The reader count occupies the bits above the flags.
const READER: usize = 1 << 2;
const READER_SHIFT: u32 = READER.trailing_zeros();

impl RwSpinlock {
    loom_const_fn! {
        /// Returns a new `RwSpinlock`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self {
                state: AtomicUsize::new(0),
            }
        }
    }

    /// Returns the number of shared locks currently held.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.load(Relaxed) >> READER_SHIFT
    }

    /// Returns `true` if a writer is waiting for the readers to leave.
    #[must_use]
    pub fn has_waiting_writer(&self) -> bool {
        self.state.load(Relaxed) & WRITER_WAITING != 0
    }
}

impl Default for RwSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawRwLock for RwSpinlock {
    fn lock_shared(&self) {
        let mut spin = SpinWait::new();
        while !self.try_lock_shared() {
            spin.spin_once();
        }
    }

    #[track_caller]
    fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Relaxed);
        loop {
            if test_dbg!(state) & (WRITER | WRITER_WAITING) != 0 {
                return false;
            }
            let Some(next) = state.checked_add(READER) else {
                fatal!("reader count overflowed a RwSpinlock");
            };
            match self
                .state
                .compare_exchange_weak(state, next, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    #[track_caller]
    #[inline]
    unsafe fn unlock_shared(&self) {
        let prev = test_dbg!(self.state.fetch_sub(READER, Release));
        fatal_assert!(
            prev >= READER,
            "released a shared lock on a RwSpinlock with no readers"
        );
    }

    fn lock_exclusive(&self) {
        let mut spin = SpinWait::new();
        let mut state = self.state.load(Relaxed);
        loop {
            // free apart from, at most, our own waiting flag; taking the lock
            // clears the flag, and any other waiting writer raises it again.
            if state & !WRITER_WAITING == 0 {
                match self
                    .state
                    .compare_exchange_weak(state, WRITER, Acquire, Relaxed)
                {
                    Ok(_) => return,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }
            if state & WRITER_WAITING == 0 {
                self.state.fetch_or(WRITER_WAITING, Relaxed);
            }
            spin.spin_once();
            state = self.state.load(Relaxed);
        }
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        let state = self.state.load(Relaxed);
        state & !WRITER_WAITING == 0
            && test_dbg!(self
                .state
                .compare_exchange(state, WRITER, Acquire, Relaxed)
                .is_ok())
    }

    #[track_caller]
    #[inline]
    unsafe fn unlock_exclusive(&self) {
        let prev = test_dbg!(self.state.fetch_and(!WRITER, Release));
        fatal_assert!(
            prev & WRITER != 0,
            "released an exclusive lock on a RwSpinlock that was not write-locked"
        );
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(Relaxed) & !WRITER_WAITING != 0
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        self.state.load(Relaxed) & WRITER != 0
    }
}

impl fmt::Debug for RwSpinlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Relaxed);
        f.debug_struct("RwSpinlock")
            .field("readers", &(state >> READER_SHIFT))
            .field("writer", &(state & WRITER != 0))
            .field("writer_waiting", &(state & WRITER_WAITING != 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    #[test]
    fn readers_exclude_writer() {
        loom::model(|| {
            let lock = RwSpinlock::new();
            assert!(lock.try_lock_shared());
            assert!(lock.try_lock_shared());
            assert_eq!(lock.reader_count(), 2);
            assert!(!lock.try_lock_exclusive());
            unsafe {
                lock.unlock_shared();
                lock.unlock_shared();
            }
            assert!(lock.try_lock_exclusive());
            assert!(lock.is_locked_exclusive());
            assert!(!lock.try_lock_shared());
            assert_eq!(lock.reader_count(), 0);
            unsafe { lock.unlock_exclusive() };
            assert!(!lock.is_locked());
        });
    }

    #[test]
    fn spinlock_handoff() {
        loom::model(|| {
            let lock = Arc::new(Spinlock::new());
            let count = Arc::new(AtomicUsize::new(0));
            let other = {
                let lock = lock.clone();
                let count = count.clone();
                thread::spawn(move || {
                    lock.lock();
                    count.fetch_add(1, Relaxed);
                    unsafe { lock.unlock() };
                })
            };
            lock.lock();
            count.fetch_add(1, Relaxed);
            unsafe { lock.unlock() };
            other.join().unwrap();
            assert_eq!(count.load(Relaxed), 2);
            assert!(!lock.is_locked());
        });
    }

    #[test]
    fn writer_handoff_with_reader() {
        loom::model(|| {
            let lock = Arc::new(RwSpinlock::new());
            let value = Arc::new(AtomicUsize::new(0));
            let writer = {
                let lock = lock.clone();
                let value = value.clone();
                thread::spawn(move || {
                    lock.lock_exclusive();
                    value.store(1, Relaxed);
                    value.store(2, Relaxed);
                    unsafe { lock.unlock_exclusive() };
                })
            };
            lock.lock_shared();
            let seen = value.load(Relaxed);
            assert_ne!(seen, 1, "reader saw a write in progress");
            unsafe { lock.unlock_shared() };
            writer.join().unwrap();
            assert!(!lock.is_locked());
            assert!(!lock.has_waiting_writer());
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn waiting_writer_turns_away_new_readers() {
        use std::time::{Duration, Instant};

        let lock = Arc::new(RwSpinlock::new());
        lock.lock_shared();
        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.lock_exclusive();
                unsafe { lock.unlock_exclusive() };
            })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !lock.has_waiting_writer() {
            assert!(Instant::now() < deadline, "writer never started waiting");
            std::thread::yield_now();
        }
        assert!(!lock.try_lock_shared());
        assert_eq!(lock.reader_count(), 1);

        unsafe { lock.unlock_shared() };
        writer.join().unwrap();
        assert!(!lock.has_waiting_writer());
        assert!(lock.try_lock_shared());
        unsafe { lock.unlock_shared() };
    }

    #[cfg(not(loom))]
    #[test]
    #[should_panic(expected = "spinlock that was not held")]
    fn unlocking_free_spinlock_is_fatal() {
        crate::test_util::with_fatal_panics(|| unsafe { Spinlock::new().unlock() })
    }

    #[cfg(not(loom))]
    #[test]
    #[should_panic(expected = "with no readers")]
    fn unlocking_unheld_shared_lock_is_fatal() {
        crate::test_util::with_fatal_panics(|| unsafe { RwSpinlock::new().unlock_shared() })
    }

    #[cfg(not(loom))]
    #[test]
    #[should_panic(expected = "was not write-locked")]
    fn unlocking_unheld_exclusive_lock_is_fatal() {
        crate::test_util::with_fatal_panics(|| {
            let lock = RwSpinlock::new();
            lock.lock_shared();
            unsafe { lock.unlock_exclusive() }
        })
    }
}
