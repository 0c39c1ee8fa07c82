//! Countdown completion signals.
use crate::{scheduler::Dependent, util::panic_message, Task};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering::*},
};
use hyphae_util::{fatal, fatal_assert};
use parking_lot::{Condvar, Mutex};
use std::{sync::Arc, time::Instant};

/// A countdown latch that tasks signal and threads wait on.
///
/// An awaiter starts with a number of pending signals. Each call to
/// [`signal`](Self::signal) consumes one; when none remain the awaiter is
/// *satisfied*, which is permanent. Every thread blocked on it is woken, and
/// every task that was waiting for it as a dependency is released to its
/// scheduler.
///
/// Awaiters are shared as `Arc<Awaiter>`: typically one per fork-join batch,
/// created with the number of tasks in the batch, with each task signalling
/// it once as it finishes.
///
/// Signalling an awaiter more times than it has pending signals, or adding
/// pending signals after it was satisfied, is fatal.
pub struct Awaiter {
    count: AtomicUsize,
    waiters: Mutex<Waiters>,
    cond: Condvar,
}

struct Waiters {
    satisfied: bool,
    dependents: Vec<Dependent>,
}

impl Awaiter {
    /// Returns a new awaiter with `pending` signals outstanding.
    ///
    /// An awaiter created with zero pending signals is already satisfied.
    #[must_use]
    pub fn new(pending: usize) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(pending),
            waiters: Mutex::new(Waiters {
                satisfied: pending == 0,
                dependents: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Returns a new awaiter that is already satisfied.
    #[must_use]
    pub fn satisfied() -> Arc<Self> {
        Self::new(0)
    }

    /// Returns the number of signals still outstanding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.count.load(Acquire)
    }

    /// Returns `true` once every pending signal has arrived.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.pending() == 0
    }

    /// Expects `n` more signals before the awaiter is satisfied.
    ///
    /// Fatal if the awaiter is already satisfied.
    #[track_caller]
    pub fn add_pending(&self, n: usize) {
        let mut current = self.count.load(Relaxed);
        loop {
            fatal_assert!(current > 0, "cannot add {n} pending signals to a satisfied awaiter");
            let Some(next) = current.checked_add(n) else {
                fatal!("awaiter pending count overflowed ({current} + {n})");
            };
            match self
                .count
                .compare_exchange_weak(current, next, AcqRel, Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Delivers one signal, satisfying the awaiter if it was the last one.
    ///
    /// Returns `true` if this call satisfied the awaiter.
    #[track_caller]
    pub fn signal(&self) -> bool {
        let mut current = self.count.load(Relaxed);
        loop {
            fatal_assert!(current > 0, "awaiter was signalled more times than it was pending");
            match self
                .count
                .compare_exchange_weak(current, current - 1, AcqRel, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if test_dbg!(current) == 1 {
            self.complete();
            true
        } else {
            false
        }
    }

    fn complete(&self) {
        let dependents = {
            let mut waiters = self.waiters.lock();
            waiters.satisfied = true;
            std::mem::take(&mut waiters.dependents)
        };
        self.cond.notify_all();
        test_trace!(dependents = dependents.len(), "awaiter satisfied");

        for dependent in dependents {
            // one failed release must not strand the rest.
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                dependent.release()
            })) {
                hyphae_util::report_error!(
                    "releasing a dependent task panicked: {}",
                    panic_message(&*payload)
                );
            }
        }
    }

    /// Parks `dependent` until the awaiter is satisfied.
    ///
    /// Hands it back if the awaiter is already satisfied.
    pub(crate) fn register(&self, dependent: Dependent) -> Result<(), Dependent> {
        let mut waiters = self.waiters.lock();
        if waiters.satisfied {
            return Err(dependent);
        }
        waiters.dependents.push(dependent);
        Ok(())
    }

    /// Removes `task` from the tasks waiting for this awaiter, returning
    /// whether it was registered.
    pub(crate) fn unregister(&self, task: &Arc<Task>) -> bool {
        let mut waiters = self.waiters.lock();
        let before = waiters.dependents.len();
        waiters.dependents.retain(|dependent| !dependent.is_for(task));
        waiters.dependents.len() != before
    }

    /// Blocks the calling thread until the awaiter is satisfied or `deadline`
    /// passes, returning whether it was satisfied.
    pub(crate) fn block_until(&self, deadline: Instant) -> bool {
        let mut waiters = self.waiters.lock();
        while !waiters.satisfied {
            if self.cond.wait_until(&mut waiters, deadline).timed_out() {
                return waiters.satisfied;
            }
        }
        true
    }
}

impl fmt::Debug for Awaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaiter")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{fatal_panics, trace_init};
    use std::{thread, time::Duration};

    #[test]
    fn counts_down_to_satisfied() {
        let awaiter = Awaiter::new(3);
        assert_eq!(awaiter.pending(), 3);
        assert!(!awaiter.signal());
        awaiter.add_pending(1);
        assert!(!awaiter.signal());
        assert!(!awaiter.signal());
        assert!(!awaiter.is_satisfied());
        assert!(awaiter.signal());
        assert!(awaiter.is_satisfied());
    }

    #[test]
    fn zero_is_satisfied() {
        let awaiter = Awaiter::satisfied();
        assert!(awaiter.is_satisfied());
        assert!(awaiter.block_until(Instant::now()));
    }

    #[test]
    fn block_until_times_out() {
        let awaiter = Awaiter::new(1);
        let start = Instant::now();
        assert!(!awaiter.block_until(start + Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn signal_wakes_blocked_thread() {
        let _trace = trace_init();
        let awaiter = Awaiter::new(1);
        let waiter = thread::spawn({
            let awaiter = awaiter.clone();
            move || awaiter.block_until(Instant::now() + Duration::from_secs(30))
        });
        thread::sleep(Duration::from_millis(10));
        awaiter.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    #[should_panic = "signalled more times"]
    fn over_signal_is_fatal() {
        fatal_panics();
        let awaiter = Awaiter::new(1);
        awaiter.signal();
        awaiter.signal();
    }

    #[test]
    #[should_panic = "satisfied awaiter"]
    fn add_pending_after_satisfied_is_fatal() {
        fatal_panics();
        Awaiter::satisfied().add_pending(1);
    }
}
