use crate::loom::{hint, thread};
#[cfg(not(loom))]
use core::time::Duration;

/// Number of [`SpinWait::spin_once`] calls that busy-spin before the
/// spin-wait starts giving up the processor.
pub const SPIN_YIELD_THRESHOLD: u32 = 10;

/// Once yielding, every `SLEEP_1_EVERY`th call sleeps for a full millisecond.
const SLEEP_1_EVERY: u32 = 20;

/// Once yielding, every `YIELD_ANY_EVERY`th call (that is not a sleep) gives
/// the rest of the time slice to any runnable thread.
const YIELD_ANY_EVERY: u32 = 5;

/// Waits for a short-lived condition with escalating politeness.
///
/// For the first [`SPIN_YIELD_THRESHOLD`] calls, [`spin_once`] busy-spins for
/// an exponentially growing number of pause instructions (`2 << count`).
/// After that, each call gives up the processor instead:
///
/// - every 20th call sleeps for one millisecond, letting even
///   lower-priority threads run,
/// - every 5th call does the shortest possible sleep,
/// - all other calls yield to another ready thread.
///
/// The counter wraps back to the threshold rather than to zero, so a
/// long-running wait never returns to busy spinning.
///
/// [`spin_once`]: SpinWait::spin_once
#[derive(Debug, Clone, Default)]
pub struct SpinWait {
    count: u32,
}

/// What a single [`SpinWait::spin_once`] call did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpinAction {
    /// Busy-spun for the given number of spin loop hints.
    Spin(u32),
    /// Yielded to another thread that is ready to run.
    Yield,
    /// Slept for the shortest possible interval, giving the time slice to
    /// any runnable thread.
    YieldAny,
    /// Slept for one millisecond.
    Sleep,
}

impl SpinWait {
    /// Returns a new `SpinWait` that will start by busy-spinning.
    #[must_use]
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    #[cfg(test)]
    pub(crate) const fn with_count(count: u32) -> Self {
        Self { count }
    }

    /// Returns the number of times [`spin_once`](Self::spin_once) has been
    /// called since creation or the last [`reset`](Self::reset).
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns `true` if the next [`spin_once`](Self::spin_once) will give up
    /// the processor rather than busy-spin.
    #[must_use]
    pub fn next_spin_will_yield(&self) -> bool {
        self.count >= SPIN_YIELD_THRESHOLD
    }

    /// Resets the counter, so the next wait starts by busy-spinning again.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Performs one step of the wait and advances the counter.
    pub fn spin_once(&mut self) -> SpinAction {
        let action = self.next_action();
        match action {
            #[cfg(not(loom))]
            SpinAction::Spin(spins) => {
                for _ in 0..spins {
                    hint::spin_loop();
                }
            }
            #[cfg(loom)]
            SpinAction::Spin(_) => hint::spin_loop(),
            SpinAction::Yield => thread::yield_now(),
            SpinAction::YieldAny => yield_any(),
            SpinAction::Sleep => sleep_one_ms(),
        }

        self.count = self.count.checked_add(1).unwrap_or(SPIN_YIELD_THRESHOLD);
        action
    }

    fn next_action(&self) -> SpinAction {
        if self.count < SPIN_YIELD_THRESHOLD {
            return SpinAction::Spin(2 << self.count);
        }

        let yields = self.count - SPIN_YIELD_THRESHOLD;
        if yields % SLEEP_1_EVERY == SLEEP_1_EVERY - 1 {
            SpinAction::Sleep
        } else if yields % YIELD_ANY_EVERY == YIELD_ANY_EVERY - 1 {
            SpinAction::YieldAny
        } else {
            SpinAction::Yield
        }
    }
}

// `thread::sleep(Duration::ZERO)` returns without entering the kernel, so the
// shortest real sleep is used to give the slice away.
#[cfg(not(loom))]
fn yield_any() {
    std::thread::sleep(Duration::from_nanos(1));
}

#[cfg(not(loom))]
fn sleep_one_ms() {
    std::thread::sleep(Duration::from_millis(1));
}

#[cfg(loom)]
fn yield_any() {
    thread::yield_now();
}

#[cfg(loom)]
fn sleep_one_ms() {
    thread::yield_now();
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn spins_exponentially_then_yields() {
        let mut spin = SpinWait::new();
        for i in 0..SPIN_YIELD_THRESHOLD {
            assert!(!spin.next_spin_will_yield(), "call {i} should spin");
            assert_eq!(spin.spin_once(), SpinAction::Spin(2 << i));
        }
        assert!(spin.next_spin_will_yield());
        assert_eq!(spin.count(), SPIN_YIELD_THRESHOLD);
        assert_eq!(spin.spin_once(), SpinAction::Yield);
    }

    #[test]
    fn yield_schedule() {
        let actions = (0..40)
            .map(|i| SpinWait::with_count(SPIN_YIELD_THRESHOLD + i).next_action())
            .collect::<Vec<_>>();
        for (i, action) in actions.iter().enumerate() {
            let expected = if i % 20 == 19 {
                SpinAction::Sleep
            } else if i % 5 == 4 {
                SpinAction::YieldAny
            } else {
                SpinAction::Yield
            };
            assert_eq!(*action, expected, "yield #{i}");
        }
    }

    #[test]
    fn reset_restarts_spinning() {
        let mut spin = SpinWait::new();
        for _ in 0..SPIN_YIELD_THRESHOLD + 2 {
            spin.spin_once();
        }
        assert!(spin.next_spin_will_yield());
        spin.reset();
        assert_eq!(spin.count(), 0);
        assert!(!spin.next_spin_will_yield());
        assert_eq!(spin.spin_once(), SpinAction::Spin(2));
    }

    #[test]
    fn counter_wraps_to_threshold() {
        let mut spin = SpinWait::with_count(u32::MAX);
        spin.spin_once();
        assert_eq!(spin.count(), SPIN_YIELD_THRESHOLD);
        assert!(spin.next_spin_will_yield());
    }
}
