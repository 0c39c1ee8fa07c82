/// An [exponential backoff] for CAS retry loops.
///
/// Each call to [`spin`](Self::spin) issues `2^exp` spin loop hints and then
/// bumps the exponent, up to a maximum. Unlike [`SpinWait`](super::SpinWait),
/// a `Backoff` never yields the thread: it is meant for loops where another
/// core is known to be making progress, such as a contended compare-and-swap.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

impl Backoff {
    /// The default maximum exponent (2^8).
    pub const DEFAULT_MAX_EXPONENT: u8 = 8;

    /// Returns a new exponential backoff with the maximum exponent set to
    /// [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Returns a new exponential backoff with the provided max exponent.
    ///
    /// Exponents larger than [`Self::DEFAULT_MAX_EXPONENT`] are clamped.
    #[must_use]
    pub fn with_max_exponent(max: u8) -> Self {
        Self {
            exp: 0,
            max: max.min(Self::DEFAULT_MAX_EXPONENT),
        }
    }

    /// Returns the number of spin hints the next call to [`spin`](Self::spin)
    /// will issue.
    #[must_use]
    pub fn next_spins(&self) -> u32 {
        1 << self.exp
    }

    /// Backs off in a spin loop.
    #[inline(always)]
    pub fn spin(&mut self) {
        #[cfg_attr(loom, allow(unused_variables))]
        let spins = self.next_spins();

        #[cfg(not(loom))]
        for _ in 0..spins {
            crate::loom::hint::spin_loop();
        }

        #[cfg(loom)]
        crate::loom::thread::yield_now();

        if self.exp < self.max {
            self.exp += 1
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_max() {
        let mut boff = Backoff::with_max_exponent(3);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(boff.next_spins());
            boff.spin();
        }
        assert_eq!(seen, [1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn max_exponent_is_clamped() {
        let mut boff = Backoff::with_max_exponent(200);
        for _ in 0..32 {
            boff.spin();
        }
        assert_eq!(boff.next_spins(), 1 << Backoff::DEFAULT_MAX_EXPONENT);
    }
}
