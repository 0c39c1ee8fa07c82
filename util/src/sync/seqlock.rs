use super::{Backoff, CachePadded};
use crate::loom::{
    hint,
    sync::atomic::{self, AtomicUsize, Ordering::*},
};
use core::{cell::UnsafeCell, fmt, mem::MaybeUninit, ptr};

/// A [sequence lock] protecting a small `Copy` value.
///
/// Writers are serialized by making the sequence number odd for the duration
/// of the write. Readers never block writers: a reader snapshots the sequence
/// number, copies the value, and retries if the sequence number was odd or
/// changed in the meantime. A successful [`read`](Self::read) therefore
/// always returns a value that some writer stored in full.
///
/// Reads are cheap when writes are rare. A reader can be starved by a steady
/// stream of writers.
///
/// [sequence lock]: https://en.wikipedia.org/wiki/Seqlock
pub struct SequentialLock<T> {
    seq: CachePadded<AtomicUsize>,
    value: CachePadded<UnsafeCell<T>>,
}

impl<T: Copy> SequentialLock<T> {
    loom_const_fn! {
        /// Returns a new `SequentialLock` holding `value`.
        #[must_use]
        pub fn new(value: T) -> Self {
            Self {
                seq: CachePadded::new(AtomicUsize::new(0)),
                value: CachePadded::new(UnsafeCell::new(value)),
            }
        }
    }

    /// Returns a consistent copy of the protected value, retrying while a
    /// write is in progress or a torn read was observed.
    #[must_use]
    pub fn read(&self) -> T {
        loop {
            let preread = self.seq.load(Acquire);
            if !is_writing(test_dbg!(preread)) {
                // Safety: the copy may be torn, so it stays `MaybeUninit`
                // until the sequence number proves it was not.
                let value =
                    unsafe { ptr::read_volatile(self.value.get() as *const MaybeUninit<T>) };
                atomic::fence(Acquire);
                let postread = self.seq.load(Relaxed);
                if test_dbg!(preread) == test_dbg!(postread) {
                    // Safety: no write overlapped the copy.
                    return unsafe { value.assume_init() };
                }
            }

            // one hint rather than a backoff: the next attempt usually
            // succeeds unless another write starts.
            hint::spin_loop();
        }
    }

    /// Stores `value`, waiting for any in-progress write to finish first.
    pub fn write(&self, value: T) {
        let seq = self.start_write();
        // Safety: the odd sequence number excludes other writers.
        unsafe { ptr::write_volatile(self.value.get(), value) };
        self.finish_write(seq);
    }

    /// Stores `value` unless another write is in progress, in which case the
    /// value is handed back.
    pub fn try_write(&self, value: T) -> Result<(), T> {
        let mut curr = self.seq.load(Relaxed);
        loop {
            if is_writing(test_dbg!(curr)) {
                return Err(value);
            }
            match self.try_start_write(curr) {
                Ok(_) => {
                    // Safety: the odd sequence number excludes other writers.
                    unsafe { ptr::write_volatile(self.value.get(), value) };
                    self.finish_write(curr);
                    return Ok(());
                }
                Err(actual) => curr = actual,
            }
        }
    }

    /// Replaces the value with `f(current)` as a single write, returning the
    /// previous value.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        let seq = self.start_write();
        // Safety: the odd sequence number excludes other writers, so the
        // value cannot change underneath us.
        let prev = unsafe { ptr::read_volatile(self.value.get()) };
        let next = f(prev);
        unsafe { ptr::write_volatile(self.value.get(), next) };
        self.finish_write(seq);
        prev
    }

    /// Returns the current sequence number.
    ///
    /// The sequence number is odd while a write is in progress and increases
    /// by two with every completed write.
    #[must_use]
    pub fn sequence(&self) -> usize {
        self.seq.load(Acquire)
    }

    /// Returns a mutable reference to the value.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Consumes the lock, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner().into_inner()
    }

    fn start_write(&self) -> usize {
        let mut boff = Backoff::new();
        let mut curr = self.seq.load(Relaxed);
        loop {
            if is_writing(test_dbg!(curr)) {
                boff.spin();
                curr = self.seq.load(Relaxed);
                continue;
            }
            match self.try_start_write(curr) {
                Ok(_) => return curr,
                Err(actual) => curr = actual,
            }
        }
    }

    /// Makes the sequence number odd to claim the value for writing.
    #[inline(always)]
    fn try_start_write(&self, curr: usize) -> Result<usize, usize> {
        let res = self
            .seq
            .compare_exchange_weak(curr, curr.wrapping_add(1), Acquire, Relaxed);
        if res.is_ok() {
            // the value stores must not become visible before the odd
            // sequence number does.
            atomic::fence(Release);
        }
        test_dbg!(res)
    }

    /// Makes the sequence number even again, publishing the new value.
    #[inline(always)]
    fn finish_write(&self, curr: usize) {
        test_dbg!(self.seq.store(curr.wrapping_add(2), Release));
    }
}

unsafe impl<T: Copy + Send> Send for SequentialLock<T> {}
unsafe impl<T: Copy + Send> Sync for SequentialLock<T> {}

impl<T: Copy + Default> Default for SequentialLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for SequentialLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialLock")
            .field("value", &self.read())
            .field("seq", &self.sequence())
            .finish()
    }
}

#[inline(always)]
const fn is_writing(seq: usize) -> bool {
    seq & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    // with more than one reader, loom finds schedules where the readers
    // ping-pong forever without the writer making progress.
    const READERS: usize = if cfg!(loom) { 1 } else { 4 };

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct Pair {
        a: u64,
        b: u64,
    }

    #[test]
    fn sequence_advances_by_two() {
        loom::model(|| {
            let lock = SequentialLock::new(1u32);
            assert_eq!(lock.sequence(), 0);
            lock.write(2);
            assert_eq!(lock.sequence(), 2);
            assert_eq!(lock.update(|v| v * 10), 2);
            assert_eq!(lock.read(), 20);
            assert_eq!(lock.try_write(3), Ok(()));
            assert_eq!(lock.sequence(), 6);
            assert_eq!(lock.into_inner(), 3);
        });
    }

    #[test]
    fn readers_never_see_torn_values() {
        const WRITES: u64 = if cfg!(loom) { 2 } else { 10_000 };
        loom::model(|| {
            let lock = Arc::new(SequentialLock::new(Pair { a: 0, b: 0 }));
            let readers = (0..READERS)
                .map(|_| {
                    let lock = lock.clone();
                    thread::spawn(move || {
                        let mut last = 0;
                        loop {
                            let Pair { a, b } = lock.read();
                            assert_eq!(a, b, "torn read");
                            assert!(a >= last, "values went backwards");
                            last = a;
                            if a == WRITES {
                                break;
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();

            for i in 1..=WRITES {
                lock.write(Pair { a: i, b: i });
            }
            for reader in readers {
                reader.join().unwrap();
            }
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn concurrent_updates_are_not_lost() {
        const THREADS: usize = 4;
        const ITERS: usize = 10_000;
        let lock = Arc::new(SequentialLock::new(0usize));
        let threads = (0..THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        lock.update(|n| n + 1);
                    }
                })
            })
            .collect::<Vec<_>>();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(lock.read(), THREADS * ITERS);
        assert_eq!(lock.sequence(), THREADS * ITERS * 2);
    }

    #[cfg(not(loom))]
    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn reads_return_last_write(
                writes in proptest::collection::vec(any::<(u32, u16)>(), 1..64)
            ) {
                let lock = SequentialLock::new((0u32, 0u16));
                for &w in &writes {
                    lock.write(w);
                    prop_assert_eq!(lock.read(), w);
                }
                prop_assert_eq!(lock.sequence(), writes.len() * 2);
            }
        }
    }
}
