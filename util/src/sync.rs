//! Synchronization primitives.
//!
//! The raw locks in this module protect no data themselves; each comes with a
//! data-carrying wrapper:
//!
//! | raw lock                 | kind           | wrapper                       |
//! |--------------------------|----------------|-------------------------------|
//! | [`UserCriticalSection`]  | mutual exclusion, futex-backed | [`Mutex<T>`] (default) |
//! | [`Spinlock`]             | mutual exclusion, spinning | [`Mutex<T, Spinlock>`]   |
//! | [`ReaderWriterLock`]     | shared/exclusive, parking | [`RwLock<T>`] (default)   |
//! | [`RwSpinlock`]           | shared/exclusive, spinning | [`RwLock<T, RwSpinlock>`] |
//!
//! [`SequentialLock`] is a sequence lock for small `Copy` values that are read
//! far more often than they are written, and [`SpinWait`] implements the
//! spin-then-yield-then-sleep escalation used while waiting for short-lived
//! conditions.
mod backoff;
mod cache_pad;
mod critical_section;
pub mod mutex;
pub mod rwlock;
mod seqlock;
mod spin;
mod spin_wait;

pub use self::backoff::Backoff;
pub use self::cache_pad::CachePadded;
pub use self::critical_section::UserCriticalSection;
pub use self::mutex::{Mutex, MutexGuard, RawMutex};
pub use self::rwlock::{RawRwLock, ReaderWriterLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use self::seqlock::SequentialLock;
pub use self::spin::{RwSpinlock, Spinlock};
pub use self::spin_wait::{SpinAction, SpinWait, SPIN_YIELD_THRESHOLD};
