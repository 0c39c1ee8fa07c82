//! Data-carrying mutual exclusion over any [`RawMutex`].
use super::{Spinlock, UserCriticalSection};
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

/// Trait abstracting over raw mutual-exclusion locks.
///
/// # Safety
///
/// Implementations must ensure that the lock is actually exclusive: a lock
/// can't be acquired while it is already held.
pub unsafe trait RawMutex {
    /// Acquires the lock, blocking the current thread until it is able to do
    /// so.
    fn lock(&self);

    /// Attempts to acquire the lock without blocking.
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// This method may only be called if the lock is held in the current
    /// context.
    unsafe fn unlock(&self);

    /// Returns `true` if the lock is currently held.
    fn is_locked(&self) -> bool;
}

/// A mutual exclusion lock protecting a value of type `T`.
///
/// The `Lock` type parameter selects the raw lock. By default this is a
/// [`UserCriticalSection`], which sleeps while contended; a [`Spinlock`] can
/// be used instead for very short critical sections.
pub struct Mutex<T: ?Sized, Lock = UserCriticalSection> {
    lock: Lock,
    data: UnsafeCell<T>,
}

/// An RAII guard that releases its [`Mutex`] when dropped.
#[must_use = "if unused, the `Mutex` will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, Lock: RawMutex = UserCriticalSection> {
    lock: &'a Lock,
    data: &'a mut T,
}

impl<T> Mutex<T> {
    loom_const_fn! {
        /// Returns a new, unlocked `Mutex` protecting `data`, backed by a
        /// [`UserCriticalSection`].
        #[must_use]
        pub fn new(data: T) -> Self {
            Self {
                lock: UserCriticalSection::new(),
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T> Mutex<T, Spinlock> {
    loom_const_fn! {
        /// Returns a new, unlocked `Mutex` protecting `data`, backed by a
        /// [`Spinlock`].
        #[must_use]
        pub fn new_spinning(data: T) -> Self {
            Self {
                lock: Spinlock::new(),
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T, Lock> Mutex<T, Lock> {
    /// Returns a new, unlocked `Mutex` protecting `data`, using the provided
    /// raw lock.
    #[must_use]
    pub const fn with_raw_mutex(data: T, lock: Lock) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the mutex, returning the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, Lock: RawMutex> Mutex<T, Lock> {
    /// Acquires the lock, blocking until it is available.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) -> MutexGuard<'_, T, Lock> {
        self.lock.lock();
        self.guard()
    }

    /// Attempts to acquire the lock without blocking.
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, Lock>> {
        if self.lock.try_lock() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Runs `f` with exclusive access to the protected data.
    pub fn with<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Returns `true` if the lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Returns a mutable reference to the protected data.
    ///
    /// No locking is needed, since the `&mut self` borrow guarantees there
    /// are no other references.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn guard(&self) -> MutexGuard<'_, T, Lock> {
        MutexGuard {
            lock: &self.lock,
            // Safety: the lock is held for as long as the guard exists.
            data: unsafe { &mut *self.data.get() },
        }
    }
}

impl<T: Default, Lock: Default> Default for Mutex<T, Lock> {
    fn default() -> Self {
        Self::with_raw_mutex(T::default(), Lock::default())
    }
}

impl<T: ?Sized + fmt::Debug, Lock: RawMutex> fmt::Debug for Mutex<T, Lock> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => s.field("data", &&*guard),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.finish()
    }
}

unsafe impl<T: ?Sized + Send, Lock: Send> Send for Mutex<T, Lock> {}
unsafe impl<T: ?Sized + Send, Lock: Sync> Sync for Mutex<T, Lock> {}

// === impl MutexGuard ===

impl<T: ?Sized, Lock: RawMutex> Deref for MutexGuard<'_, T, Lock> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: ?Sized, Lock: RawMutex> DerefMut for MutexGuard<'_, T, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T: ?Sized, Lock: RawMutex> Drop for MutexGuard<'_, T, Lock> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        // Safety: a guard only exists while the lock is held.
        unsafe { self.lock.unlock() }
    }
}

impl<T: ?Sized + fmt::Debug, Lock: RawMutex> fmt::Debug for MutexGuard<'_, T, Lock> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.data.fmt(f)
    }
}
