//! Shared/exclusive locking.
//!
//! [`ReaderWriterLock`] is the process's default reader-writer lock; it parks
//! waiting threads using [`parking_lot`]. [`RwLock`] wraps any [`RawRwLock`]
//! together with the data it protects.
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};
use lock_api::RawRwLock as _;

/// Trait abstracting over raw reader-writer locks.
///
/// # Safety
///
/// Implementations of this trait must ensure that the lock is actually
/// exclusive: an exclusive lock can't be acquired while an exclusive or shared
/// lock exists, and a shared lock can't be acquired while an exclusive lock
/// exists.
pub unsafe trait RawRwLock {
    /// Acquires a shared lock, blocking the current thread until it is able
    /// to do so.
    fn lock_shared(&self);

    /// Attempts to acquire a shared lock without blocking.
    fn try_lock_shared(&self) -> bool;

    /// Releases a shared lock.
    ///
    /// # Safety
    ///
    /// This method may only be called if a shared lock is held in the current
    /// context.
    unsafe fn unlock_shared(&self);

    /// Acquires an exclusive lock, blocking the current thread until it is
    /// able to do so.
    fn lock_exclusive(&self);

    /// Attempts to acquire an exclusive lock without blocking.
    fn try_lock_exclusive(&self) -> bool;

    /// Releases an exclusive lock.
    ///
    /// # Safety
    ///
    /// This method may only be called if an exclusive lock is held in the
    /// current context.
    unsafe fn unlock_exclusive(&self);

    /// Returns `true` if the lock is currently held in any way.
    fn is_locked(&self) -> bool;

    /// Returns `true` if the lock is currently held exclusively.
    fn is_locked_exclusive(&self) -> bool;
}

/// A reader-writer lock allowing many concurrent readers or one writer.
///
/// Waiting threads are parked rather than spun. The lock is not recursive:
/// acquiring it again on a thread that already holds it may deadlock.
pub struct ReaderWriterLock {
    raw: parking_lot::RawRwLock,
}

/// A reader-writer lock protecting a value of type `T`.
pub struct RwLock<T: ?Sized, Lock = ReaderWriterLock> {
    lock: Lock,
    data: UnsafeCell<T>,
}

/// An RAII guard granting shared access to the data in an [`RwLock`].
#[must_use = "if unused, the `RwLock` will immediately unlock"]
pub struct RwLockReadGuard<'a, T: ?Sized, Lock: RawRwLock = ReaderWriterLock> {
    lock: &'a Lock,
    data: &'a T,
}

/// An RAII guard granting exclusive access to the data in an [`RwLock`].
#[must_use = "if unused, the `RwLock` will immediately unlock"]
pub struct RwLockWriteGuard<'a, T: ?Sized, Lock: RawRwLock = ReaderWriterLock> {
    lock: &'a Lock,
    data: &'a mut T,
}

// === impl ReaderWriterLock ===

impl ReaderWriterLock {
    /// Returns a new, unlocked `ReaderWriterLock`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raw: <parking_lot::RawRwLock as lock_api::RawRwLock>::INIT,
        }
    }

    /// Acquires the lock exclusively, blocking until no reader or writer
    /// holds it.
    #[inline]
    pub fn enter(&self) {
        self.raw.lock_exclusive()
    }

    /// Attempts to acquire the lock exclusively without blocking.
    #[inline]
    #[must_use]
    pub fn try_enter(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    /// Releases an exclusive lock.
    ///
    /// Releasing a lock that is not held exclusively is a fatal error.
    #[track_caller]
    pub fn leave(&self) {
        fatal_assert!(
            self.raw.is_locked_exclusive(),
            "released a reader-writer lock that was not held exclusively"
        );
        // Safety: the lock is held exclusively, checked above.
        unsafe { self.raw.unlock_exclusive() }
    }

    /// Acquires a shared lock, blocking while a writer holds the lock.
    #[inline]
    pub fn enter_shared(&self) {
        self.raw.lock_shared()
    }

    /// Attempts to acquire a shared lock without blocking.
    #[inline]
    #[must_use]
    pub fn try_enter_shared(&self) -> bool {
        self.raw.try_lock_shared()
    }

    /// Releases a shared lock.
    ///
    /// Releasing a lock that is not held shared is a fatal error.
    #[track_caller]
    pub fn leave_shared(&self) {
        fatal_assert!(
            self.raw.is_locked() && !self.raw.is_locked_exclusive(),
            "released a shared lock on a reader-writer lock with no readers"
        );
        // Safety: at least one shared lock is held, checked above.
        unsafe { self.raw.unlock_shared() }
    }
}

impl Default for ReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReaderWriterLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderWriterLock")
            .field("locked", &self.raw.is_locked())
            .field("exclusive", &self.raw.is_locked_exclusive())
            .finish()
    }
}

unsafe impl RawRwLock for ReaderWriterLock {
    #[inline]
    fn lock_shared(&self) {
        self.enter_shared()
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.try_enter_shared()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        self.raw.unlock_shared()
    }

    #[inline]
    fn lock_exclusive(&self) {
        self.enter()
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        self.try_enter()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        self.raw.unlock_exclusive()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        self.raw.is_locked_exclusive()
    }
}

// === impl RwLock ===

impl<T> RwLock<T> {
    /// Returns a new, unlocked `RwLock` protecting `data`.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            lock: ReaderWriterLock::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T, Lock> RwLock<T, Lock> {
    /// Returns a new, unlocked `RwLock` protecting `data`, using the provided
    /// raw lock.
    #[must_use]
    pub const fn with_raw_rwlock(data: T, lock: Lock) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock, returning the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, Lock: RawRwLock> RwLock<T, Lock> {
    /// Acquires shared access, blocking while a writer holds the lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T, Lock> {
        self.lock.lock_shared();
        self.read_guard()
    }

    /// Attempts to acquire shared access without blocking.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T, Lock>> {
        self.lock.try_lock_shared().then(|| self.read_guard())
    }

    /// Acquires exclusive access, blocking while any reader or writer holds
    /// the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T, Lock> {
        self.lock.lock_exclusive();
        self.write_guard()
    }

    /// Attempts to acquire exclusive access without blocking.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T, Lock>> {
        self.lock.try_lock_exclusive().then(|| self.write_guard())
    }

    /// Returns a mutable reference to the protected data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, T, Lock> {
        RwLockReadGuard {
            lock: &self.lock,
            // Safety: a shared lock is held for the guard's lifetime.
            data: unsafe { &*self.data.get() },
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, T, Lock> {
        RwLockWriteGuard {
            lock: &self.lock,
            // Safety: the exclusive lock is held for the guard's lifetime.
            data: unsafe { &mut *self.data.get() },
        }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug, Lock: RawRwLock> fmt::Debug for RwLock<T, Lock> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RwLock");
        match self.try_read() {
            Some(guard) => s.field("data", &&*guard),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.finish()
    }
}

unsafe impl<T: ?Sized + Send, Lock: Send> Send for RwLock<T, Lock> {}
unsafe impl<T: ?Sized + Send + Sync, Lock: Sync> Sync for RwLock<T, Lock> {}

// === impl RwLockReadGuard ===

impl<T: ?Sized, Lock: RawRwLock> Deref for RwLockReadGuard<'_, T, Lock> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: ?Sized, Lock: RawRwLock> Drop for RwLockReadGuard<'_, T, Lock> {
    #[inline]
    fn drop(&mut self) {
        // Safety: a read guard only exists while a shared lock is held.
        unsafe { self.lock.unlock_shared() }
    }
}

// === impl RwLockWriteGuard ===

impl<T: ?Sized, Lock: RawRwLock> Deref for RwLockWriteGuard<'_, T, Lock> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: ?Sized, Lock: RawRwLock> DerefMut for RwLockWriteGuard<'_, T, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T: ?Sized, Lock: RawRwLock> Drop for RwLockWriteGuard<'_, T, Lock> {
    #[inline]
    fn drop(&mut self) {
        // Safety: a write guard only exists while the exclusive lock is held.
        unsafe { self.lock.unlock_exclusive() }
    }
}
