use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

/// A unique identifier for a dispatched [`Task`](super::Task).
///
/// Identifiers are assigned when a task is dispatched to a scheduler, and are
/// never reused during the lifetime of the process. ID 0 is never assigned.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Relaxed);
        debug_assert!(id > 0, "64-bit task ID counter should not overflow!");
        Self(id)
    }

    /// Returns the identifier as a `u64`.
    #[must_use]
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskId(")?;
        fmt::Debug::fmt(&self.0, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for TaskId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(a.as_u64() > 0);
        assert!(b > a);
    }
}
