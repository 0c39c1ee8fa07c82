use core::{
    fmt,
    ops::{Deref, DerefMut},
};

/// Aligns the wrapped value to the size of a cache line.
///
/// This is used to avoid [false sharing] between values that are written by
/// different threads, such as the head of a lock-free stack and the nodes it
/// links, or a sequence lock's counter and its payload.
///
/// On `x86_64`/`aarch64`, a cache line is taken to be 128 bytes (adjacent-line
/// prefetching pulls lines in pairs); on all other targets it is 64 bytes.
/// When the `no-cache-pad` feature is enabled, this is a plain wrapper with no
/// extra alignment.
///
/// [false sharing]: https://en.wikipedia.org/wiki/False_sharing
#[cfg_attr(
    all(
        not(feature = "no-cache-pad"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ),
    repr(align(128))
)]
#[cfg_attr(
    all(
        not(feature = "no-cache-pad"),
        not(any(target_arch = "x86_64", target_arch = "aarch64"))
    ),
    repr(align(64))
)]
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
pub struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    /// Pads `value` to the length of a cache line.
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Unwraps the inner value and returns it.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(all(test, not(feature = "no-cache-pad")))]
mod tests {
    use super::*;

    #[test]
    fn neighbours_do_not_share_a_line() {
        let pair = [CachePadded::new(0u8), CachePadded::new(1u8)];
        let a = &pair[0] as *const _ as usize;
        let b = &pair[1] as *const _ as usize;
        assert!(b - a >= 64);
        assert_eq!(a % core::mem::align_of::<CachePadded<u8>>(), 0);
        assert_eq!(*pair[1], 1);
    }
}
