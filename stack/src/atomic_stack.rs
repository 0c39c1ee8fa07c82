//! A lock-free LIFO stack over caller-owned node storage.
//!
//! See the documentation for [`AtomicStack`] for details.
use crate::{
    loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::*},
    Linked,
};
use core::{fmt, marker::PhantomData, mem};
use hyphae_util::{fatal, fatal_assert, sync::CachePadded};

/// Index value marking "no node": an empty stack, or the bottom node.
const NIL: u32 = u32::MAX;

/// A lock-free, ABA-safe LIFO stack of nodes stored in a fixed slice.
///
/// The stack never owns or frees its nodes: it only links them. Nodes are
/// identified by their position in the storage slice `S`, which may be
/// borrowed (`&[T]`) or owned (`Box<[T]>`, `Vec<T>`). A node can only be
/// pushed onto the stack whose storage contains it.
///
/// The head of the stack packs the index of the top node together with a
/// generation counter into one `u64`. Every successful [`push`] or [`pop`]
/// increments the generation, so a compare-and-swap that read the head
/// before a concurrent pop-then-push of the same node fails instead of
/// corrupting the stack. The generation is 32 bits wide: an ABA failure would
/// need exactly 2^32 successful operations to land between one thread's
/// load and its compare-and-swap.
///
/// [`push`]: AtomicStack::push
/// [`pop`]: AtomicStack::pop
pub struct AtomicStack<T: Linked, S: AsRef<[T]> = Box<[T]>> {
    head: CachePadded<AtomicU64>,
    storage: S,
    _nodes: PhantomData<fn(T) -> T>,
}

/// Per-node link state for an [`AtomicStack`].
///
/// Types that implement [`Linked`] embed one of these.
pub struct Links {
    next: AtomicU32,
    linked: AtomicBool,
}

/// An iterator that pops every node off an [`AtomicStack`].
///
/// Created by [`AtomicStack::drain`].
#[must_use = "iterators do nothing unless consumed"]
pub struct Drain<'stack, T: Linked, S: AsRef<[T]>> {
    stack: &'stack AtomicStack<T, S>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
struct Head {
    index: u32,
    generation: u32,
}

// === impl AtomicStack ===

impl<T, S> AtomicStack<T, S>
where
    T: Linked,
    S: AsRef<[T]>,
{
    /// Returns a new, empty stack over the nodes in `storage`.
    ///
    /// `storage` may hold at most `u32::MAX - 1` nodes, and `T` must not be
    /// zero-sized.
    #[must_use]
    pub fn new(storage: S) -> Self {
        let len = storage.as_ref().len();
        fatal_assert!(
            mem::size_of::<T>() != 0,
            "stack nodes must not be zero-sized"
        );
        fatal_assert!(
            len < NIL as usize,
            "an atomic stack can index at most {} nodes, but got {len}",
            NIL - 1
        );
        Self {
            head: CachePadded::new(AtomicU64::new(Head::EMPTY.pack())),
            storage,
            _nodes: PhantomData,
        }
    }

    /// Returns the nodes this stack links.
    #[must_use]
    pub fn storage(&self) -> &[T] {
        self.storage.as_ref()
    }

    /// Pushes `node` onto the top of the stack.
    ///
    /// It is a fatal error to push a node that is not part of this stack's
    /// storage, or that is already linked into a stack.
    #[track_caller]
    pub fn push(&self, node: &T) {
        let index = self.index_of(node);
        self.push_index(index);
    }

    /// Pushes the node at `index` in this stack's storage.
    ///
    /// It is a fatal error if `index` is out of bounds, or the node at `index`
    /// is already linked into a stack.
    #[track_caller]
    pub fn push_index(&self, index: usize) {
        let nodes = self.storage();
        let Some(node) = nodes.get(index) else {
            fatal!(
                "node index {index} is out of bounds for a stack of {} nodes",
                nodes.len()
            );
        };
        let links = node.links();
        fatal_assert!(
            !links.linked.swap(true, Acquire),
            "node {index} pushed while already linked into a stack"
        );

        // `index < NIL`, checked in `new`.
        let index = index as u32;
        let mut head = Head::unpack(self.head.load(Relaxed));
        loop {
            links.next.store(head.index, Relaxed);
            let new = Head {
                index,
                generation: head.generation.wrapping_add(1),
            };
            test_trace!(?head, ?new, "AtomicStack::push");
            match self
                .head
                .compare_exchange_weak(head.pack(), new.pack(), Release, Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = Head::unpack(actual),
            }
        }
    }

    /// Pops the top node off the stack, or returns `None` if it is empty.
    #[must_use]
    pub fn pop(&self) -> Option<&T> {
        self.pop_index().map(|index| &self.storage()[index])
    }

    /// Pops the top node off the stack, returning its index in this stack's
    /// storage.
    #[must_use]
    pub fn pop_index(&self) -> Option<usize> {
        let nodes = self.storage();
        let mut head = Head::unpack(self.head.load(Acquire));
        loop {
            if head.index == NIL {
                return None;
            }

            // a stale `head` may name a node that has since been popped and
            // relinked elsewhere; its `next` is then garbage, but the
            // generation check below rejects it.
            let node = &nodes[head.index as usize];
            let new = Head {
                index: node.links().next.load(Relaxed),
                generation: head.generation.wrapping_add(1),
            };
            test_trace!(?head, ?new, "AtomicStack::pop");
            match self
                .head
                .compare_exchange_weak(head.pack(), new.pack(), Acquire, Acquire)
            {
                Ok(_) => {
                    let links = node.links();
                    links.next.store(NIL, Relaxed);
                    links.linked.store(false, Release);
                    return Some(head.index as usize);
                }
                Err(actual) => head = Head::unpack(actual),
            }
        }
    }

    /// Returns an iterator that pops nodes until the stack is empty.
    pub fn drain(&self) -> Drain<'_, T, S> {
        Drain { stack: self }
    }

    /// Returns `true` if the stack was empty at the moment of the check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        Head::unpack(self.head.load(Acquire)).index == NIL
    }

    /// Returns the index of `node` in this stack's storage.
    ///
    /// It is a fatal error if `node` is not one of this stack's nodes.
    #[track_caller]
    #[must_use]
    pub fn index_of(&self, node: &T) -> usize {
        let nodes = self.storage();
        let base = nodes.as_ptr() as usize;
        let offset = (node as *const T as usize).wrapping_sub(base);
        let size = mem::size_of::<T>();
        let index = offset / size;
        fatal_assert!(
            offset % size == 0 && index < nodes.len(),
            "node at {:p} is not part of this stack's storage",
            node
        );
        index
    }

    #[cfg(test)]
    fn generation(&self) -> u32 {
        Head::unpack(self.head.load(Relaxed)).generation
    }
}

impl<T: Linked, S: AsRef<[T]>> Drop for AtomicStack<T, S> {
    fn drop(&mut self) {
        // unlink any remaining nodes, so they can be pushed onto another
        // stack; the nodes themselves belong to the storage.
        let nodes = self.storage.as_ref();
        let mut index = Head::unpack(self.head.load(Acquire)).index;
        while index != NIL {
            let Some(node) = nodes.get(index as usize) else {
                break;
            };
            let links = node.links();
            index = links.next.load(Relaxed);
            links.next.store(NIL, Relaxed);
            links.linked.store(false, Release);
        }
    }
}

impl<T: Linked, S: AsRef<[T]>> fmt::Debug for AtomicStack<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Head { index, generation } = Head::unpack(self.head.load(Relaxed));
        f.debug_struct("AtomicStack")
            .field("top", &(index != NIL).then_some(index))
            .field("generation", &generation)
            .finish_non_exhaustive()
    }
}

// === impl Drain ===

impl<'stack, T, S> Iterator for Drain<'stack, T, S>
where
    T: Linked,
    S: AsRef<[T]>,
{
    type Item = &'stack T;

    fn next(&mut self) -> Option<Self::Item> {
        self.stack.pop()
    }
}

impl<T: Linked, S: AsRef<[T]>> fmt::Debug for Drain<'_, T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drain").field("stack", self.stack).finish()
    }
}

// === impl Links ===

impl Links {
    /// Returns new, unlinked links.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            linked: AtomicBool::new(false),
        }
    }

    /// Returns new, unlinked links.
    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            linked: AtomicBool::new(false),
        }
    }

    /// Returns `true` if this node is currently linked into a stack.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.linked.load(Acquire)
    }
}

impl Default for Links {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Links {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let next = self.next.load(Relaxed);
        f.debug_struct("Links")
            .field("next", &(next != NIL).then_some(next))
            .field("linked", &self.is_linked())
            .finish()
    }
}

// === impl Head ===

impl Head {
    const EMPTY: Self = Self {
        index: NIL,
        generation: 0,
    };

    #[inline]
    const fn pack(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    const fn unpack(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == NIL {
            write!(f, "Head(nil, gen {})", self.generation)
        } else {
            write!(f, "Head({}, gen {})", self.index, self.generation)
        }
    }
}
