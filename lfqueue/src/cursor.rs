//! The queue's `head` and `tail` cursors.
//!
//! A cursor is a `{stamp, node}` pair that is only ever replaced as a whole.
//! Each successful swap bumps the stamp, so a cursor value read before some
//! other thread moved the cursor away and back to the same address no longer
//! compares equal.

use crate::{
    loom::atomic::{AtomicU128, Ordering::*},
    node::Node,
    util::{pack, unpack},
};
use core::{fmt, ptr::NonNull};

#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct Cursor<const CAP: usize> {
    pub(crate) stamp: u64,
    pub(crate) node: NonNull<Node<CAP>>,
}

pub(crate) struct AtomicCursor<const CAP: usize>(AtomicU128);

// === impl Cursor ===

impl<const CAP: usize> Cursor<CAP> {
    pub(crate) const fn new(node: NonNull<Node<CAP>>) -> Self {
        Self { stamp: 0, node }
    }

    /// Returns the cursor that moves this one onto `node`.
    #[inline]
    #[must_use]
    pub(crate) fn advance(self, node: NonNull<Node<CAP>>) -> Self {
        Self {
            stamp: self.stamp.wrapping_add(1),
            node,
        }
    }

    fn into_word(self) -> u128 {
        pack(self.node.as_ptr() as usize, self.stamp)
    }

    fn from_word(word: u128) -> Self {
        let (addr, stamp) = unpack(word);
        debug_assert_ne!(addr, 0, "a cursor always points at a node");
        Self {
            stamp,
            // Safety: only `into_word` produces cursor words, and it is only
            // ever given non-null nodes.
            node: unsafe { NonNull::new_unchecked(addr as *mut Node<CAP>) },
        }
    }
}

impl<const CAP: usize> fmt::Debug for Cursor<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("stamp", &self.stamp)
            .field("node", &format_args!("{:p}", self.node))
            .finish()
    }
}

// === impl AtomicCursor ===

impl<const CAP: usize> AtomicCursor<CAP> {
    pub(crate) fn new(cursor: Cursor<CAP>) -> Self {
        Self(AtomicU128::new(cursor.into_word()))
    }

    #[inline]
    pub(crate) fn load(&self) -> Cursor<CAP> {
        Cursor::from_word(self.0.load(Acquire))
    }

    /// Replaces the cursor with `new` if it still equals `current`, stamp
    /// included. On failure, returns the cursor's actual value.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: Cursor<CAP>,
        new: Cursor<CAP>,
    ) -> Result<(), Cursor<CAP>> {
        self.0
            .compare_exchange(current.into_word(), new.into_word(), AcqRel, Acquire)
            .map(|_| ())
            .map_err(Cursor::from_word)
    }
}

impl<const CAP: usize> fmt::Debug for AtomicCursor<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
