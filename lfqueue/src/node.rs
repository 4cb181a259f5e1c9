//! Fixed-capacity record nodes.
//!
//! Every node reserves `CAP` bytes of record storage, whatever the length of
//! the record it carries. A node's links live in a single atomic word (its
//! [`Info`]), which packs the successor pointer together with a stamp and the
//! placeholder flag so that all three are always observed and replaced
//! together.

use crate::{
    loom::{
        alloc::Track,
        atomic::{AtomicU128, Ordering::*},
    },
    util::{pack, unpack},
    Error,
};
use alloc::{
    alloc::{alloc, Layout},
    boxed::Box,
};
use core::{
    fmt,
    ptr::{self, NonNull},
};

/// The byte written into every slot of a node that carries no record.
pub const FILLER: u8 = 0x6f;

pub(crate) struct Node<const CAP: usize> {
    info: AtomicInfo,
    len: usize,
    data: [u8; CAP],
    // participate in leak checking
    _track: Track<()>,
}

/// A snapshot of a node's links.
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct Info<const CAP: usize> {
    /// The node's successor, once one has been linked.
    pub(crate) next: Option<NonNull<Node<CAP>>>,
    /// Incremented when the successor is linked.
    pub(crate) stamp: u64,
    /// Set if the node carries no caller record.
    pub(crate) placeholder: bool,
}

struct AtomicInfo(AtomicU128);

const PLACEHOLDER_BIT: u64 = 1;

// === impl Node ===

impl<const CAP: usize> Node<CAP> {
    /// Allocates an unlinked node.
    ///
    /// With `Some(record)`, the record is copied into the node's buffer. With
    /// `None`, the node is a placeholder: its buffer is filled with [`FILLER`]
    /// and its info is flagged so that it is never handed to a caller.
    ///
    /// The record must be no longer than `CAP`; callers check this before
    /// allocating.
    pub(crate) fn allocate(record: Option<&[u8]>) -> Result<NonNull<Self>, Error> {
        debug_assert!(record.map_or(true, |record| record.len() <= CAP));

        let layout = Layout::new::<Self>();
        // Safety: `Node` always contains its info word, so the layout is never
        // zero-sized.
        let ptr = NonNull::new(unsafe { alloc(layout) }.cast::<Self>())
            .ok_or(Error::AllocationFailed)?;

        let (info, len) = match record {
            Some(record) => (Info::<CAP>::unlinked(false), record.len()),
            None => (Info::<CAP>::unlinked(true), 0),
        };

        unsafe {
            // Safety: `ptr` is a fresh allocation with the layout of `Self`;
            // every field is initialized below before the node is shared.
            let node = ptr.as_ptr();
            ptr::addr_of_mut!((*node).info).write(AtomicInfo::new(info));
            ptr::addr_of_mut!((*node).len).write(len);
            let data = ptr::addr_of_mut!((*node).data).cast::<u8>();
            match record {
                Some(record) => {
                    ptr::copy_nonoverlapping(record.as_ptr(), data, len);
                    ptr::write_bytes(data.add(len), 0, CAP - len);
                }
                None => ptr::write_bytes(data, FILLER, CAP),
            }
            ptr::addr_of_mut!((*node)._track).write(Track::new(()));
        }

        Ok(ptr)
    }

    /// Returns a node's storage to the allocator.
    ///
    /// # Safety
    ///
    /// `node` must have been returned by [`Node::allocate`], must not be
    /// reachable from either cursor of a queue, and no thread may still be
    /// dereferencing it. This must be called at most once per node.
    pub(crate) unsafe fn release(node: NonNull<Self>) {
        // Safety: `allocate` used the global allocator with `Layout::new::<Self>()`,
        // which is exactly what `Box` expects.
        drop(Box::from_raw(node.as_ptr()));
    }

    #[inline]
    pub(crate) fn info(&self) -> Info<CAP> {
        self.info.load()
    }

    /// Links `next` as this node's successor, if `current` is still the node's
    /// info and it has no successor yet.
    ///
    /// On failure, returns the info that was observed instead.
    #[inline]
    pub(crate) fn link(&self, current: Info<CAP>, next: NonNull<Self>) -> Result<(), Info<CAP>> {
        debug_assert!(current.next.is_none(), "a node's successor is set only once");
        let new = Info {
            next: Some(next),
            stamp: current.stamp.wrapping_add(1),
            placeholder: current.placeholder,
        };
        self.info.compare_exchange(current, new)
    }

    /// The record this node carries.
    #[inline]
    pub(crate) fn record(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The node's whole buffer, including any filler.
    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &[u8; CAP] {
        &self.data
    }
}

// === impl Info ===

impl<const CAP: usize> Info<CAP> {
    const fn unlinked(placeholder: bool) -> Self {
        Self {
            next: None,
            stamp: 0,
            placeholder,
        }
    }

    fn into_word(self) -> u128 {
        let addr = self.next.map_or(0, |next| next.as_ptr() as usize);
        let meta = (self.stamp << 1) | (self.placeholder as u64 * PLACEHOLDER_BIT);
        pack(addr, meta)
    }

    fn from_word(word: u128) -> Self {
        let (addr, meta) = unpack(word);
        Self {
            next: NonNull::new(addr as *mut Node<CAP>),
            stamp: meta >> 1,
            placeholder: meta & PLACEHOLDER_BIT != 0,
        }
    }
}

impl<const CAP: usize> fmt::Debug for Info<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Info");
        match self.next {
            Some(next) => s.field("next", &format_args!("{:p}", next)),
            None => s.field("next", &format_args!("None")),
        };
        s.field("stamp", &self.stamp)
            .field("placeholder", &self.placeholder)
            .finish()
    }
}

// === impl AtomicInfo ===

impl AtomicInfo {
    fn new<const CAP: usize>(info: Info<CAP>) -> Self {
        Self(AtomicU128::new(info.into_word()))
    }

    #[inline]
    fn load<const CAP: usize>(&self) -> Info<CAP> {
        Info::from_word(self.0.load(Acquire))
    }

    #[inline]
    fn compare_exchange<const CAP: usize>(
        &self,
        current: Info<CAP>,
        new: Info<CAP>,
    ) -> Result<(), Info<CAP>> {
        self.0
            .compare_exchange(current.into_word(), new.into_word(), AcqRel, Acquire)
            .map(|_| ())
            .map_err(Info::from_word)
    }
}
