//! Tagged indices: a 32-bit index and a 32-bit modification tag packed into
//! one 64-bit atomic word.
//!
//! Every successful update bumps the tag, so a compare-and-swap against a
//! head that was popped and pushed back in between (same index, later tag)
//! fails instead of corrupting the list.
//!
//! The ring cursors use the same split implicitly: the low bits of a 64-bit
//! cursor (`cursor & mask`) pick the slot and the high bits count laps, which
//! is why slot sequence numbers are compared against whole cursors.

use crate::sync::{AtomicU64, Ordering};

/// Index value meaning "no element".
pub const NIL_INDEX: u32 = u32::MAX;

/// An index with its ABA tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedIndex {
    pub index: u32,
    pub tag: u32,
}

impl TaggedIndex {
    #[inline]
    pub const fn new(index: u32, tag: u32) -> Self {
        Self { index, tag }
    }

    /// The empty head with a zero tag.
    #[inline]
    pub const fn nil() -> Self {
        Self::new(NIL_INDEX, 0)
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.index == NIL_INDEX
    }

    /// Pack as `tag << 32 | index`.
    #[inline]
    pub const fn pack(self) -> u64 {
        ((self.tag as u64) << 32) | (self.index as u64)
    }

    #[inline]
    pub const fn unpack(word: u64) -> Self {
        Self {
            index: word as u32,
            tag: (word >> 32) as u32,
        }
    }

    /// The head that replaces `self` when `index` becomes the new top.
    #[inline]
    pub const fn successor(self, index: u32) -> Self {
        Self {
            index,
            tag: self.tag.wrapping_add(1),
        }
    }
}

/// Atomic cell holding a [`TaggedIndex`].
#[repr(transparent)]
pub struct TaggedHead(AtomicU64);

impl TaggedHead {
    pub fn new(initial: TaggedIndex) -> Self {
        Self(AtomicU64::new(initial.pack()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedIndex {
        TaggedIndex::unpack(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, value: TaggedIndex, order: Ordering) {
        self.0.store(value.pack(), order);
    }

    /// Weak CAS on the packed word; on failure returns what was observed.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedIndex,
        new: TaggedIndex,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedIndex, TaggedIndex> {
        self.0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(TaggedIndex::unpack)
            .map_err(TaggedIndex::unpack)
    }
}
