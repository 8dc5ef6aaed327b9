//! Fixed-capacity ring buffers over a [`Region`].
//!
//! All three policies share one header layout:
//!
//! ```text
//! +0    head      producer cursor            (own cache line)
//! +64   tail      consumer cursor            (own cache line)
//! +128  capacity, slot size, slot align, policy
//! +192  [u64; capacity] sequences            (MPSC / MPMC only, 64-aligned)
//! ...   [T; capacity] slots
//! ```
//!
//! Cursors are free-running 64-bit counters; `cursor & (capacity - 1)` picks
//! the slot.

mod mpmc;
mod mpsc;
mod spsc;

use core::mem::{align_of, size_of};
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU64, CACHE_LINE, Ordering, align_up};

pub use mpmc::MpmcRingRaw;
pub use mpsc::MpscRingRaw;
pub use spsc::SpscRingRaw;

/// Synchronization policy recorded in the ring header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPolicy {
    Spsc = 1,
    Mpsc = 2,
    Mpmc = 3,
}

impl RingPolicy {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Spsc),
            2 => Some(Self::Mpsc),
            3 => Some(Self::Mpmc),
            _ => None,
        }
    }

    /// Whether slots carry a sequence number next to the payload.
    #[inline]
    pub fn uses_sequences(self) -> bool {
        !matches!(self, Self::Spsc)
    }

    /// Smallest capacity the policy can run with.
    ///
    /// With a single slot the MPMC "published" sequence (`pos + 1`) is also
    /// the next lap's "free" sequence (`pos + capacity`), so MPMC needs two.
    #[inline]
    pub fn min_capacity(self) -> u32 {
        match self {
            Self::Mpmc => 2,
            Self::Spsc | Self::Mpsc => 1,
        }
    }
}

/// Ring header (192 bytes, cursors on separate cache lines).
#[repr(C)]
pub struct RingHeader {
    /// Producer cursor: next position to write (or reserve).
    pub head: AtomicU64,
    _pad1: [u8; 56],

    /// Consumer cursor: next position to read.
    pub tail: AtomicU64,
    _pad2: [u8; 56],

    /// Power of two, immutable after init.
    pub capacity: u32,
    pub slot_size: u32,
    pub slot_align: u32,
    pub policy: u32,
    _pad3: [u8; 48],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<RingHeader>() == 192);

impl RingHeader {
    pub fn init(&mut self, policy: RingPolicy, capacity: u32, slot_size: u32, slot_align: u32) {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        self.head = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.tail = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self.slot_size = slot_size;
        self.slot_align = slot_align;
        self.policy = policy as u32;
        self._pad3 = [0; 48];
    }

    #[inline]
    pub fn mask(&self) -> u64 {
        self.capacity as u64 - 1
    }

    /// Snapshot of both cursors. Stale as soon as it is returned.
    pub fn status(&self) -> RingStatus {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        let capacity = self.capacity;
        // Consumers can overtake a head loaded before them on the multi
        // policies; clamp instead of wrapping.
        let len = head.saturating_sub(tail).min(capacity as u64) as u32;
        RingStatus {
            head,
            tail,
            capacity,
            len,
        }
    }
}

/// Status snapshot of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub head: u64,
    pub tail: u64,
    pub capacity: u32,
    pub len: u32,
}

impl RingStatus {
    #[inline]
    pub fn available(&self) -> u32 {
        self.capacity - self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }
}

/// Error returned when the ring has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

/// Byte offsets of a ring, relative to its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub policy: RingPolicy,
    pub capacity: u32,
    pub slot_size: usize,
    pub slot_align: usize,
    pub sequences_offset: Option<usize>,
    pub slots_offset: usize,
    /// Total bytes from the header to the end of the last slot.
    pub size: usize,
}

impl RingLayout {
    /// Compute the layout, or `None` if the sizes overflow `usize`.
    ///
    /// Panics if `capacity` is not a power of two, `slot_size` is zero, or
    /// `slot_align` is not a power of two no larger than a cache line.
    pub fn compute(
        policy: RingPolicy,
        capacity: u32,
        slot_size: usize,
        slot_align: usize,
    ) -> Option<Self> {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        assert!(
            capacity >= policy.min_capacity(),
            "{policy:?} ring needs at least {} slots",
            policy.min_capacity()
        );
        assert!(slot_size > 0, "slot_size must be > 0");
        assert!(
            slot_align.is_power_of_two() && slot_align <= CACHE_LINE,
            "slot alignment must be a power of 2 <= {CACHE_LINE}"
        );

        let mut offset = size_of::<RingHeader>();
        let sequences_offset = if policy.uses_sequences() {
            let start = offset;
            let bytes = (capacity as usize).checked_mul(size_of::<AtomicU64>())?;
            offset = align_up(start.checked_add(bytes)?, CACHE_LINE);
            Some(start)
        } else {
            None
        };

        let slots_offset = align_up(offset, slot_align);
        let slots_bytes = (capacity as usize).checked_mul(slot_size)?;
        let size = slots_offset.checked_add(slots_bytes)?;

        Some(Self {
            policy,
            capacity,
            slot_size,
            slot_align,
            sequences_offset,
            slots_offset,
            size,
        })
    }

    /// Layout for slots holding `T`.
    pub fn for_type<T>(policy: RingPolicy, capacity: u32) -> Option<Self> {
        Self::compute(policy, capacity, size_of::<T>(), align_of::<T>())
    }
}

/// A ring policy operating on raw pointers into a laid-out ring.
///
/// Cardinality (how many threads may push or pop at once) is a contract of
/// each implementation, documented on the type and enforced by callers.
pub trait RingRaw: Sized + Send + Sync {
    type Item: Copy;

    const POLICY: RingPolicy;

    /// Create a ring view from raw pointers.
    ///
    /// # Safety
    ///
    /// - `header` must point to an initialized `RingHeader`
    /// - `sequences` must point to `capacity` sequence words when the policy
    ///   uses them (it is ignored otherwise)
    /// - `slots` must point to `capacity` slots aligned for `Item`
    /// - the memory must stay mapped for the lifetime of the view
    unsafe fn from_raw(
        header: *mut RingHeader,
        sequences: *mut AtomicU64,
        slots: *mut Self::Item,
    ) -> Self;

    /// Initialize per-slot state.
    ///
    /// # Safety
    ///
    /// Must only be called once, by the initializer, before any other access.
    unsafe fn init_slots(&self);

    fn try_push(&self, value: Self::Item) -> Result<(), RingFull>;

    fn try_pop(&self) -> Option<Self::Item>;

    fn header(&self) -> &RingHeader;

    fn status(&self) -> RingStatus {
        self.header().status()
    }
}

/// Pointers shared by every raw ring.
pub(crate) struct RawParts<T> {
    header: *mut RingHeader,
    sequences: *mut AtomicU64,
    slots: *mut T,
}

impl<T: Copy> RawParts<T> {
    #[inline]
    pub(crate) fn new(header: *mut RingHeader, sequences: *mut AtomicU64, slots: *mut T) -> Self {
        Self {
            header,
            sequences,
            slots,
        }
    }

    #[inline]
    pub(crate) fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    /// Sequence word for the slot under `position`.
    #[inline]
    pub(crate) fn sequence(&self, position: u64) -> &AtomicU64 {
        let slot = (position & self.header().mask()) as usize;
        unsafe { &*self.sequences.add(slot) }
    }

    /// # Safety
    ///
    /// `sequences` must be non-null and the caller must be the initializer.
    pub(crate) unsafe fn init_sequences(&self, initial: impl Fn(u64) -> u64) {
        for slot in 0..self.header().capacity as usize {
            unsafe { ptr::write(self.sequences.add(slot), AtomicU64::new(initial(slot as u64))) };
        }
    }

    /// # Safety
    ///
    /// The caller must own the slot under `position` for writing.
    #[inline]
    pub(crate) unsafe fn write(&self, position: u64, value: T) {
        let slot = (position & self.header().mask()) as usize;
        unsafe { ptr::write(self.slots.add(slot), value) };
    }

    /// # Safety
    ///
    /// The slot under `position` must hold a published value the caller owns.
    #[inline]
    pub(crate) unsafe fn read(&self, position: u64) -> T {
        let slot = (position & self.header().mask()) as usize;
        unsafe { ptr::read(self.slots.add(slot)) }
    }
}

/// A ring laid out in a [`Region`].
///
/// Convenience wrapper that computes offsets, initializes or validates the
/// header, and delegates every operation to the raw policy `R`.
pub struct Ring<R> {
    #[allow(dead_code)]
    region: Region,
    layout: RingLayout,
    inner: R,
}

impl<R: RingRaw> Ring<R> {
    /// Lay out and initialize a new ring at `header_offset`.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization, and must outlive the returned ring.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(
            header_offset.is_multiple_of(CACHE_LINE),
            "header_offset must be 64-byte aligned"
        );
        let layout = RingLayout::for_type::<R::Item>(R::POLICY, capacity);
        let Some(layout) = layout else {
            panic!("ring of {capacity} slots overflows the address space");
        };
        assert!(
            header_offset + layout.size <= region.len(),
            "region too small for ring"
        );

        let header = region.offset(header_offset) as *mut RingHeader;
        unsafe {
            (*header).init(
                R::POLICY,
                capacity,
                layout.slot_size as u32,
                layout.slot_align as u32,
            )
        };

        let inner = unsafe { Self::view(region, header_offset, &layout) };
        unsafe { inner.init_slots() };

        Self {
            region,
            layout,
            inner,
        }
    }

    /// Attach to a ring some other party initialized at `header_offset`.
    ///
    /// Fails if the header disagrees with `R` (policy, slot size or slot
    /// alignment) or the ring does not fit in the region.
    ///
    /// # Safety
    ///
    /// The region must contain an initialized ring header at `header_offset`
    /// and must outlive the returned ring.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        if !header_offset.is_multiple_of(CACHE_LINE) {
            return Err("header_offset must be 64-byte aligned");
        }
        if header_offset + size_of::<RingHeader>() > region.len() {
            return Err("region too small for ring header");
        }

        let header = unsafe { region.get::<RingHeader>(header_offset) };
        if RingPolicy::from_u32(header.policy) != Some(R::POLICY) {
            return Err("ring policy mismatch");
        }
        if header.slot_size as usize != size_of::<R::Item>() {
            return Err("ring slot size mismatch");
        }
        if header.slot_align as usize != align_of::<R::Item>() {
            return Err("ring slot alignment mismatch");
        }
        if !header.capacity.is_power_of_two() {
            return Err("ring capacity is not a power of 2");
        }
        if header.capacity < R::POLICY.min_capacity() {
            return Err("ring capacity below the policy minimum");
        }

        let Some(layout) = RingLayout::for_type::<R::Item>(R::POLICY, header.capacity) else {
            return Err("ring layout overflows");
        };
        if header_offset + layout.size > region.len() {
            return Err("region too small for ring");
        }

        let inner = unsafe { Self::view(region, header_offset, &layout) };
        Ok(Self {
            region,
            layout,
            inner,
        })
    }

    unsafe fn view(region: Region, header_offset: usize, layout: &RingLayout) -> R {
        let header = region.offset(header_offset) as *mut RingHeader;
        let sequences = match layout.sequences_offset {
            Some(off) => region.offset(header_offset + off) as *mut AtomicU64,
            None => ptr::null_mut(),
        };
        let slots = region.offset(header_offset + layout.slots_offset) as *mut R::Item;
        unsafe { R::from_raw(header, sequences, slots) }
    }

    #[inline]
    pub fn inner(&self) -> &R {
        &self.inner
    }

    #[inline]
    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    #[inline]
    pub fn try_push(&self, value: R::Item) -> Result<(), RingFull> {
        self.inner.try_push(value)
    }

    #[inline]
    pub fn try_pop(&self) -> Option<R::Item> {
        self.inner.try_pop()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.header().capacity
    }

    pub fn status(&self) -> RingStatus {
        self.inner.status()
    }
}

unsafe impl<R: RingRaw> Send for Ring<R> {}
unsafe impl<R: RingRaw> Sync for Ring<R> {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    #[test]
    fn layout_spsc_has_no_sequences() {
        let layout = RingLayout::compute(RingPolicy::Spsc, 8, 16, 8).unwrap();
        assert_eq!(layout.sequences_offset, None);
        assert_eq!(layout.slots_offset, 192);
        assert_eq!(layout.size, 192 + 8 * 16);
    }

    #[test]
    fn layout_multi_places_sequences_before_slots() {
        let layout = RingLayout::compute(RingPolicy::Mpmc, 4, 4, 4).unwrap();
        assert_eq!(layout.sequences_offset, Some(192));
        // 4 * 8 bytes of sequences, rounded to a cache line.
        assert_eq!(layout.slots_offset, 256);
        assert_eq!(layout.size, 256 + 16);
    }

    #[test]
    #[should_panic(expected = "at least 2 slots")]
    fn layout_mpmc_needs_two_slots() {
        let _ = RingLayout::compute(RingPolicy::Mpmc, 1, 8, 8);
    }

    #[test]
    fn single_slot_rings_refuse_second_push() {
        let heap = HeapRegion::new_zeroed(4096);
        let spsc: Ring<SpscRingRaw<u64>> = unsafe { Ring::init(heap.region(), 0, 1) };
        spsc.try_push(10).unwrap();
        assert_eq!(spsc.try_push(20), Err(RingFull));
        assert_eq!(spsc.try_pop(), Some(10));
        assert_eq!(spsc.try_pop(), None);

        let heap = HeapRegion::new_zeroed(4096);
        let mpsc: Ring<MpscRingRaw<u64>> = unsafe { Ring::init(heap.region(), 0, 1) };
        mpsc.try_push(10).unwrap();
        assert_eq!(mpsc.try_push(20), Err(RingFull));
        assert_eq!(mpsc.try_pop(), Some(10));
        mpsc.try_push(30).unwrap();
        assert_eq!(mpsc.try_push(40), Err(RingFull));
        assert_eq!(mpsc.try_pop(), Some(30));
        assert_eq!(mpsc.try_pop(), None);
    }

    #[test]
    fn layout_overflow_is_none() {
        assert!(RingLayout::compute(RingPolicy::Spsc, 1 << 31, usize::MAX / 4, 1).is_none());
    }

    #[test]
    fn attach_rejects_other_policy_and_type() {
        let heap = HeapRegion::new_zeroed(4096);
        let region = heap.region();
        let _ring: Ring<MpmcRingRaw<u64>> = unsafe { Ring::init(region, 0, 8) };

        let wrong_policy = unsafe { Ring::<SpscRingRaw<u64>>::attach(region, 0) };
        assert_eq!(wrong_policy.err(), Some("ring policy mismatch"));

        let wrong_size = unsafe { Ring::<MpmcRingRaw<u32>>::attach(region, 0) };
        assert_eq!(wrong_size.err(), Some("ring slot size mismatch"));

        let wrong_align = unsafe { Ring::<MpmcRingRaw<[u32; 2]>>::attach(region, 0) };
        assert_eq!(wrong_align.err(), Some("ring slot alignment mismatch"));

        let same = unsafe { Ring::<MpmcRingRaw<u64>>::attach(region, 0) }.unwrap();
        assert_eq!(same.capacity(), 8);
    }

    #[test]
    fn attached_views_share_state() {
        let heap = HeapRegion::new_zeroed(4096);
        let region = heap.region();
        let a: Ring<MpscRingRaw<u32>> = unsafe { Ring::init(region, 64, 4) };
        let b = unsafe { Ring::<MpscRingRaw<u32>>::attach(region, 64) }.unwrap();

        a.try_push(11).unwrap();
        a.try_push(12).unwrap();
        assert_eq!(b.status().len, 2);
        assert_eq!(b.try_pop(), Some(11));
        assert_eq!(a.try_pop(), Some(12));
        assert!(a.status().is_empty());
    }
}
