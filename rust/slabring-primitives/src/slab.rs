//! Fixed-size chunk pool with a lock-free Treiber free list.
//!
//! ```text
//! +0    PoolHeader (64 bytes)
//! +64   chunk 0 | chunk 1 | ... | chunk n-1
//! ```
//!
//! While a chunk is free, its first four bytes hold the index of the next
//! free chunk. The list head is a [`TaggedHead`], so a pop racing with a
//! pop-then-push of the same chunk cannot install a stale successor.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::region::Region;
use crate::sync::{CACHE_LINE, Ordering, spin_loop};
use crate::tagged::{NIL_INDEX, TaggedHead, TaggedIndex};

/// Smallest chunk a pool accepts: the largest natural alignment of a scalar
/// on supported targets, and room for the free-list link.
pub const MIN_CHUNK_SIZE: u32 = 16;

/// Pool header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct PoolHeader {
    pub chunk_size: u32,
    pub chunk_count: u32,

    /// Free list head: index (low 32 bits) + tag (high 32 bits).
    pub free_head: TaggedHead,

    _pad: [u8; 48],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<PoolHeader>() == 64);

impl PoolHeader {
    pub fn init(&mut self, chunk_size: u32, chunk_count: u32) {
        self.chunk_size = chunk_size;
        self.chunk_count = chunk_count;
        self.free_head = TaggedHead::new(TaggedIndex::nil());
        self._pad = [0; 48];
    }
}

/// Byte footprint of one pool, relative to its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub chunks_offset: usize,
    /// Header plus chunks, rounded up to a cache line so pools can be stacked.
    pub size: usize,
}

impl PoolLayout {
    /// Compute the layout, or `None` if it overflows `usize`.
    ///
    /// Panics on a chunk size that is not a power of two of at least
    /// [`MIN_CHUNK_SIZE`], or on a chunk count of zero or [`NIL_INDEX`].
    pub fn compute(chunk_size: u32, chunk_count: u32) -> Option<Self> {
        assert!(
            chunk_size.is_power_of_two() && chunk_size >= MIN_CHUNK_SIZE,
            "chunk_size must be a power of 2 >= {MIN_CHUNK_SIZE}"
        );
        assert!(
            chunk_count > 0 && chunk_count < NIL_INDEX,
            "chunk_count must be in 1..{NIL_INDEX}"
        );

        let chunks_offset = size_of::<PoolHeader>();
        let chunks = (chunk_size as usize).checked_mul(chunk_count as usize)?;
        let end = chunks_offset.checked_add(chunks)?;
        Some(Self {
            chunk_size,
            chunk_count,
            chunks_offset,
            size: end.checked_add(CACHE_LINE - 1)? & !(CACHE_LINE - 1),
        })
    }
}

/// A chunk pool operating on raw pointers.
pub struct PoolRaw {
    header: *mut PoolHeader,
    chunks: *mut u8,
}

unsafe impl Send for PoolRaw {}
unsafe impl Sync for PoolRaw {}

impl PoolRaw {
    /// Create a pool view from raw pointers.
    ///
    /// # Safety
    ///
    /// - `header` must point to an initialized `PoolHeader`
    /// - `chunks` must point to `chunk_count * chunk_size` bytes, aligned to
    ///   the chunk size or 64, whichever is smaller
    /// - the memory must remain valid for the lifetime of this view
    #[inline]
    pub unsafe fn from_raw(header: *mut PoolHeader, chunks: *mut u8) -> Self {
        Self { header, chunks }
    }

    #[inline]
    fn header(&self) -> &PoolHeader {
        unsafe { &*self.header }
    }

    #[inline]
    pub fn chunk_size(&self) -> u32 {
        self.header().chunk_size
    }

    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.header().chunk_count
    }

    /// Pointer to chunk `index`. Panics if out of range.
    #[inline]
    pub fn chunk_ptr(&self, index: u32) -> NonNull<u8> {
        assert!(index < self.chunk_count(), "chunk index out of range");
        let ptr = unsafe { self.chunks.add(index as usize * self.chunk_size() as usize) };
        // SAFETY: offset into a non-null mapping.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Index of the chunk starting at `ptr`.
    ///
    /// `None` for pointers outside the chunk array or not on a chunk
    /// boundary.
    #[inline]
    pub fn index_of(&self, ptr: *const u8) -> Option<u32> {
        let offset = (ptr as usize).checked_sub(self.chunks as usize)?;
        let chunk_size = self.chunk_size() as usize;
        let index = offset / chunk_size;
        if index >= self.chunk_count() as usize || !offset.is_multiple_of(chunk_size) {
            return None;
        }
        Some(index as u32)
    }

    /// Whether `ptr` falls anywhere inside this pool's chunk array.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.chunks as usize;
        let end = start + self.chunk_count() as usize * self.chunk_size() as usize;
        (start..end).contains(&(ptr as usize))
    }

    #[inline]
    unsafe fn read_next_free(&self, index: u32) -> u32 {
        let ptr = self.chunk_ptr(index).as_ptr() as *const u32;
        unsafe { core::ptr::read_volatile(ptr) }
    }

    #[inline]
    unsafe fn write_next_free(&self, index: u32, next: u32) {
        let ptr = self.chunk_ptr(index).as_ptr() as *mut u32;
        unsafe { core::ptr::write_volatile(ptr, next) };
    }

    /// Link every chunk into the free list, lowest index on top.
    ///
    /// # Safety
    ///
    /// Must only be called during initialization, before any concurrent access.
    pub unsafe fn init_free_list(&self) {
        let chunk_count = self.chunk_count();
        if chunk_count == 0 {
            return;
        }

        for i in 0..chunk_count - 1 {
            unsafe { self.write_next_free(i, i + 1) };
        }
        unsafe { self.write_next_free(chunk_count - 1, NIL_INDEX) };

        self.header()
            .free_head
            .store(TaggedIndex::new(0, 0), Ordering::Release);
    }

    /// Pop a chunk index off the free list. `None` when exhausted.
    pub fn try_alloc(&self) -> Option<u32> {
        let header = self.header();

        loop {
            let head = header.free_head.load(Ordering::Acquire);
            if head.is_nil() {
                return None;
            }

            // May read a link a concurrent winner already overwrote; the tag
            // check in the CAS below throws that value away.
            let next = unsafe { self.read_next_free(head.index) };

            match header.free_head.compare_exchange_weak(
                head,
                head.successor(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head.index),
                Err(_) => spin_loop(),
            }
        }
    }

    /// Push chunk `index` back onto the free list.
    ///
    /// The caller must own the chunk: it came from [`try_alloc`](Self::try_alloc)
    /// and has not been freed since.
    pub fn free(&self, index: u32) {
        assert!(index < self.chunk_count(), "chunk index out of range");
        let header = self.header();

        loop {
            let head = header.free_head.load(Ordering::Acquire);
            unsafe { self.write_next_free(index, head.index) };

            if header
                .free_head
                .compare_exchange_weak(
                    head,
                    head.successor(index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
            spin_loop();
        }
    }

    /// Approximate number of free chunks (walks the list; racy under
    /// concurrent use).
    pub fn free_count_approx(&self) -> u32 {
        let chunk_count = self.chunk_count();
        let mut len = 0u32;
        let mut current = self.header().free_head.load(Ordering::Acquire).index;

        while current != NIL_INDEX && len < chunk_count {
            len += 1;
            if current < chunk_count {
                current = unsafe { self.read_next_free(current) };
            } else {
                break;
            }
        }

        len
    }
}

/// A chunk pool laid out in a [`Region`].
pub struct Pool {
    #[allow(dead_code)]
    region: Region,
    layout: PoolLayout,
    inner: PoolRaw,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Initialize a new pool at `header_offset`.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization, and must outlive the returned pool.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        chunk_size: u32,
        chunk_count: u32,
    ) -> Self {
        assert!(
            header_offset.is_multiple_of(CACHE_LINE),
            "header_offset must be 64-byte aligned"
        );
        let Some(layout) = PoolLayout::compute(chunk_size, chunk_count) else {
            panic!("pool of {chunk_count} x {chunk_size} bytes overflows the address space");
        };
        assert!(
            header_offset + layout.size <= region.len(),
            "region too small for pool"
        );

        let header = region.offset(header_offset) as *mut PoolHeader;
        unsafe { (*header).init(chunk_size, chunk_count) };

        let chunks = region.offset(header_offset + layout.chunks_offset);
        let inner = unsafe { PoolRaw::from_raw(header, chunks) };
        unsafe { inner.init_free_list() };

        Self {
            region,
            layout,
            inner,
        }
    }

    /// Attach to an existing pool.
    ///
    /// # Safety
    ///
    /// The region must contain an initialized pool header at `header_offset`
    /// and must outlive the returned pool.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        if !header_offset.is_multiple_of(CACHE_LINE) {
            return Err("header_offset must be 64-byte aligned");
        }
        if header_offset + size_of::<PoolHeader>() > region.len() {
            return Err("region too small for pool header");
        }

        let header = region.offset(header_offset) as *mut PoolHeader;
        let (chunk_size, chunk_count) = unsafe { ((*header).chunk_size, (*header).chunk_count) };

        if !chunk_size.is_power_of_two() || chunk_size < MIN_CHUNK_SIZE {
            return Err("invalid chunk size");
        }
        if chunk_count == 0 || chunk_count == NIL_INDEX {
            return Err("invalid chunk count");
        }
        let Some(layout) = PoolLayout::compute(chunk_size, chunk_count) else {
            return Err("pool layout overflows");
        };
        if header_offset + layout.size > region.len() {
            return Err("region too small for pool");
        }

        let chunks = region.offset(header_offset + layout.chunks_offset);
        let inner = unsafe { PoolRaw::from_raw(header, chunks) };
        Ok(Self {
            region,
            layout,
            inner,
        })
    }

    #[inline]
    pub fn inner(&self) -> &PoolRaw {
        &self.inner
    }

    #[inline]
    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// Pop a free chunk and return its address.
    #[inline]
    pub fn try_alloc(&self) -> Option<NonNull<u8>> {
        self.inner.try_alloc().map(|index| self.inner.chunk_ptr(index))
    }

    /// Return a chunk. Returns `false` (and does nothing) when `ptr` is not
    /// the start of one of this pool's chunks.
    ///
    /// # Safety
    ///
    /// If `ptr` is a chunk of this pool, it must currently be allocated and
    /// the caller must not use it afterwards.
    #[inline]
    pub unsafe fn free(&self, ptr: *const u8) -> bool {
        match self.inner.index_of(ptr) {
            Some(index) => {
                self.inner.free(index);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.inner.contains(ptr)
    }

    #[inline]
    pub fn chunk_size(&self) -> u32 {
        self.inner.chunk_size()
    }

    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.inner.chunk_count()
    }

    pub fn free_count_approx(&self) -> u32 {
        self.inner.free_count_approx()
    }
}
