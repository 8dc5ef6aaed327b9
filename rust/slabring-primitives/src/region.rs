use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// A contiguous byte range that rings, pools and segment headers are laid
/// out in, addressed by offset.
///
/// `Region` is a copyable view. It does not own the memory; whoever mapped it
/// (a `MemoryBackend`, a `HeapRegion`) must outlive every view.
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// - `base` must be non-null and valid for reads and writes of `len` bytes
    /// - `base` must be aligned to 64 bytes
    /// - the memory must remain valid for the lifetime of this Region
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        debug_assert!(!base.is_null(), "region base must be non-null");
        debug_assert!(base as usize % 64 == 0, "region base must be 64-byte aligned");
        // SAFETY: caller guarantees non-null.
        let base = unsafe { NonNull::new_unchecked(base) };
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to byte `off`. Panics when `off` is past the end.
    #[inline]
    pub fn offset(&self, off: usize) -> *mut u8 {
        assert!(
            off < self.len,
            "offset {off} out of bounds (len={})",
            self.len
        );
        unsafe { self.as_ptr().add(off) }
    }

    /// Pointer to byte `off`, or `None` when it lies outside the region.
    #[inline]
    pub fn checked_offset(&self, off: usize) -> Option<NonNull<u8>> {
        if off < self.len {
            // SAFETY: in bounds of a non-null allocation.
            Some(unsafe { self.base.add(off) })
        } else {
            None
        }
    }

    /// Byte offset of `ptr` within the region, if it points inside it.
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let off = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        (off < self.len).then_some(off)
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Returns a reference to a `T` at the given byte offset.
    ///
    /// # Safety
    ///
    /// The offset must be aligned for `T`, `off + size_of::<T>()` must be in
    /// bounds, and the bytes must hold a valid `T`.
    #[inline]
    pub unsafe fn get<T>(&self, off: usize) -> &T {
        debug_assert!(off + size_of::<T>() <= self.len);
        debug_assert!(off.is_multiple_of(align_of::<T>()));
        unsafe { &*(self.offset(off) as *const T) }
    }

    /// Returns a mutable reference to a `T` at the given byte offset.
    ///
    /// # Safety
    ///
    /// Same as [`get`](Self::get), and no other reference to those bytes may
    /// be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, off: usize) -> &mut T {
        debug_assert!(off + size_of::<T>() <= self.len);
        debug_assert!(off.is_multiple_of(align_of::<T>()));
        unsafe { &mut *(self.offset(off) as *mut T) }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::Region;
    use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
    use std::ptr::NonNull;

    /// Zeroed, 64-byte aligned heap memory standing in for a mapped segment.
    ///
    /// Used by the loom models and unit tests, where mapping real pages would
    /// get in the way.
    pub struct HeapRegion {
        base: NonNull<u8>,
        len: usize,
        layout: Layout,
    }

    impl HeapRegion {
        /// Allocate `size` zeroed bytes aligned to 64.
        ///
        /// Panics if `size` overflows a `Layout`; aborts on allocation failure.
        pub fn new_zeroed(size: usize) -> Self {
            let layout = match Layout::from_size_align(size.max(1), 64) {
                Ok(layout) => layout,
                Err(_) => panic!("heap region of {size} bytes overflows Layout"),
            };
            let ptr = unsafe { alloc_zeroed(layout) };
            let Some(base) = NonNull::new(ptr) else {
                handle_alloc_error(layout)
            };
            Self {
                base,
                len: size,
                layout,
            }
        }

        #[inline]
        pub fn region(&self) -> Region {
            unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;
