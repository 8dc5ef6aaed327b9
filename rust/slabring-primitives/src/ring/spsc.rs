use core::marker::PhantomData;

use super::{RawParts, RingFull, RingHeader, RingPolicy, RingRaw};
use crate::sync::{AtomicU64, Ordering};

/// Wait-free single-producer, single-consumer ring.
///
/// At most one thread may call `try_push` and at most one thread may call
/// `try_pop` at any time. The producer owns `head`, the consumer owns `tail`;
/// each only reads the other's cursor.
pub struct SpscRingRaw<T> {
    parts: RawParts<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for SpscRingRaw<T> {}
unsafe impl<T: Send> Sync for SpscRingRaw<T> {}

impl<T: Copy + Send> RingRaw for SpscRingRaw<T> {
    type Item = T;

    const POLICY: RingPolicy = RingPolicy::Spsc;

    #[inline]
    unsafe fn from_raw(header: *mut RingHeader, sequences: *mut AtomicU64, slots: *mut T) -> Self {
        Self {
            parts: RawParts::new(header, sequences, slots),
            _marker: PhantomData,
        }
    }

    unsafe fn init_slots(&self) {}

    fn try_push(&self, value: T) -> Result<(), RingFull> {
        let header = self.parts.header();

        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= header.capacity as u64 {
            return Err(RingFull);
        }

        unsafe { self.parts.write(head, value) };
        header.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    fn try_pop(&self) -> Option<T> {
        let header = self.parts.header();

        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let value = unsafe { self.parts.read(tail) };
        header.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        self.parts.header()
    }
}
