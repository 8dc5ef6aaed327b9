use core::marker::PhantomData;

use super::{RawParts, RingFull, RingHeader, RingPolicy, RingRaw};
use crate::sync::{AtomicU64, Ordering, spin_loop};

/// Multi-producer, single-consumer ring.
///
/// Any number of threads may call `try_push`; at most one may call
/// `try_pop` at a time.
///
/// Producers reserve a position by advancing `head` with a CAS that never
/// moves it more than `capacity` past `tail`, write the slot, then mark it
/// ready by storing `position + 1` into the slot's sequence. The consumer
/// only takes the slot under `tail`, and only once its sequence says the
/// producer for this lap has finished, so elements leave in reservation
/// order.
pub struct MpscRingRaw<T> {
    parts: RawParts<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for MpscRingRaw<T> {}
unsafe impl<T: Send> Sync for MpscRingRaw<T> {}

impl<T: Copy + Send> RingRaw for MpscRingRaw<T> {
    type Item = T;

    const POLICY: RingPolicy = RingPolicy::Mpsc;

    #[inline]
    unsafe fn from_raw(header: *mut RingHeader, sequences: *mut AtomicU64, slots: *mut T) -> Self {
        Self {
            parts: RawParts::new(header, sequences, slots),
            _marker: PhantomData,
        }
    }

    unsafe fn init_slots(&self) {
        // No slot is ready until a producer stores position + 1.
        unsafe { self.parts.init_sequences(|_| 0) };
    }

    fn try_push(&self, value: T) -> Result<(), RingFull> {
        let header = self.parts.header();
        let capacity = header.capacity as u64;

        let mut head = header.head.load(Ordering::Relaxed);
        loop {
            let tail = header.tail.load(Ordering::Acquire);
            let used = head.wrapping_sub(tail) as i64;
            if used < 0 {
                // Our head is older than the consumer's progress.
                head = header.head.load(Ordering::Relaxed);
                continue;
            }
            if used as u64 >= capacity {
                return Err(RingFull);
            }

            match header.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    head = actual;
                    spin_loop();
                }
            }
        }

        unsafe { self.parts.write(head, value) };
        self.parts
            .sequence(head)
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    fn try_pop(&self) -> Option<T> {
        let header = self.parts.header();

        let tail = header.tail.load(Ordering::Relaxed);
        let seq = self.parts.sequence(tail).load(Ordering::Acquire);
        if seq != tail.wrapping_add(1) {
            // Empty, or the producer holding this position has not
            // published yet.
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
