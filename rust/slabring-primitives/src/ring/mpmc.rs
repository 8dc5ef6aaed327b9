use core::marker::PhantomData;

use super::{RawParts, RingFull, RingHeader, RingPolicy, RingRaw};
use crate::sync::{AtomicU64, Ordering, spin_loop};

/// Multi-producer, multi-consumer ring (per-slot turn sequences).
///
/// Slot `i` starts with sequence `i`. For a cursor position `pos` mapping to
/// that slot:
///
/// - `seq == pos`: free for the producer of this lap
/// - `seq == pos + 1`: published, ready for the consumer of this lap
/// - `seq == pos + capacity`: consumed, free for the producer of the next lap
///
/// Both sides claim a position with a CAS on their cursor and then hand the
/// slot over with a release store of the sequence.
pub struct MpmcRingRaw<T> {
    parts: RawParts<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for MpmcRingRaw<T> {}
unsafe impl<T: Send> Sync for MpmcRingRaw<T> {}

impl<T: Copy + Send> RingRaw for MpmcRingRaw<T> {
    type Item = T;

    const POLICY: RingPolicy = RingPolicy::Mpmc;

    #[inline]
    unsafe fn from_raw(header: *mut RingHeader, sequences: *mut AtomicU64, slots: *mut T) -> Self {
        Self {
            parts: RawParts::new(header, sequences, slots),
            _marker: PhantomData,
        }
    }

    unsafe fn init_slots(&self) {
        unsafe { self.parts.init_sequences(|slot| slot) };
    }

    fn try_push(&self, value: T) -> Result<(), RingFull> {
        let header = self.parts.header();

        let mut pos = header.head.load(Ordering::Relaxed);
        loop {
            let seq = self.parts.sequence(pos).load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;

            if diff == 0 {
                match header.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { self.parts.write(pos, value) };
                        self.parts
                            .sequence(pos)
                            .store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                // The consumer of the previous lap has not released this slot.
                return Err(RingFull);
            } else {
                pos = header.head.load(Ordering::Relaxed);
            }
            spin_loop();
        }
    }

    fn try_pop(&self) -> Option<T> {
        let header = self.parts.header();
        let capacity = header.capacity as u64;

        let mut pos = header.tail.load(Ordering::Relaxed);
        loop {
            let seq = self.parts.sequence(pos).load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;

            if diff == 0 {
                match header.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { self.parts.read(pos) };
                        self.parts
                            .sequence(pos)
                            .store(pos.wrapping_add(capacity), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = header.tail.load(Ordering::Relaxed);
            }
            spin_loop();
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        self.parts.header()
    }
}
