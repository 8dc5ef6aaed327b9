use crate::backoff::Backoff;
use crate::sync::{AtomicU32, Ordering};

/// Magic bytes that identify a slabring segment (format 1).
pub const MAGIC: [u8; 8] = *b"SLABRNG\x01";

/// Fixed size of the segment header in bytes. Payload layout starts here.
pub const SEGMENT_HEADER_SIZE: usize = 64;

const NOT_READY: u32 = 0;
const READY: u32 = 1;

/// What a segment holds.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Queue = 1,
    Arena = 2,
}

/// Parameters the creator records and every attacher must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeaderInit {
    pub kind: SegmentKind,
    pub total_size: u64,
    /// Kind-specific layout parameters (policy, capacity, slot size...).
    pub params: [u64; 4],
}

/// The segment header lives at offset 0 of every segment.
///
/// The creator fills in every field and only then publishes `ready`;
/// attachers wait for `ready` before reading anything else.
#[repr(C)]
pub struct SegmentHeader {
    pub magic: [u8; 8],
    /// 0 until the creator finished laying out the segment, then 1.
    pub ready: AtomicU32,
    pub kind: u32,
    pub total_size: u64,
    pub params: [u64; 4],
    _reserved: [u8; 8],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

impl SegmentHeader {
    /// Write the header fields, leaving `ready` unset.
    pub fn init(&mut self, init: SegmentHeaderInit) {
        self.magic = MAGIC;
        self.ready = AtomicU32::new(NOT_READY);
        self.kind = init.kind as u32;
        self.total_size = init.total_size;
        self.params = init.params;
        self._reserved = [0; 8];
    }

    /// Make the segment visible to attachers. Everything written before this
    /// call happens-before an attacher's [`wait_ready`](Self::wait_ready).
    #[inline]
    pub fn publish(&self) {
        self.ready.store(READY, Ordering::Release);
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) == READY
    }

    /// Poll `ready` until the creator publishes.
    pub fn wait_ready(&self, backoff: &mut Backoff) {
        while !self.is_ready() {
            backoff.step();
        }
    }

    /// Check magic, kind, size and parameters against what the attacher
    /// expects.
    pub fn validate(&self, expected: &SegmentHeaderInit) -> Result<(), &'static str> {
        if self.magic != MAGIC {
            return Err("bad magic");
        }
        if self.kind != expected.kind as u32 {
            return Err("segment kind mismatch");
        }
        if self.total_size != expected.total_size {
            return Err("segment size mismatch");
        }
        if self.params != expected.params {
            return Err("segment parameters mismatch");
        }
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn init() -> SegmentHeaderInit {
        SegmentHeaderInit {
            kind: SegmentKind::Queue,
            total_size: 4096,
            params: [3, 128, 8, 8],
        }
    }

    fn make_header() -> (HeapRegion, *mut SegmentHeader) {
        let region = HeapRegion::new_zeroed(SEGMENT_HEADER_SIZE);
        let hdr: *mut SegmentHeader = unsafe { region.region().get_mut::<SegmentHeader>(0) };
        unsafe { (*hdr).init(init()) };
        (region, hdr)
    }

    #[test]
    fn init_leaves_ready_unset() {
        let (_region, hdr) = make_header();
        let hdr = unsafe { &*hdr };
        assert_eq!(hdr.magic, MAGIC);
        assert!(!hdr.is_ready());
        hdr.publish();
        assert!(hdr.is_ready());
    }

    #[test]
    fn validate_ok() {
        let (_region, hdr) = make_header();
        unsafe { &*hdr }.validate(&init()).expect("valid header");
    }

    #[test]
    fn validate_mismatches() {
        let (_region, hdr) = make_header();
        let hdr = unsafe { &mut *hdr };

        let mut other = init();
        other.params[1] = 256;
        assert_eq!(hdr.validate(&other), Err("segment parameters mismatch"));

        other = init();
        other.kind = SegmentKind::Arena;
        assert_eq!(hdr.validate(&other), Err("segment kind mismatch"));

        other = init();
        other.total_size = 8192;
        assert_eq!(hdr.validate(&other), Err("segment size mismatch"));

        hdr.magic[7] = 0x7f;
        assert_eq!(hdr.validate(&init()), Err("bad magic"));
    }

    #[test]
    fn attacher_waits_for_publish() {
        let (region, hdr) = make_header();
        let hdr = unsafe { &*hdr };

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut backoff = Backoff::with_spin_limit(10);
                hdr.wait_ready(&mut backoff);
                assert!(hdr.validate(&init()).is_ok());
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            hdr.publish();
        });
        drop(region);
    }
}
