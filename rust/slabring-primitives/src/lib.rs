#![doc = include_str!("../README.md")]

pub mod backoff;
pub mod region;
pub mod ring;
pub mod segment;
pub mod slab;
pub mod sync;
pub mod tagged;

pub use backoff::{Backoff, BackoffStep, DEFAULT_SPIN_LIMIT};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use ring::{
    MpmcRingRaw, MpscRingRaw, Ring, RingFull, RingHeader, RingLayout, RingPolicy, RingRaw,
    RingStatus, SpscRingRaw,
};
pub use segment::{MAGIC, SEGMENT_HEADER_SIZE, SegmentHeader, SegmentHeaderInit, SegmentKind};
pub use slab::{MIN_CHUNK_SIZE, Pool, PoolHeader, PoolLayout, PoolRaw};
pub use tagged::{NIL_INDEX, TaggedHead, TaggedIndex};

#[cfg(all(test, loom))]
mod loom_tests;
