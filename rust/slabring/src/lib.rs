#![doc = include_str!("../README.md")]

#[macro_use]
mod macros;

pub mod arena;
pub mod backend;
pub mod error;
pub mod queue;
mod segment;

pub use arena::{Arena, ArenaConfig, PoolStats};
pub use backend::{Attachment, BackendOptions, MemoryBackend};
pub use error::{Error, ErrorKind, Result};
pub use queue::{
    Consumer, Full, Mpmc, Mpsc, MultiConsumer, MultiProducer, Policy, Producer, Queue,
    QueueConfig, Spsc,
};
pub use slabring_primitives::{Backoff, BackoffStep, DEFAULT_SPIN_LIMIT, RingStatus};
