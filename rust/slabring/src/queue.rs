//! Typed fixed-capacity queues.
//!
//! A [`Queue`] is a ring laid out in its own [`MemoryBackend`], either private
//! to the process or named and shared. The policy parameter picks the
//! synchronization scheme:
//!
//! | policy   | producers | consumers |
//! |----------|-----------|-----------|
//! | [`Spsc`] | 1         | 1         |
//! | [`Mpsc`] | many      | 1         |
//! | [`Mpmc`] | many      | many      |
//!
//! Push and pop go through [`Producer`] and [`Consumer`] handles. Roles with
//! a single holder are claimed when the handle is created and released when
//! it drops; multi roles hand out clonable handles, and the queue itself
//! exposes `push`/`pop` for them directly.
//!
//! Elements are `Copy`, so a slot never owns anything that needs dropping
//! when it is recycled.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, Ordering};

use slabring_primitives::ring::{
    MpmcRingRaw, MpscRingRaw, Ring, RingLayout, RingPolicy, RingRaw, RingStatus, SpscRingRaw,
};
use slabring_primitives::sync::CACHE_LINE;
use slabring_primitives::{
    Backoff, DEFAULT_SPIN_LIMIT, SEGMENT_HEADER_SIZE, SegmentHeaderInit, SegmentKind,
};

use crate::backend::{BackendOptions, MemoryBackend};
use crate::error::{Error, Result};
use crate::segment;

/// Largest capacity a queue can be rounded up to.
pub const MAX_CAPACITY: usize = 1 << 31;

mod sealed {
    pub trait Sealed {}
}

/// Synchronization policy of a [`Queue`].
pub trait Policy: sealed::Sealed + Send + Sync + 'static {
    /// Raw ring implementing the policy for elements of type `T`.
    type Raw<T: Copy + Send>: RingRaw<Item = T>;

    const KIND: RingPolicy;
    const MULTI_PRODUCER: bool;
    const MULTI_CONSUMER: bool;
}

/// Policies that allow any number of concurrent producers.
pub trait MultiProducer: Policy {}

/// Policies that allow any number of concurrent consumers.
pub trait MultiConsumer: Policy {}

/// Single producer, single consumer. FIFO.
#[derive(Debug)]
pub enum Spsc {}

/// Many producers, one consumer. The reactor command channel.
#[derive(Debug)]
pub enum Mpsc {}

/// Many producers, many consumers.
#[derive(Debug)]
pub enum Mpmc {}

impl sealed::Sealed for Spsc {}
impl sealed::Sealed for Mpsc {}
impl sealed::Sealed for Mpmc {}

impl Policy for Spsc {
    type Raw<T: Copy + Send> = SpscRingRaw<T>;
    const KIND: RingPolicy = RingPolicy::Spsc;
    const MULTI_PRODUCER: bool = false;
    const MULTI_CONSUMER: bool = false;
}

impl Policy for Mpsc {
    type Raw<T: Copy + Send> = MpscRingRaw<T>;
    const KIND: RingPolicy = RingPolicy::Mpsc;
    const MULTI_PRODUCER: bool = true;
    const MULTI_CONSUMER: bool = false;
}

impl Policy for Mpmc {
    type Raw<T: Copy + Send> = MpmcRingRaw<T>;
    const KIND: RingPolicy = RingPolicy::Mpmc;
    const MULTI_PRODUCER: bool = true;
    const MULTI_CONSUMER: bool = true;
}

impl MultiProducer for Mpsc {}
impl MultiProducer for Mpmc {}
impl MultiConsumer for Mpmc {}

/// Queue construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Requested slot count; rounded up to a power of two, and to at least
    /// two slots for [`Mpmc`].
    pub capacity: usize,
    /// Shared segment name. `None` maps private memory.
    pub name: Option<String>,
    pub backend: BackendOptions,
    /// Spins before blocking calls start yielding.
    pub spin_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            name: None,
            backend: BackendOptions::default(),
            spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity,
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// A push that found no free slot. Hands the value back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is full")
    }
}

impl<T> std::error::Error for Full<T> {}

impl<T> From<Full<T>> for Error {
    fn from(_: Full<T>) -> Self {
        Error::Temporary
    }
}

/// A fixed-capacity lock-free queue of `T` with policy `P`.
pub struct Queue<T: Copy + Send + 'static, P: Policy> {
    ring: Ring<P::Raw<T>>,
    spin_limit: u32,
    producer_claimed: AtomicBool,
    consumer_claimed: AtomicBool,
    backend: MemoryBackend,
    _policy: PhantomData<P>,
}

impl<T: Copy + Send + 'static, P: Policy> Queue<T, P> {
    /// Private queue with at least `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(QueueConfig::new(capacity))
    }

    /// Create or attach to the shared queue `name`.
    ///
    /// Every process must use the same element type, policy and requested
    /// capacity (after rounding); otherwise attaching fails with
    /// [`Error::InvalidParameter`].
    pub fn named(name: &str, capacity: usize) -> Result<Self> {
        Self::with_config(QueueConfig::named(name, capacity))
    }

    pub fn with_config(config: QueueConfig) -> Result<Self> {
        check_element::<T>()?;
        let capacity = round_capacity(config.capacity, P::KIND)?;
        let layout = RingLayout::for_type::<T>(P::KIND, capacity).ok_or_else(|| {
            Error::invalid(format!(
                "queue of {capacity} x {} bytes overflows the address space",
                size_of::<T>()
            ))
        })?;
        let total_size = SEGMENT_HEADER_SIZE
            .checked_add(layout.size)
            .ok_or_else(|| Error::invalid("queue size overflows"))?;

        let init = SegmentHeaderInit {
            kind: SegmentKind::Queue,
            total_size: total_size as u64,
            params: [
                P::KIND as u64,
                capacity as u64,
                size_of::<T>() as u64,
                align_of::<T>() as u64,
            ],
        };
        let backend = segment::open(config.name.as_deref(), init, &config.backend, |region| {
            let _ = unsafe { Ring::<P::Raw<T>>::init(region, SEGMENT_HEADER_SIZE, capacity) };
        })?;

        let ring = unsafe { Ring::attach(backend.region(), SEGMENT_HEADER_SIZE) }
            .map_err(Error::invalid)?;

        debug!(
            policy = ?P::KIND,
            requested = config.capacity,
            capacity,
            slot_size = size_of::<T>(),
            "queue ready"
        );
        Ok(Self {
            ring,
            spin_limit: config.spin_limit,
            producer_claimed: AtomicBool::new(false),
            consumer_claimed: AtomicBool::new(false),
            backend,
            _policy: PhantomData,
        })
    }

    /// Take the producer role.
    ///
    /// For single-producer policies only one handle may exist at a time in
    /// this process; a second call fails with [`Error::ResourceInUse`] until
    /// the first handle drops.
    pub fn producer(&self) -> Result<Producer<'_, T, P>> {
        if !P::MULTI_PRODUCER && self.producer_claimed.swap(true, Ordering::AcqRel) {
            return Err(Error::ResourceInUse {
                what: "queue producer".into(),
                reason: "another producer handle is alive".into(),
            });
        }
        Ok(Producer {
            queue: self,
            backoff: Backoff::with_spin_limit(self.spin_limit),
        })
    }

    /// Take the consumer role. Single-consumer policies allow one live handle.
    pub fn consumer(&self) -> Result<Consumer<'_, T, P>> {
        if !P::MULTI_CONSUMER && self.consumer_claimed.swap(true, Ordering::AcqRel) {
            return Err(Error::ResourceInUse {
                what: "queue consumer".into(),
                reason: "another consumer handle is alive".into(),
            });
        }
        Ok(Consumer {
            queue: self,
            backoff: Backoff::with_spin_limit(self.spin_limit),
        })
    }

    /// Slot count after rounding.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity() as usize
    }

    /// Elements waiting to be popped (approximate under concurrency).
    #[inline]
    pub fn pending(&self) -> usize {
        self.ring.status().len as usize
    }

    /// Free slots (approximate under concurrency).
    #[inline]
    pub fn available(&self) -> usize {
        self.ring.status().available() as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.status().is_full()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.status().is_empty()
    }

    /// Cursor snapshot for diagnostics.
    pub fn status(&self) -> RingStatus {
        self.ring.status()
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn backoff(&self) -> Backoff {
        Backoff::with_spin_limit(self.spin_limit)
    }
}

impl<T: Copy + Send + 'static, P: MultiProducer> Queue<T, P> {
    /// Push without blocking; any thread may call this.
    #[inline]
    pub fn try_push(&self, value: T) -> std::result::Result<(), Full<T>> {
        self.ring.try_push(value).map_err(|_| Full(value))
    }

    /// Push, spinning then yielding until a slot frees up.
    pub fn push(&self, value: T) {
        push_blocking(&self.ring, &mut self.backoff(), value);
    }
}

impl<T: Copy + Send + 'static, P: MultiConsumer> Queue<T, P> {
    /// Pop without blocking; any thread may call this.
    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.ring.try_pop()
    }

    /// Pop, spinning then yielding until an element arrives.
    pub fn pop(&self) -> T {
        pop_blocking(&self.ring, &mut self.backoff())
    }
}

impl<T: Copy + Send + 'static, P: Policy> fmt::Debug for Queue<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("policy", &P::KIND)
            .field("capacity", &self.capacity())
            .field("status", &self.status())
            .field("name", &self.backend.name())
            .finish()
    }
}

/// Producer role of a [`Queue`].
pub struct Producer<'q, T: Copy + Send + 'static, P: Policy> {
    queue: &'q Queue<T, P>,
    backoff: Backoff,
}

impl<'q, T: Copy + Send + 'static, P: Policy> Producer<'q, T, P> {
    /// Push without blocking. On a full queue the value comes back in
    /// [`Full`].
    #[inline]
    pub fn try_push(&mut self, value: T) -> std::result::Result<(), Full<T>> {
        self.queue.ring.try_push(value).map_err(|_| Full(value))
    }

    /// Push, backing off until a slot frees up.
    pub fn push(&mut self, value: T) {
        push_blocking(&self.queue.ring, &mut self.backoff, value);
    }

    pub fn queue(&self) -> &'q Queue<T, P> {
        self.queue
    }
}

impl<T: Copy + Send + 'static, P: Policy> fmt::Debug for Producer<'_, T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("policy", &P::KIND)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<T: Copy + Send + 'static, P: MultiProducer> Clone for Producer<'_, T, P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue,
            backoff: self.queue.backoff(),
        }
    }
}

impl<T: Copy + Send + 'static, P: Policy> Drop for Producer<'_, T, P> {
    fn drop(&mut self) {
        if !P::MULTI_PRODUCER {
            self.queue.producer_claimed.store(false, Ordering::Release);
        }
    }
}

/// Consumer role of a [`Queue`].
pub struct Consumer<'q, T: Copy + Send + 'static, P: Policy> {
    queue: &'q Queue<T, P>,
    backoff: Backoff,
}

impl<'q, T: Copy + Send + 'static, P: Policy> Consumer<'q, T, P> {
    /// Pop without blocking. `None` means empty right now.
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        self.queue.ring.try_pop()
    }

    /// Pop, backing off until an element arrives.
    pub fn pop(&mut self) -> T {
        pop_blocking(&self.queue.ring, &mut self.backoff)
    }

    pub fn queue(&self) -> &'q Queue<T, P> {
        self.queue
    }
}

impl<T: Copy + Send + 'static, P: Policy> fmt::Debug for Consumer<'_, T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("policy", &P::KIND)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<T: Copy + Send + 'static, P: MultiConsumer> Clone for Consumer<'_, T, P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue,
            backoff: self.queue.backoff(),
        }
    }
}

impl<T: Copy + Send + 'static, P: Policy> Drop for Consumer<'_, T, P> {
    fn drop(&mut self) {
        if !P::MULTI_CONSUMER {
            self.queue.consumer_claimed.store(false, Ordering::Release);
        }
    }
}

fn push_blocking<R: RingRaw>(ring: &Ring<R>, backoff: &mut Backoff, value: R::Item) {
    while ring.try_push(value).is_err() {
        backoff.step();
    }
    backoff.reset();
}

fn pop_blocking<R: RingRaw>(ring: &Ring<R>, backoff: &mut Backoff) -> R::Item {
    loop {
        if let Some(value) = ring.try_pop() {
            backoff.reset();
            return value;
        }
        backoff.step();
    }
}

/// Round `requested` up to a power of two no smaller than the policy allows.
fn round_capacity(requested: usize, policy: RingPolicy) -> Result<u32> {
    if requested == 0 {
        return Err(Error::invalid("queue capacity must be > 0"));
    }
    requested
        .max(policy.min_capacity() as usize)
        .checked_next_power_of_two()
        .filter(|&capacity| capacity <= MAX_CAPACITY)
        .map(|capacity| capacity as u32)
        .ok_or_else(|| {
            Error::invalid(format!(
                "queue capacity {requested} exceeds the maximum of {MAX_CAPACITY}"
            ))
        })
}

fn check_element<T>() -> Result<()> {
    if size_of::<T>() == 0 {
        return Err(Error::invalid("queue elements must not be zero-sized"));
    }
    if align_of::<T>() > CACHE_LINE {
        return Err(Error::invalid(format!(
            "queue element alignment {} exceeds {CACHE_LINE}",
            align_of::<T>()
        )));
    }
    Ok(())
}
