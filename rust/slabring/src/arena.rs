//! Slab arena: a set of fixed-size chunk pools in one segment.
//!
//! ```text
//! +0    SegmentHeader
//! +64   pool 0 (smallest chunks) | pool 1 | ... | pool n-1 (largest chunks)
//! ```
//!
//! `allocate` picks the smallest pool whose chunks fit and walks up to larger
//! pools while the candidates are empty. `try_allocate` only ever looks at the
//! best fit.

use std::fmt;
use std::ptr::NonNull;

use slabring_primitives::{
    MIN_CHUNK_SIZE, NIL_INDEX, Pool, PoolLayout, SEGMENT_HEADER_SIZE, SegmentHeaderInit,
    SegmentKind,
};

use crate::backend::{BackendOptions, MemoryBackend};
use crate::error::{Error, Result};
use crate::segment;

/// Arena construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Strictly ascending powers of two, each at least 16.
    pub chunk_sizes: Vec<usize>,
    /// Chunks per pool.
    pub chunk_count: usize,
    /// Shared segment name. `None` maps private memory.
    pub name: Option<String>,
    pub backend: BackendOptions,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            chunk_sizes: vec![64, 256, 1024, 4096],
            chunk_count: 1024,
            name: None,
            backend: BackendOptions::default(),
        }
    }
}

impl ArenaConfig {
    pub fn new(chunk_sizes: &[usize], chunk_count: usize) -> Self {
        Self {
            chunk_sizes: chunk_sizes.to_vec(),
            chunk_count,
            ..Self::default()
        }
    }
}

/// Per-pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub chunk_size: usize,
    pub chunk_count: usize,
    /// Approximate: walks the free list while others may be changing it.
    pub free: usize,
}

/// Fixed-size chunk allocator over one backend.
pub struct Arena {
    pools: Vec<Pool>,
    backend: MemoryBackend,
}

impl Arena {
    /// Private arena with `chunk_count` chunks of each size.
    pub fn new(chunk_sizes: &[usize], chunk_count: usize) -> Result<Self> {
        Self::with_config(ArenaConfig::new(chunk_sizes, chunk_count))
    }

    /// Create or attach to the shared arena `name`. Every attacher must pass
    /// the same sizes and count.
    pub fn named(name: &str, chunk_sizes: &[usize], chunk_count: usize) -> Result<Self> {
        Self::with_config(ArenaConfig {
            name: Some(name.to_owned()),
            ..ArenaConfig::new(chunk_sizes, chunk_count)
        })
    }

    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        let (sizes, count) = validate(&config.chunk_sizes, config.chunk_count)?;

        let mut offsets = Vec::with_capacity(sizes.len());
        let mut offset = SEGMENT_HEADER_SIZE;
        for &size in &sizes {
            let layout = PoolLayout::compute(size, count)
                .ok_or_else(|| Error::invalid("arena size overflows"))?;
            offsets.push(offset);
            // Pool sizes are whole cache lines, so every header stays aligned.
            offset = offset
                .checked_add(layout.size)
                .ok_or_else(|| Error::invalid("arena size overflows"))?;
        }
        let total_size = offset;

        let init = SegmentHeaderInit {
            kind: SegmentKind::Arena,
            total_size: total_size as u64,
            params: [
                sizes.len() as u64,
                count as u64,
                sizes[0] as u64,
                sizes[sizes.len() - 1] as u64,
            ],
        };
        let backend = segment::open(config.name.as_deref(), init, &config.backend, |region| {
            for (&offset, &size) in offsets.iter().zip(&sizes) {
                let _ = unsafe { Pool::init(region, offset, size, count) };
            }
        })?;

        let region = backend.region();
        let pools = offsets
            .iter()
            .zip(&sizes)
            .map(|(&offset, &size)| {
                let pool = unsafe { Pool::attach(region, offset) }.map_err(Error::invalid)?;
                if pool.chunk_size() != size || pool.chunk_count() != count {
                    return Err(Error::invalid(format!(
                        "pool at offset {offset} holds {} x {} bytes, expected {count} x {size}",
                        pool.chunk_count(),
                        pool.chunk_size(),
                    )));
                }
                Ok(pool)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(sizes = ?sizes, chunk_count = count, total_size, "arena ready");
        Ok(Self { pools, backend })
    }

    /// Index of the smallest pool whose chunks hold `size` bytes.
    #[inline]
    fn best_fit(&self, size: usize) -> usize {
        self.pools
            .partition_point(|pool| (pool.chunk_size() as usize) < size)
    }

    /// Allocate a chunk of at least `size` bytes.
    ///
    /// Tries the best-fitting pool, then each larger pool in turn. Returns
    /// `None` when `size` exceeds the largest chunk or every candidate pool
    /// is empty. A chunk freed into a smaller pool while the scan is past it
    /// is not revisited.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let start = self.best_fit(size);
        for (step, pool) in self.pools[start..].iter().enumerate() {
            if let Some(chunk) = pool.try_alloc() {
                if step > 0 {
                    trace!(
                        size,
                        fit = self.pools[start].chunk_size(),
                        used = pool.chunk_size(),
                        "promoted allocation"
                    );
                }
                return Some(chunk);
            }
        }
        None
    }

    /// Allocate from the best-fitting pool only.
    pub fn try_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.pools.get(self.best_fit(size))?.try_alloc()
    }

    /// Return a chunk to its pool.
    ///
    /// Null pointers, pointers outside the arena and pointers into the middle
    /// of a chunk are ignored.
    ///
    /// # Safety
    ///
    /// If `ptr` is a chunk of this arena it must have come from
    /// [`allocate`](Self::allocate) or [`try_allocate`](Self::try_allocate),
    /// must not have been freed since, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if let Some(pool) = self.pools.iter().find(|pool| pool.contains(ptr)) {
            let _ = unsafe { pool.free(ptr) };
        }
    }

    /// Whether `ptr` is the start of a chunk of this arena.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.pools
            .iter()
            .any(|pool| pool.inner().index_of(ptr).is_some())
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Chunks per pool.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.pools[0].chunk_count() as usize
    }

    pub fn chunk_size(&self, pool: usize) -> Option<usize> {
        self.pools.get(pool).map(|p| p.chunk_size() as usize)
    }

    /// Largest request `allocate` can satisfy.
    pub fn max_chunk_size(&self) -> usize {
        self.pools[self.pools.len() - 1].chunk_size() as usize
    }

    /// Approximate free chunks in pool `pool`.
    pub fn free_chunks(&self, pool: usize) -> Option<usize> {
        self.pools
            .get(pool)
            .map(|p| p.free_count_approx() as usize)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(|pool| PoolStats {
                chunk_size: pool.chunk_size() as usize,
                chunk_count: pool.chunk_count() as usize,
                free: pool.free_count_approx() as usize,
            })
            .collect()
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("pools", &self.stats())
            .field("name", &self.backend.name())
            .finish()
    }
}

fn validate(chunk_sizes: &[usize], chunk_count: usize) -> Result<(Vec<u32>, u32)> {
    if chunk_sizes.is_empty() {
        return Err(Error::invalid("arena needs at least one chunk size"));
    }

    let mut sizes = Vec::with_capacity(chunk_sizes.len());
    for &size in chunk_sizes {
        let valid = size.is_power_of_two() && size >= MIN_CHUNK_SIZE as usize;
        let Some(size) = u32::try_from(size).ok().filter(|_| valid) else {
            return Err(Error::invalid(format!(
                "chunk size {size} must be a power of two between {MIN_CHUNK_SIZE} and {}",
                1u32 << 31
            )));
        };
        if sizes.last().is_some_and(|&prev| prev >= size) {
            return Err(Error::invalid("chunk sizes must be strictly ascending"));
        }
        sizes.push(size);
    }

    let count = u32::try_from(chunk_count)
        .ok()
        .filter(|&count| count > 0 && count < NIL_INDEX)
        .ok_or_else(|| {
            Error::invalid(format!(
                "chunk count {chunk_count} must be between 1 and {}",
                NIL_INDEX - 1
            ))
        })?;

    Ok((sizes, count))
}
