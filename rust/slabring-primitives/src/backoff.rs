//! Spin-then-yield backoff for contended retry loops.
//!
//! The first `spin_limit` calls to [`Backoff::step`] issue a CPU spin hint;
//! every call after that yields the thread to the scheduler. The attempt
//! counter saturates, so a long wait never falls back into the spin phase.

use crate::sync::{spin_loop, thread};

/// Number of spin attempts before [`Backoff`] starts yielding.
pub const DEFAULT_SPIN_LIMIT: u32 = 200;

/// What a single [`Backoff::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Issued a spin-loop hint and kept the CPU.
    Spin,
    /// Yielded the time slice.
    Yield,
}

/// Adaptive wait strategy used by blocking queue operations and segment attach.
///
/// Plain value type: no allocation, cheap to create per wait loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    spin_limit: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Backoff with [`DEFAULT_SPIN_LIMIT`] spins before yielding.
    pub const fn new() -> Self {
        Self::with_spin_limit(DEFAULT_SPIN_LIMIT)
    }

    /// Backoff that spins `spin_limit` times before yielding.
    ///
    /// A limit of zero yields from the first step.
    pub const fn with_spin_limit(spin_limit: u32) -> Self {
        Self {
            attempts: 0,
            spin_limit,
        }
    }

    /// Perform one backoff attempt.
    #[inline]
    pub fn step(&mut self) -> BackoffStep {
        let step = if self.attempts < self.spin_limit {
            spin_loop();
            BackoffStep::Spin
        } else {
            thread::yield_now();
            BackoffStep::Yield
        };
        self.attempts = self.attempts.saturating_add(1);
        step
    }

    /// Start over in the spin phase. Call after the awaited condition held.
    #[inline]
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since creation or the last [`reset`](Self::reset).
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[inline]
    pub fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    /// True once the next step will yield instead of spin.
    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.attempts >= self.spin_limit
    }
}
