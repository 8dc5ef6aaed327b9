// Tracing macros for slabring
//
// These macros forward to the tracing crate. Hot paths (push, pop, allocate)
// stay silent apart from trace!.

// -----------------------------------------------------------------------------
// trace! - Very verbose: promotion decisions, retry loops
// -----------------------------------------------------------------------------

#![allow(unused_macro_rules)]

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Segment create/attach/publish, layout decisions
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// warn! - Advisory operations that failed without affecting correctness
// -----------------------------------------------------------------------------

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
