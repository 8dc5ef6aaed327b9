//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};

use slabring::MemoryBackend;

/// Install a fmt subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A segment name unique to this process and call, unlinked on drop.
pub struct SegmentName(String);

impl SegmentName {
    pub fn new(tag: &str) -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let name = format!("/slabring-test-{tag}-{}-{n}", std::process::id());
        let _ = MemoryBackend::unlink(&name);
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SegmentName {
    fn drop(&mut self) {
        let _ = MemoryBackend::unlink(&self.0);
    }
}
