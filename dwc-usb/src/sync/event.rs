//! Lock-free event bitmask shared between an ISR and a worker thread.

use core::sync::atomic::{AtomicU32, Ordering};

/// OR-accumulated event bits.
///
/// Posting never loses a bit that has not been taken yet: posts use
/// `fetch_or` and the consumer drains with `swap`/`fetch_and`.
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: AtomicU32,
}

impl EventFlags {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Set `mask`, returning the bits that were already pending.
    pub fn post(&self, mask: u32) -> u32 {
        self.bits.fetch_or(mask, Ordering::AcqRel)
    }

    /// Clear `mask` without reading it.
    pub fn clear(&self, mask: u32) {
        self.bits.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Atomically take and clear the bits selected by `mask`.
    pub fn take(&self, mask: u32) -> u32 {
        self.bits.fetch_and(!mask, Ordering::AcqRel) & mask
    }

    /// Atomically take every pending bit.
    pub fn take_all(&self) -> u32 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    pub fn pending(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn is_set(&self, mask: u32) -> bool {
        self.pending() & mask != 0
    }
}
