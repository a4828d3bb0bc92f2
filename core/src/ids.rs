//! Monotonic resource id allocation.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use rmp_protocol::ResourceId;
use rmp_protocol::UNASSIGNED_ID;

/// Mints strictly increasing ids. Ids are never reused for the lifetime of
/// the allocator, and `UNASSIGNED_ID` is never minted.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(UNASSIGNED_ID + 1),
        }
    }

    pub fn generate(&self) -> ResourceId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
