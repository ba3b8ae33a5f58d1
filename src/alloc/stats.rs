//! Per-allocator counters.

use serde::{Deserialize, Serialize};

/// Allocation counters kept by each allocator instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    /// Bytes handed out over the lifetime of the instance.
    pub allocated_bytes: usize,
    /// Successful allocations.
    pub allocated_count: usize,
    /// Bytes returned through `free`.
    pub deallocated_bytes: usize,
    /// Successful frees.
    pub deallocated_count: usize,
    /// Requests that failed for lack of space.
    pub failed_count: usize,
}

impl AllocStats {
    #[inline]
    pub(crate) fn on_alloc(&mut self, size: usize) {
        self.allocated_count += 1;
        self.allocated_bytes += size;
    }

    #[inline]
    pub(crate) fn on_dealloc(&mut self, size: usize) {
        self.deallocated_count += 1;
        self.deallocated_bytes += size;
    }

    #[inline]
    pub(crate) fn on_failure(&mut self) {
        self.failed_count += 1;
    }

    /// Bytes currently live according to these counters.
    pub fn live_bytes(&self) -> usize {
        self.allocated_bytes.saturating_sub(self.deallocated_bytes)
    }
}
