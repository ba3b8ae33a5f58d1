//! `SharedMemoryPool`: a first-fit free-list allocator over one segment.
//!
//! The arena is partitioned by two [`RangeList`]s:
//!
//! - the **free list**, ascending by offset, never overlapping and fully
//!   coalesced (no two entries touch);
//! - the **allocated list**, one entry per live allocation, newest first.
//!
//! `free bytes + allocated bytes == segment size` holds after every call.
//!
//! # Concurrency
//!
//! There is no internal locking. Every mutating call takes `&mut self`;
//! sharing a pool between threads requires an external lock around it.
//! The pool is volatile and makes no crash guarantees.

use crate::alloc::allocator::{LocalExtent, TeamAlloc};
use crate::alloc::list::{AddressRange, RangeList};
use crate::alloc::segment::Segment;
use crate::alloc::stats::AllocStats;
use crate::error::{AllocError, Result};
use crate::team::Team;
use core::fmt;

/// First-fit allocator over a [`Segment`].
#[derive(Debug)]
pub struct SharedMemoryPool {
    segment: Segment,
    free: RangeList,
    allocated: RangeList,
    stats: AllocStats,
}

impl SharedMemoryPool {
    /// Maps a new segment of `size` bytes and puts all of it on the free list.
    ///
    /// # Errors
    /// See [`Segment::map`].
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self::with_segment(Segment::map(size)?))
    }

    /// Takes ownership of `segment` and manages all of it.
    pub fn with_segment(segment: Segment) -> Self {
        let mut free = RangeList::new();
        free.push_front(AddressRange::new(0, segment.size()));
        Self {
            segment,
            free,
            allocated: RangeList::new(),
            stats: AllocStats::default(),
        }
    }

    /// Carves `size` bytes out of the first free range that is large enough.
    ///
    /// A range of exactly `size` bytes leaves the free list; a larger one is
    /// shrunk from its low end, so allocations grow upwards through a range.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, `OutOfMemory` when no free range
    /// is large enough.
    pub fn alloc(&mut self, size: usize) -> Result<LocalExtent> {
        if size == 0 {
            return Err(AllocError::invalid("cannot allocate zero bytes"));
        }
        let Some((prev, id)) = self.free.find(|r| r.size >= size) else {
            self.stats.on_failure();
            tracing::debug!(
                segment = self.segment.id(),
                requested = size,
                largest = self.free.largest(),
                "shared-memory pool exhausted"
            );
            return Err(AllocError::OutOfMemory {
                requested: size,
                available: self.free.largest(),
            });
        };

        let fits_exactly = self.free.get(id).is_some_and(|r| r.size == size);
        let carved = if fits_exactly {
            self.free.remove(prev, id)
        } else {
            self.free.get_mut(id).map(|entry| {
                let carved = AddressRange::new(entry.offset, size);
                entry.offset += size;
                entry.size -= size;
                carved
            })
        }
        .ok_or_else(|| AllocError::invalid("free list entry vanished"))?;

        self.allocated.push_front(carved);
        self.stats.on_alloc(size);
        self.debug_check();
        self.extent_of(carved)
    }

    /// Returns `extent` to the free list and coalesces neighbours.
    ///
    /// The allocation is looked up by offset; its recorded size is what gets
    /// freed.
    ///
    /// # Errors
    /// `InvalidArgument` if no live allocation starts at `extent.offset()`
    /// (double free or a foreign extent). Both lists stay unchanged.
    pub fn free(&mut self, extent: &LocalExtent) -> Result<()> {
        self.free_offset(extent.offset())
    }

    /// Like [`SharedMemoryPool::free`], addressed by offset.
    ///
    /// # Errors
    /// `InvalidArgument` if no live allocation starts at `offset`.
    pub fn free_offset(&mut self, offset: usize) -> Result<()> {
        let range = self.allocated.remove_offset(offset).ok_or_else(|| {
            AllocError::invalid(format!(
                "offset {offset} is not allocated in segment {}",
                self.segment.id()
            ))
        })?;
        self.free.insert_sorted(range);
        self.free.melt();
        self.stats.on_dealloc(range.size);
        self.debug_check();
        Ok(())
    }

    fn extent_of(&self, range: AddressRange) -> Result<LocalExtent> {
        let ptr = self
            .segment
            .ptr_at(range.offset)
            .ok_or_else(|| AllocError::invalid(format!("range {range} outside segment")))?;
        Ok(LocalExtent::new(ptr, range.offset, range.size))
    }

    fn debug_check(&self) {
        debug_assert!(self.free.is_coalesced(), "free list not coalesced: {}", self.free);
        debug_assert_eq!(
            self.free.total_size() + self.allocated.total_size(),
            self.segment.size(),
            "arena partition broken"
        );
    }

    /// Total size of the arena.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.segment.size()
    }

    /// Bytes on the free list.
    pub fn free_bytes(&self) -> usize {
        self.free.total_size()
    }

    /// Bytes held by live allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.total_size()
    }

    /// The address-ordered free list.
    #[inline]
    pub fn free_list(&self) -> &RangeList {
        &self.free
    }

    /// Live allocations, newest first.
    #[inline]
    pub fn allocated_list(&self) -> &RangeList {
        &self.allocated
    }

    /// Id of the backing segment.
    #[inline]
    pub fn segment_id(&self) -> i32 {
        self.segment.id()
    }

    /// The backing segment.
    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Lifetime counters.
    #[inline]
    pub fn stats(&self) -> AllocStats {
        self.stats
    }
}

impl TeamAlloc for SharedMemoryPool {
    fn alloc_local(&mut self, _team: &dyn Team, nbytes: usize) -> Result<LocalExtent> {
        self.alloc(nbytes)
    }
}

impl fmt::Display for SharedMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "segment {} ({} bytes)", self.segment.id(), self.segment.size())?;
        writeln!(f, "  free:      {}", self.free)?;
        write!(f, "  allocated: {}", self.allocated)
    }
}
