//! Volatile allocation: range lists and the shared-memory free-list pool.

pub mod allocator;
pub mod list;
pub mod page;
pub mod segment;
pub mod shmem;
pub mod stats;

pub use allocator::{LocalExtent, TeamAlloc};
pub use list::{AddressRange, EntryId, RangeList};
pub use segment::Segment;
pub use shmem::SharedMemoryPool;
pub use stats::AllocStats;
