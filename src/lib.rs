//! # `pgas-mem` - Allocation Core for a PGAS Runtime
//!
//! Two allocator backends that hand out memory to the units of a team and
//! register it as globally addressable:
//!
//! - [`PersistentPool`]: one memory-mapped pool file per unit. Every
//!   allocation is a zero-initialized bucket linked into a persistent
//!   bucket list inside a single undo-logged transaction, so a crash never
//!   leaves a half-linked bucket behind.
//! - [`SharedMemoryPool`]: a first-fit free-list allocator over one mapped
//!   segment, with address-ordered free ranges that coalesce on release.
//!
//! Both implement [`TeamAlloc`]: the backend carves out a [`LocalExtent`]
//! and the [`Team`] collaborator turns it into a [`GlobalPtr`].
//!
//! ## Architecture
//!
//! ```text
//!            TeamAlloc::alloc_global
//!                     |
//!        +------------+-------------+
//!        |                          |
//!  PersistentPool            SharedMemoryPool
//!  (pmem::pool)              (alloc::shmem)
//!        |                          |
//!  Transaction / ObjStore     RangeList x2 / Segment
//!  (undo log, mmap file)      (free + allocated, mmap)
//!        |                          |
//!        +------------+-------------+
//!                     |
//!          gptr::register -> Team
//! ```
//!
//! Handles are explicit values: there is no process-wide allocator state,
//! and neither backend synchronizes internally.
//!
//! ## Example
//!
//! ```rust
//! use pgas_mem::{LocalTeam, SharedMemoryPool, TeamAlloc, TeamId, UnitId};
//!
//! let team = LocalTeam::new(TeamId::ALL, UnitId(0));
//! let mut pool = SharedMemoryPool::new(4096).unwrap();
//!
//! let gptr = pool.alloc_global(&team, 128).unwrap();
//! assert_eq!(gptr.unit_id, UnitId(0));
//! assert!(team.resolve(&gptr).is_some());
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod alloc;
pub mod config;
pub mod error;
pub mod gptr;
pub mod pmem;
pub mod team;

pub use alloc::{AddressRange, AllocStats, LocalExtent, RangeList, SharedMemoryPool, TeamAlloc};
pub use config::PoolConfig;
pub use error::{AllocError, ErrorKind, Result};
pub use gptr::{GlobalPtr, SegmentId};
pub use pmem::{BucketInfo, OpenFlags, PersistentPool, StoreError};
pub use team::{LocalTeam, Team, TeamError, TeamId, UnitId};
