//! The team collaborator.
//!
//! Rank queries, barriers and memory registration belong to the team layer
//! of the runtime. The allocators only call into it through [`Team`].
//! [`LocalTeam`] is a single-process implementation for standalone use.

use crate::gptr::{GlobalPtr, SegmentId};
use core::ptr::NonNull;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// Identifier of a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamId(pub i32);

impl TeamId {
    /// The undefined team.
    pub const NULL: TeamId = TeamId(-1);
    /// The team containing every unit.
    pub const ALL: TeamId = TeamId(0);

    /// Returns `true` for [`TeamId::NULL`].
    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl core::fmt::Display for TeamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rank of a unit within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u32);

impl core::fmt::Display for UnitId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error raised by a team collaborator.
///
/// Allocators forward it to their callers as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("team error {code}: {message}")]
pub struct TeamError {
    /// Collaborator-defined status code.
    pub code: i32,
    /// Diagnostic text.
    pub message: String,
}

impl TeamError {
    /// Creates a new error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A named, ordered group of units.
pub trait Team {
    /// Identifier of this team.
    fn id(&self) -> TeamId;

    /// Rank of the calling unit within this team.
    ///
    /// # Errors
    /// Returns `TeamError` if the team is not known to the collaborator.
    fn rank(&self) -> Result<UnitId, TeamError>;

    /// Blocks until every unit of the team has entered the barrier.
    ///
    /// # Errors
    /// Returns `TeamError` if the collective fails.
    fn barrier(&self) -> Result<(), TeamError>;

    /// Publishes `nbytes` at `addr` into the team's global address space.
    ///
    /// # Errors
    /// Returns `TeamError` if the extent cannot be registered.
    fn register_memory(&self, addr: NonNull<u8>, nbytes: usize) -> Result<GlobalPtr, TeamError>;
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    segment: SegmentId,
    addr: usize,
    len: usize,
}

/// A team of one unit living in the current process.
///
/// Every registration gets its own segment id and the returned pointer has
/// offset zero. [`LocalTeam::resolve`] maps a pointer back to its address.
#[derive(Debug)]
pub struct LocalTeam {
    id: TeamId,
    rank: UnitId,
    registrations: Mutex<Vec<Registration>>,
}

impl LocalTeam {
    /// Creates a team with the given id whose only unit has rank `rank`.
    pub fn new(id: TeamId, rank: UnitId) -> Self {
        Self {
            id,
            rank,
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Returns the local address behind `gptr`, if it was registered here and
    /// the offset lies inside the registered extent.
    pub fn resolve(&self, gptr: &GlobalPtr) -> Option<NonNull<u8>> {
        if gptr.unit_id != self.rank {
            return None;
        }
        let table = self.registrations.lock().ok()?;
        let reg = table.iter().find(|r| r.segment == gptr.segment_id)?;
        let offset = usize::try_from(gptr.offset).ok()?;
        if offset >= reg.len {
            return None;
        }
        NonNull::new((reg.addr + offset) as *mut u8)
    }

    /// Number of extents registered so far.
    pub fn registered(&self) -> usize {
        self.registrations.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Team for LocalTeam {
    fn id(&self) -> TeamId {
        self.id
    }

    fn rank(&self) -> Result<UnitId, TeamError> {
        if self.id.is_null() {
            return Err(TeamError::new(-1, "rank queried on the null team"));
        }
        Ok(self.rank)
    }

    fn barrier(&self) -> Result<(), TeamError> {
        Ok(())
    }

    fn register_memory(&self, addr: NonNull<u8>, nbytes: usize) -> Result<GlobalPtr, TeamError> {
        let mut table = self
            .registrations
            .lock()
            .map_err(|_| TeamError::new(-1, "registration table poisoned"))?;
        let segment = i16::try_from(table.len())
            .map(SegmentId)
            .map_err(|_| TeamError::new(-2, "segment ids exhausted"))?;
        table.push(Registration {
            segment,
            addr: addr.as_ptr() as usize,
            len: nbytes,
        });
        Ok(GlobalPtr::new(self.rank, segment, 0))
    }
}
