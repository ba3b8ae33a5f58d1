//! Global pointers and the registration glue.
//!
//! A [`GlobalPtr`] is produced by the team collaborator, never by the
//! allocators themselves. [`register`] hands a freshly carved
//! [`LocalExtent`] to the team and returns whatever the team answers.

use crate::alloc::LocalExtent;
use crate::team::{Team, TeamError, UnitId};
use serde::{Deserialize, Serialize};

/// Identifier of a registered memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub i16);

/// A team-wide address: owning unit, segment and offset into the segment.
///
/// The allocators treat this as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalPtr {
    /// Unit that owns the memory.
    pub unit_id: UnitId,
    /// Segment the memory was registered as.
    pub segment_id: SegmentId,
    /// Byte offset within the segment.
    pub offset: u64,
}

impl GlobalPtr {
    /// Creates a global pointer from its parts.
    pub const fn new(unit_id: UnitId, segment_id: SegmentId, offset: u64) -> Self {
        Self {
            unit_id,
            segment_id,
            offset,
        }
    }
}

/// Publishes `extent` into `team`'s address space.
///
/// Errors from the collaborator are returned unchanged.
///
/// # Errors
/// Whatever [`Team::register_memory`] returns.
pub fn register(team: &(impl Team + ?Sized), extent: &LocalExtent) -> Result<GlobalPtr, TeamError> {
    team.register_memory(extent.ptr(), extent.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::team::TeamId;
    use core::ptr::NonNull;

    struct RejectingTeam;

    impl Team for RejectingTeam {
        fn id(&self) -> TeamId {
            TeamId(7)
        }

        fn rank(&self) -> Result<UnitId, TeamError> {
            Ok(UnitId(3))
        }

        fn barrier(&self) -> Result<(), TeamError> {
            Ok(())
        }

        fn register_memory(&self, _addr: NonNull<u8>, nbytes: usize) -> Result<GlobalPtr, TeamError> {
            Err(TeamError::new(-9, format!("cannot register {nbytes} bytes")))
        }
    }

    #[test]
    fn collaborator_errors_pass_through() {
        let mut buf = [0u8; 8];
        let extent = LocalExtent::new(NonNull::new(buf.as_mut_ptr()).unwrap(), 0, buf.len());
        let err = register(&RejectingTeam, &extent).unwrap_err();
        assert_eq!(err, TeamError::new(-9, "cannot register 8 bytes"));
    }

    #[test]
    fn global_ptr_serializes_as_plain_triple() {
        let gptr = GlobalPtr::new(UnitId(2), SegmentId(5), 128);
        let json = serde_json::to_string(&gptr).unwrap();
        assert_eq!(json, r#"{"unit_id":2,"segment_id":5,"offset":128}"#);
        let back: GlobalPtr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gptr);
    }
}
