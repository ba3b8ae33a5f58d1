//! The allocation contract shared by both backends.

use crate::error::Result;
use crate::gptr::{self, GlobalPtr};
use crate::team::Team;
use core::ptr::NonNull;

/// A contiguous run of bytes carved out by an allocator backend.
///
/// `offset` is relative to the backend's arena (shared-memory segment or
/// pool file); `ptr` is the directly addressable local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalExtent {
    ptr: NonNull<u8>,
    offset: usize,
    len: usize,
}

impl LocalExtent {
    /// Creates an extent.
    #[inline]
    pub const fn new(ptr: NonNull<u8>, offset: usize, len: usize) -> Self {
        Self { ptr, offset, len }
    }

    /// Local address of the first byte.
    #[inline]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Offset of the first byte within the backing arena.
    #[inline]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// `true` for a zero-length extent.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The allocation contract shared by every backend.
///
/// A backend carves out a [`LocalExtent`]; [`TeamAlloc::alloc_global`] then
/// hands it to the team collaborator, which turns it into a [`GlobalPtr`].
///
/// Implementations take `&mut self`: none of them synchronizes internally.
pub trait TeamAlloc {
    /// Carves out `nbytes` for `team`.
    ///
    /// # Errors
    /// Backend specific; see the implementors.
    fn alloc_local(&mut self, team: &dyn Team, nbytes: usize) -> Result<LocalExtent>;

    /// Carves out `nbytes` and registers them with `team`.
    ///
    /// # Errors
    /// Any error of [`TeamAlloc::alloc_local`], or the collaborator's error
    /// unchanged.
    fn alloc_global(&mut self, team: &dyn Team, nbytes: usize) -> Result<GlobalPtr> {
        let extent = self.alloc_local(team, nbytes)?;
        Ok(gptr::register(team, &extent)?)
    }
}
