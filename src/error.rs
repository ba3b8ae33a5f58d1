//! Error types shared by both allocator backends.
//!
//! Every fallible operation in the crate returns [`AllocError`]. The
//! variants follow the allocation taxonomy (invalid argument, resource
//! exhaustion, corruption/other) and [`AllocError::kind`] collapses them to
//! an [`ErrorKind`] for callers that only care about the category.

use crate::pmem::store::StoreError;
use crate::team::TeamError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = AllocError> = core::result::Result<T, E>;

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad handle, flag, name, team or size.
    InvalidArgument,
    /// No free range or pool space large enough.
    OutOfMemory,
    /// A pool file exists but does not have the expected shape.
    Corrupt,
    /// A transaction aborted for a reason other than space, or an I/O failure.
    Other,
    /// Raised by the team collaborator and forwarded unchanged.
    Team,
}

/// The error type for allocation failures.
#[derive(Debug, Error)]
pub enum AllocError {
    /// An argument was rejected before any state was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Not enough contiguous space to satisfy the request.
    #[error("out of memory: requested {requested} bytes, largest available {available} bytes")]
    OutOfMemory {
        /// Number of bytes requested.
        requested: usize,
        /// Largest contiguous space that was available.
        available: usize,
    },

    /// The pool file at `path` is foreign or damaged.
    #[error("corrupt pool at {path}: {reason}")]
    Corrupt {
        /// Backing file of the pool.
        path: PathBuf,
        /// What did not match.
        reason: String,
    },

    /// The object store failed in a way that is not space exhaustion.
    #[error("persistent store failure: {0}")]
    Store(#[source] StoreError),

    /// Error raised by the team collaborator.
    #[error(transparent)]
    Team(#[from] TeamError),
}

impl AllocError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AllocError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            AllocError::Corrupt { .. } => ErrorKind::Corrupt,
            AllocError::Store(_) => ErrorKind::Other,
            AllocError::Team(_) => ErrorKind::Team,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AllocError::InvalidArgument(msg.into())
    }
}

impl From<StoreError> for AllocError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfSpace { requested, available } => AllocError::OutOfMemory {
                requested: usize::try_from(requested).unwrap_or(usize::MAX),
                available: usize::try_from(available).unwrap_or(usize::MAX),
            },
            StoreError::Corrupt { path, reason } => AllocError::Corrupt { path, reason },
            StoreError::LayoutMismatch { .. } | StoreError::NotFound { .. } => {
                AllocError::InvalidArgument(err.to_string())
            }
            other => AllocError::Store(other),
        }
    }
}
