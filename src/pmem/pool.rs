//! Per-unit persistent pools.
//!
//! A [`PersistentPool`] is one pool file per unit of a team, named
//! `<name>.<rank>`. Its root object holds the pool name and the head of a
//! singly linked list of buckets; every allocation pushes one bucket:
//!
//! ```text
//!  BucketListRoot          Bucket (newest)          Bucket (oldest)
//! +-------------+        +---------------+        +---------------+
//! | name        |        | element_size  |        | element_size  |
//! | head  ------+------> | element_count |        | element_count |
//! +-------------+        | data  --------+--> ..  | data          |
//!                        | next  --------+------> | next = 0      |
//!                        +---------------+        +---------------+
//! ```
//!
//! Allocation is one transaction: either the bucket, its zeroed data and
//! the new head all become durable, or none of them do.

use crate::alloc::allocator::{LocalExtent, TeamAlloc};
use crate::alloc::stats::AllocStats;
use crate::config::PoolConfig;
use crate::error::{AllocError, Result};
use crate::gptr::{self, GlobalPtr};
use crate::pmem::layout::{
    decode_name, encode_name, BucketListRoot, BucketRecord, PoolState, BUCKET_SIZE, NULL_REF, POOL_NAME_MAX,
    ROOT_SIZE,
};
use crate::pmem::store::{ObjStore, StoreError};
use crate::team::{Team, TeamId};
use core::fmt;
use core::ops::BitOr;
use std::fs;
use std::path::{Path, PathBuf};

/// Flags accepted by [`PersistentPool::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Create the pool file if it does not exist yet.
    pub const CREATE: OpenFlags = OpenFlags(0x1);

    /// Every supported flag.
    pub const ALL: OpenFlags = OpenFlags(0x1);

    /// No flags: open an existing pool.
    pub const fn empty() -> Self {
        OpenFlags(0)
    }

    /// Wraps raw bits, including unsupported ones.
    pub const fn from_bits_retain(bits: u32) -> Self {
        OpenFlags(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// `true` if every bit of `other` is set.
    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if no bit outside [`OpenFlags::ALL`] is set.
    pub const fn is_supported(self) -> bool {
        self.0 & !Self::ALL.0 == 0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        OpenFlags(self.0 | rhs.0)
    }
}

/// A committed bucket as read back from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketInfo {
    /// Pool offset of the bucket record.
    pub offset: u64,
    /// Size of one element; always `1` for buckets made by `alloc`.
    pub element_size: u64,
    /// Number of elements.
    pub element_count: u64,
    /// Pool offset of the data.
    pub data_offset: u64,
}

impl BucketInfo {
    /// Data length in bytes.
    pub fn len(&self) -> u64 {
        self.element_size.saturating_mul(self.element_count)
    }

    /// `true` if the bucket holds no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over the bucket list, newest first.
///
/// Yields an error and stops if a link points outside the heap or the list
/// is longer than the heap could hold.
pub struct Buckets<'a> {
    store: &'a ObjStore,
    next: u64,
    budget: u64,
}

impl Iterator for Buckets<'_> {
    type Item = Result<BucketInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NULL_REF {
            return None;
        }
        if self.budget == 0 {
            self.next = NULL_REF;
            return Some(Err(AllocError::Corrupt {
                path: self.store.path().to_path_buf(),
                reason: "bucket list does not terminate".to_owned(),
            }));
        }
        self.budget -= 1;

        let offset = self.next;
        match self.store.read::<BucketRecord>(offset) {
            Ok(record) => {
                self.next = record.next;
                Some(Ok(BucketInfo {
                    offset,
                    element_size: record.element_size,
                    element_count: record.element_count,
                    data_offset: record.data,
                }))
            }
            Err(e) => {
                self.next = NULL_REF;
                Some(Err(e.into()))
            }
        }
    }
}

/// A unit's persistent pool.
///
/// Buckets are never freed: the pool grows until it is out of space.
pub struct PersistentPool {
    layout: String,
    team: TeamId,
    store: ObjStore,
    stats: AllocStats,
}

impl PersistentPool {
    /// Opens (and with [`OpenFlags::CREATE`], creates) this unit's pool
    /// `name` in the current directory.
    ///
    /// # Errors
    /// See [`PersistentPool::open_with`].
    pub fn open(team: &dyn Team, name: &str, flags: OpenFlags, mode: u32) -> Result<Self> {
        Self::open_with(team, name, flags, mode, &PoolConfig::default())
    }

    /// Opens this unit's pool `name` in `config.directory`.
    ///
    /// The file is `<name>.<rank>`. It is created with permissions `mode`
    /// only if `flags` contains [`OpenFlags::CREATE`] and it does not exist
    /// yet or is empty; a created pool gets an empty bucket list tagged with
    /// `name`.
    ///
    /// # Errors
    /// - [`AllocError::InvalidArgument`] for unsupported flags, the null
    ///   team, an empty name, a name of [`POOL_NAME_MAX`] bytes or more, or
    ///   a file created under a different name, or a missing file without
    ///   [`OpenFlags::CREATE`]. Nothing touches the file system before the
    ///   argument checks pass.
    /// - [`AllocError::Team`] if the team cannot report this unit's rank.
    /// - [`AllocError::Corrupt`] if the file is not a usable pool.
    /// - [`AllocError::OutOfMemory`] if a new file cannot fit its root.
    /// - [`AllocError::Store`] on I/O failures or if the file is locked.
    pub fn open_with(team: &dyn Team, name: &str, flags: OpenFlags, mode: u32, config: &PoolConfig) -> Result<Self> {
        if !flags.is_supported() {
            tracing::error!(flags = flags.bits(), "invalid flag specified");
            return Err(AllocError::invalid(format!("unsupported open flags {:#x}", flags.bits())));
        }
        let team_id = team.id();
        if team_id.is_null() {
            return Err(AllocError::invalid("cannot open a pool for the null team"));
        }
        if name.is_empty() || name.len() >= POOL_NAME_MAX {
            return Err(AllocError::invalid(format!(
                "pool name must be 1 to {} bytes, got {}",
                POOL_NAME_MAX - 1,
                name.len()
            )));
        }
        let tag = encode_name(name).ok_or_else(|| AllocError::invalid("pool name contains a NUL byte"))?;

        let rank = team.rank()?;
        let path = config.directory.join(format!("{name}.{rank}"));

        let store = if flags.contains(OpenFlags::CREATE) && !holds_data(&path) {
            let mut store = ObjStore::create(&path, name, config, mode)?;
            init_root(&mut store, tag)?;
            tracing::info!(pool = %path.display(), team = %team_id, "created persistent pool");
            store
        } else {
            let mut store = ObjStore::open(&path, name, config.sync_on_commit)?;
            if store.state() == Some(PoolState::Created) {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(AllocError::Corrupt {
                        path,
                        reason: "pool root was never initialized".to_owned(),
                    });
                }
                tracing::warn!(pool = %path.display(), "resuming initialization of pool root");
                init_root(&mut store, tag)?;
            }
            store
        };

        if store.root_size() < ROOT_SIZE as u64 {
            return Err(AllocError::Corrupt {
                path,
                reason: format!("root object of {} bytes is too small", store.root_size()),
            });
        }
        // The store only checks the layout tag in the header; the root must agree.
        let root: BucketListRoot = store.read(store.root_offset())?;
        if root.name != tag {
            return Err(AllocError::Corrupt {
                path,
                reason: "root name does not match the pool name".to_owned(),
            });
        }
        tracing::debug!(pool = %path.display(), rank = %rank, "opened persistent pool");
        Ok(Self {
            layout: name.to_owned(),
            team: team_id,
            store,
            stats: AllocStats::default(),
        })
    }

    /// Allocates `nbytes` of zeroed persistent memory and registers it
    /// with `team`.
    ///
    /// # Errors
    /// Any error of [`PersistentPool::alloc_local`], or the collaborator's
    /// error unchanged.
    pub fn alloc(&mut self, team: &dyn Team, nbytes: usize) -> Result<GlobalPtr> {
        let extent = self.alloc_local(team, nbytes)?;
        Ok(gptr::register(team, &extent)?)
    }

    /// Allocates `nbytes` of zeroed persistent memory as a new bucket at
    /// the head of the bucket list.
    ///
    /// # Errors
    /// - [`AllocError::InvalidArgument`] if `team` is not the team the pool
    ///   was opened for, the pool has no root, or `nbytes` is zero.
    /// - [`AllocError::OutOfMemory`] if the pool is out of space.
    /// - [`AllocError::Store`] if the transaction aborted for another reason.
    ///
    /// On error the pool is exactly as it was before the call.
    pub fn alloc_local(&mut self, team: &dyn Team, nbytes: usize) -> Result<LocalExtent> {
        if team.id() != self.team {
            return Err(AllocError::invalid(format!(
                "pool {} belongs to team {}, not team {}",
                self.layout,
                self.team,
                team.id()
            )));
        }
        if self.store.root_size() < ROOT_SIZE as u64 {
            return Err(AllocError::invalid("improperly initialized pool"));
        }
        if nbytes == 0 {
            return Err(AllocError::invalid("cannot allocate zero bytes"));
        }

        let len = nbytes as u64;
        let root_at = self.store.root_offset();
        let result = self.store.transaction(|tx| {
            let root: BucketListRoot = tx.store().read(root_at)?;
            let bucket_at = tx.alloc_zeroed(BUCKET_SIZE as u64)?;
            let data = tx.alloc_zeroed(len)?;
            tx.write_obj(
                bucket_at,
                &BucketRecord {
                    element_size: 1,
                    element_count: len,
                    data,
                    next: root.head,
                },
            )?;
            tx.write_obj(root_at, &BucketListRoot { head: bucket_at, ..root })?;
            Ok(data)
        });

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(pool = %self.store.path().display(), nbytes, error = %e, "transaction aborted");
                self.stats.on_failure();
                return Err(e.into());
            }
        };

        let ptr = self.store.ptr_at(data)?;
        self.stats.on_alloc(nbytes);
        tracing::debug!(pool = %self.store.path().display(), offset = data, nbytes, "allocated bucket");
        Ok(LocalExtent::new(ptr, data as usize, nbytes))
    }

    /// Iterates the bucket list, newest first.
    pub fn buckets(&self) -> Buckets<'_> {
        let header = self.store.header();
        let head = self
            .store
            .read::<BucketListRoot>(header.root_offset)
            .map_or(NULL_REF, |root| root.head);
        Buckets {
            store: &self.store,
            next: head,
            budget: header.heap_top.saturating_sub(header.heap_start) / BUCKET_SIZE as u64,
        }
    }

    /// Data of a bucket.
    ///
    /// # Errors
    /// [`AllocError::Corrupt`] if the bucket's data lies outside the heap.
    pub fn bucket_data(&self, bucket: &BucketInfo) -> Result<&[u8]> {
        self.check_heap_range(bucket.data_offset, bucket.len())?;
        Ok(self.store.bytes(bucket.data_offset, bucket.len())?)
    }

    /// Mutable view of an extent returned by this pool.
    ///
    /// Writes through it are not transactional; call
    /// [`PersistentPool::persist`] to make them durable.
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the extent is not inside the heap.
    pub fn data_mut(&mut self, extent: &LocalExtent) -> Result<&mut [u8]> {
        let (offset, len) = (extent.offset() as u64, extent.len() as u64);
        self.check_heap_range(offset, len)
            .map_err(|_| AllocError::invalid("extent does not belong to this pool"))?;
        Ok(self.store.bytes_mut(offset, len)?)
    }

    /// Flushes an extent to stable storage.
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the extent is not inside the heap;
    /// [`AllocError::Store`] if the flush fails.
    pub fn persist(&self, extent: &LocalExtent) -> Result<()> {
        let (offset, len) = (extent.offset() as u64, extent.len() as u64);
        self.check_heap_range(offset, len)
            .map_err(|_| AllocError::invalid("extent does not belong to this pool"))?;
        Ok(self.store.persist(offset, len)?)
    }

    fn check_heap_range(&self, offset: u64, len: u64) -> Result<()> {
        let header = self.store.header();
        let inside = offset >= header.heap_start && offset.checked_add(len).is_some_and(|end| end <= header.heap_top);
        if inside {
            Ok(())
        } else {
            Err(AllocError::Corrupt {
                path: self.store.path().to_path_buf(),
                reason: format!("range at {offset} of {len} bytes is outside the heap"),
            })
        }
    }

    /// Name stored in the pool root.
    ///
    /// # Errors
    /// [`AllocError::Corrupt`] if the root cannot be read or is not UTF-8.
    pub fn name(&self) -> Result<String> {
        let root: BucketListRoot = self.store.read(self.store.root_offset())?;
        decode_name(&root.name).map(str::to_owned).ok_or_else(|| AllocError::Corrupt {
            path: self.store.path().to_path_buf(),
            reason: "root name is not UTF-8".to_owned(),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Layout tag the pool was opened with.
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Size of the pool file in bytes.
    pub fn size(&self) -> u64 {
        self.store.len()
    }

    /// Heap bytes not yet handed out.
    pub fn remaining(&self) -> u64 {
        let header = self.store.header();
        header.pool_size.saturating_sub(header.heap_top)
    }

    /// Team the pool was opened for.
    pub fn team_id(&self) -> TeamId {
        self.team
    }

    /// Allocation counters since this handle was opened.
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Flushes and releases the pool. Persisted data stays in the file.
    ///
    /// # Errors
    /// [`AllocError::Store`] if the final flush fails.
    pub fn close(self) -> Result<()> {
        let path: PathBuf = self.store.path().to_path_buf();
        self.store.close()?;
        tracing::debug!(pool = %path.display(), "closed persistent pool");
        Ok(())
    }
}

impl TeamAlloc for PersistentPool {
    fn alloc_local(&mut self, team: &dyn Team, nbytes: usize) -> Result<LocalExtent> {
        PersistentPool::alloc_local(self, team, nbytes)
    }
}

impl fmt::Debug for PersistentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentPool")
            .field("path", &self.store.path())
            .field("layout", &self.layout)
            .field("team", &self.team)
            .field("size", &self.store.len())
            .finish_non_exhaustive()
    }
}

/// `true` if `path` names a non-empty file. An empty file holds no pool.
fn holds_data(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.len() > 0)
}

/// Writes an empty root and marks the pool valid, all in one transaction.
fn init_root(store: &mut ObjStore, tag: [u8; POOL_NAME_MAX]) -> Result<()> {
    store
        .transaction(|tx| {
            let at = tx.alloc_zeroed(ROOT_SIZE as u64)?;
            tx.write_obj(at, &BucketListRoot { name: tag, head: NULL_REF })?;
            tx.update_header(|h| {
                h.root_offset = at;
                h.root_size = ROOT_SIZE as u64;
                h.state = PoolState::Rooted as u32;
            })
        })
        .map_err(|e: StoreError| {
            tracing::error!(pool = %store.path().display(), error = %e, "transaction aborted while initializing root");
            e.into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::team::{LocalTeam, UnitId};
    use tempfile::tempdir;

    fn config(dir: &Path) -> PoolConfig {
        PoolConfig::default().with_directory(dir).with_sync(false)
    }

    #[test]
    fn open_flags_reject_unknown_bits() {
        assert!(OpenFlags::CREATE.is_supported());
        assert!(OpenFlags::empty().is_supported());
        assert!(!OpenFlags::from_bits_retain(0x2).is_supported());
        assert!((OpenFlags::CREATE | OpenFlags::from_bits_retain(0x1)).contains(OpenFlags::CREATE));
    }

    #[test]
    fn new_pool_has_an_empty_named_root() {
        let dir = tempdir().unwrap();
        let team = LocalTeam::new(TeamId::ALL, UnitId(3));
        let pool = PersistentPool::open_with(&team, "grid", OpenFlags::CREATE, 0o600, &config(dir.path())).unwrap();

        assert_eq!(pool.path(), dir.path().join("grid.3"));
        assert_eq!(pool.name().unwrap(), "grid");
        assert_eq!(pool.buckets().count(), 0);
        pool.close().unwrap();
    }

    #[test]
    fn interrupted_creation_is_resumed_only_with_create() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let team = LocalTeam::new(TeamId::ALL, UnitId(0));
        // A file laid out but never rooted, as left by a crash during creation.
        ObjStore::create(&dir.path().join("half.0"), "half", &config, 0o600)
            .unwrap()
            .close()
            .unwrap();

        let err = PersistentPool::open_with(&team, "half", OpenFlags::empty(), 0o600, &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let pool = PersistentPool::open_with(&team, "half", OpenFlags::CREATE, 0o600, &config).unwrap();
        assert_eq!(pool.name().unwrap(), "half");
    }

    #[test]
    fn empty_file_is_created_over_only_with_create() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let team = LocalTeam::new(TeamId::ALL, UnitId(0));
        std::fs::File::create(dir.path().join("p.0")).unwrap();

        let err = PersistentPool::open_with(&team, "p", OpenFlags::empty(), 0o600, &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let mut pool = PersistentPool::open_with(&team, "p", OpenFlags::CREATE, 0o600, &config).unwrap();
        assert_eq!(pool.name().unwrap(), "p");
        assert_eq!(pool.buckets().count(), 0);
        pool.alloc_local(&team, 16).unwrap();
        pool.close().unwrap();

        let pool = PersistentPool::open_with(&team, "p", OpenFlags::empty(), 0o600, &config).unwrap();
        assert_eq!(pool.buckets().count(), 1);
    }

    #[test]
    fn failed_allocation_counts_and_leaves_pool_unchanged() {
        let dir = tempdir().unwrap();
        let team = LocalTeam::new(TeamId::ALL, UnitId(0));
        let mut pool = PersistentPool::open_with(&team, "big", OpenFlags::CREATE, 0o600, &config(dir.path())).unwrap();
        let remaining = pool.remaining();

        let err = pool.alloc_local(&team, usize::MAX / 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(pool.remaining(), remaining);
        assert_eq!(pool.buckets().count(), 0);
        assert_eq!(pool.stats().failed_count, 1);
    }

    #[test]
    fn foreign_extents_are_rejected() {
        let dir = tempdir().unwrap();
        let team = LocalTeam::new(TeamId::ALL, UnitId(0));
        let mut pool = PersistentPool::open_with(&team, "x", OpenFlags::CREATE, 0o600, &config(dir.path())).unwrap();
        let extent = pool.alloc_local(&team, 8).unwrap();
        let bogus = LocalExtent::new(extent.ptr(), 16, 8);

        assert_eq!(pool.data_mut(&bogus).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(pool.persist(&bogus).unwrap_err().kind(), ErrorKind::InvalidArgument);
        pool.data_mut(&extent).unwrap().copy_from_slice(b"01234567");
        pool.persist(&extent).unwrap();
    }
}
