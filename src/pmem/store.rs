//! Memory-mapped transactional object store.
//!
//! One [`ObjStore`] owns one pool file: it holds an exclusive `flock` on it
//! and maps the whole file read-write. Objects are bump-allocated from the
//! heap region and referenced by file offset.
//!
//! # Durability
//!
//! All mutations of bytes that existed before a transaction started go
//! through the undo log (see [`Transaction`]). Before such a write, the old
//! bytes are copied into the log and the log header is flushed, so after a
//! crash [`ObjStore::open`] can restore every touched range. Commit flushes
//! the data and then truncates the log in a single header write.
//!
//! Bytes allocated by the running transaction are never logged: rolling
//! back the header snapshot restores the old heap top, which makes them
//! unreachable again.

use crate::alloc::page::{align_up_u64, PAGE_SIZE, WORD_SIZE};
use crate::config::PoolConfig;
use crate::pmem::layout::{
    decode_name, encode_name, LogEntry, LogHeader, PoolHeader, PoolState, HEADER_RESERVED, HEADER_SIZE,
    LOG_ENTRY_SIZE, LOG_HEADER_SIZE, POOL_MAGIC, POOL_VERSION,
};
use crate::pmem::tx::Transaction;
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Errors raised by the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The file could not be created, opened, sized, mapped or flushed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Pool file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// No pool file exists at `path`.
    #[error("no pool file at {path}")]
    NotFound {
        /// Pool file.
        path: PathBuf,
    },

    /// Another handle holds the pool file.
    #[error("pool {path} is already open: {source}")]
    Locked {
        /// Pool file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The heap cannot fit the request.
    #[error("out of pool space: requested {requested} bytes, {available} available")]
    OutOfSpace {
        /// Requested bytes.
        requested: u64,
        /// Free heap bytes.
        available: u64,
    },

    /// The undo log cannot record another image in this transaction.
    #[error("undo log full: need {needed} bytes, {available} available")]
    LogFull {
        /// Bytes the entry needs.
        needed: u64,
        /// Bytes left in the log.
        available: u64,
    },

    /// The layout tag is unusable.
    #[error("invalid layout name {0:?}")]
    BadLayout(String),

    /// The file was created for a different layout.
    #[error("layout mismatch: expected {expected:?}, found {found:?}")]
    LayoutMismatch {
        /// Requested layout.
        expected: String,
        /// Layout recorded in the file.
        found: String,
    },

    /// The file is not a pool or its metadata is inconsistent.
    #[error("corrupt pool {path}: {reason}")]
    Corrupt {
        /// Pool file.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },

    /// An object reference points outside the pool.
    #[error("range {offset}+{len} lies outside the pool ({size} bytes)")]
    OutOfBounds {
        /// Start of the range.
        offset: u64,
        /// Length of the range.
        len: u64,
        /// Pool size.
        size: u64,
    },
}

/// `<dir>/.<name>.creating` for a pool at `<dir>/<name>`.
fn staging_path(path: &Path) -> PathBuf {
    let name = path.file_name().map_or_else(|| "pool".into(), |n| n.to_string_lossy());
    path.with_file_name(format!(".{name}.creating"))
}

/// Makes a rename into `path`'s directory durable.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<(), StoreError> {
    let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return Ok(());
    };
    File::open(dir)
        .and_then(|dir| dir.sync_all())
        .map_err(io_err(dir))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// An open pool file.
#[derive(Debug)]
pub(crate) struct ObjStore {
    path: PathBuf,
    file: File,
    map: MmapMut,
    sync: bool,
}

impl ObjStore {
    /// Creates a new pool file at `path`.
    ///
    /// The header is written with state [`PoolState::Created`] and no root.
    /// The file is laid out under a staging name in the same directory and
    /// renamed to `path` only once the header is on stable storage, so
    /// `path` never names a pool without a header. An empty file at `path`
    /// holds no pool and is replaced; any other existing file is an error.
    pub(crate) fn create(path: &Path, layout: &str, config: &PoolConfig, mode: u32) -> Result<Self, StoreError> {
        let tag = encode_name(layout).ok_or_else(|| StoreError::BadLayout(layout.to_owned()))?;
        let pool_size = config.effective_pool_size();
        let log_capacity = align_up_u64(config.effective_log_capacity(), WORD_SIZE as u64).unwrap_or(u64::MAX);
        let heap_start = HEADER_RESERVED
            .checked_add(log_capacity)
            .and_then(|end| align_up_u64(end, PAGE_SIZE as u64))
            .filter(|&start| start < pool_size)
            .ok_or(StoreError::OutOfSpace {
                requested: log_capacity,
                available: pool_size,
            })?;

        if fs::metadata(path).is_ok_and(|meta| meta.len() > 0) {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::AlreadyExists),
            });
        }

        let staging = staging_path(path);
        // Left behind by a creation that crashed before the rename.
        match fs::remove_file(&staging) {
            Ok(()) => tracing::warn!(pool = %path.display(), "removed stale staging file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&staging)(e)),
        }

        let header = PoolHeader {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            state: PoolState::Created as u32,
            layout: tag,
            pool_size,
            root_offset: 0,
            root_size: 0,
            heap_start,
            heap_top: heap_start,
            log_offset: HEADER_RESERVED,
            log_capacity,
        };
        let mut store = Self::lay_out(&staging, &header, mode, config.sync_on_commit)
            .and_then(|store| {
                fs::rename(&staging, path).map_err(io_err(path))?;
                sync_parent(path)?;
                Ok(store)
            })
            .map_err(|e| {
                let _ = fs::remove_file(&staging);
                e
            })?;
        store.path = path.to_path_buf();

        tracing::debug!(pool = %path.display(), size = pool_size, layout, "created pool file");
        Ok(store)
    }

    /// Creates `staging`, sizes it, writes `header` and syncs it.
    fn lay_out(staging: &Path, header: &PoolHeader, mode: u32, sync: bool) -> Result<Self, StoreError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = options.open(staging).map_err(io_err(staging))?;
        file.try_lock_exclusive().map_err(|source| StoreError::Locked {
            path: staging.to_path_buf(),
            source,
        })?;
        file.set_len(header.pool_size).map_err(io_err(staging))?;

        let mut store = Self::map_file(staging, file, header.pool_size, sync)?;
        store.write_header(header);
        store.flush()?;
        store.file.sync_all().map_err(io_err(staging))?;
        Ok(store)
    }

    /// Opens an existing pool file, rolling back any interrupted transaction.
    pub(crate) fn open(path: &Path, layout: &str, sync: bool) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound {
                    path: path.to_path_buf(),
                },
                _ => io_err(path)(source),
            })?;
        file.try_lock_exclusive().map_err(|source| StoreError::Locked {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file.metadata().map_err(io_err(path))?.len();
        if len < HEADER_RESERVED {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("file of {len} bytes is too small to be a pool"),
            });
        }

        let mut store = Self::map_file(path, file, len, sync)?;
        store.check_identity()?;

        let recovered = store.rollback()?;
        if recovered > 0 {
            tracing::warn!(
                pool = %path.display(),
                entries = recovered,
                "rolled back interrupted transaction"
            );
        }

        store.check_heap()?;
        let header = store.header();
        let found = decode_name(&header.layout).unwrap_or_default();
        if found != layout {
            return Err(StoreError::LayoutMismatch {
                expected: layout.to_owned(),
                found: found.to_owned(),
            });
        }

        tracing::debug!(pool = %path.display(), size = len, "opened pool file");
        Ok(store)
    }

    fn map_file(path: &Path, file: File, len: u64, sync: bool) -> Result<Self, StoreError> {
        let len = usize::try_from(len).map_err(|_| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("pool of {len} bytes cannot be mapped"),
        })?;
        // SAFETY: the file is exclusively locked by this handle for as long
        // as the mapping lives.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(io_err(path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            sync,
        })
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Magic, version and log placement: what recovery relies on.
    fn check_identity(&self) -> Result<(), StoreError> {
        let h = self.header();
        if h.magic != POOL_MAGIC {
            return Err(self.corrupt("bad magic, not a pool file"));
        }
        if h.version != POOL_VERSION {
            return Err(self.corrupt(format!("unsupported version {}", h.version)));
        }
        let log_end = h.log_offset.checked_add(h.log_capacity);
        if h.log_offset < HEADER_RESERVED
            || h.log_capacity < LOG_HEADER_SIZE as u64
            || log_end.map_or(true, |end| end > self.len())
        {
            return Err(self.corrupt("undo log outside the file"));
        }
        Ok(())
    }

    /// Heap bounds, state and root placement.
    fn check_heap(&self) -> Result<(), StoreError> {
        let h = self.header();
        if h.pool_size > self.len() {
            return Err(self.corrupt(format!("header claims {} bytes, file has {}", h.pool_size, self.len())));
        }
        if h.heap_start < h.log_offset + h.log_capacity || h.heap_start > h.heap_top || h.heap_top > h.pool_size {
            return Err(self.corrupt("heap bounds are inconsistent"));
        }
        if PoolState::from_raw(h.state).is_none() {
            return Err(self.corrupt(format!("unknown pool state {}", h.state)));
        }
        if h.root_size > 0 {
            let end = h.root_offset.checked_add(h.root_size);
            if h.root_offset < h.heap_start || end.map_or(true, |end| end > h.heap_top) {
                return Err(self.corrupt("root object outside the heap"));
            }
        }
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Mapped length in bytes.
    pub(crate) fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub(crate) fn header(&self) -> PoolHeader {
        PoolHeader::read_from_prefix(&self.map[..]).unwrap_or_else(PoolHeader::new_zeroed)
    }

    pub(crate) fn write_header(&mut self, header: &PoolHeader) {
        self.map[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    pub(crate) fn state(&self) -> Option<PoolState> {
        PoolState::from_raw(self.header().state)
    }

    pub(crate) fn root_size(&self) -> u64 {
        self.header().root_size
    }

    pub(crate) fn root_offset(&self) -> u64 {
        self.header().root_offset
    }

    fn range(&self, offset: u64, len: u64) -> Result<Range<usize>, StoreError> {
        let size = self.len();
        let out_of_bounds = StoreError::OutOfBounds { offset, len, size };
        let end = offset.checked_add(len).filter(|&end| end <= size).ok_or(out_of_bounds)?;
        // Both fit in usize because the mapping does.
        Ok(offset as usize..end as usize)
    }

    pub(crate) fn bytes(&self, offset: u64, len: u64) -> Result<&[u8], StoreError> {
        let range = self.range(offset, len)?;
        Ok(&self.map[range])
    }

    pub(crate) fn bytes_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8], StoreError> {
        let range = self.range(offset, len)?;
        Ok(&mut self.map[range])
    }

    /// Copies a `T` out of the pool at `offset`.
    pub(crate) fn read<T: FromBytes>(&self, offset: u64) -> Result<T, StoreError> {
        let len = core::mem::size_of::<T>() as u64;
        let bytes = self.bytes(offset, len)?;
        T::read_from(bytes).ok_or(StoreError::OutOfBounds {
            offset,
            len,
            size: self.len(),
        })
    }

    /// Direct address of `offset` in the mapping.
    pub(crate) fn ptr_at(&mut self, offset: u64) -> Result<core::ptr::NonNull<u8>, StoreError> {
        let range = self.range(offset, 0)?;
        // SAFETY: range.start <= map.len(), so the pointer is in bounds or one past the end.
        let ptr = unsafe { self.map.as_mut_ptr().add(range.start) };
        core::ptr::NonNull::new(ptr).ok_or_else(|| self.corrupt("mapping has a null base"))
    }

    /// Starts a transaction. Dropping it without committing rolls back.
    pub(crate) fn begin(&mut self) -> Transaction<'_> {
        Transaction::new(self)
    }

    fn log_header(&self) -> Result<LogHeader, StoreError> {
        self.read(self.header().log_offset)
    }

    /// Saves the current contents of `[offset, offset + len)` in the undo log.
    pub(crate) fn log_append(&mut self, offset: u64, len: u64) -> Result<(), StoreError> {
        let header = self.header();
        let log = self.log_header()?;
        let source = self.range(offset, len)?;

        let image = align_up_u64(len, WORD_SIZE as u64).unwrap_or(u64::MAX);
        let needed = (LOG_ENTRY_SIZE as u64).saturating_add(image);
        let available = header
            .log_capacity
            .saturating_sub(LOG_HEADER_SIZE as u64)
            .saturating_sub(log.used);
        if needed > available {
            return Err(StoreError::LogFull { needed, available });
        }

        let entry_at = header.log_offset + LOG_HEADER_SIZE as u64 + log.used;
        let entry = LogEntry { offset, len };
        self.bytes_mut(entry_at, LOG_ENTRY_SIZE as u64)?
            .copy_from_slice(entry.as_bytes());
        let image_at = self.range(entry_at + LOG_ENTRY_SIZE as u64, len)?;
        self.map.copy_within(source, image_at.start);
        self.flush_range(entry_at, needed)?;

        let log = LogHeader {
            count: log.count + 1,
            used: log.used + needed,
        };
        self.set_log_header(&log)
    }

    fn set_log_header(&mut self, log: &LogHeader) -> Result<(), StoreError> {
        let at = self.header().log_offset;
        self.bytes_mut(at, LOG_HEADER_SIZE as u64)?
            .copy_from_slice(log.as_bytes());
        self.flush_range(at, LOG_HEADER_SIZE as u64)
    }

    /// Drops every undo entry: the running transaction becomes durable.
    pub(crate) fn log_clear(&mut self) -> Result<(), StoreError> {
        self.set_log_header(&LogHeader { count: 0, used: 0 })
    }

    /// Restores every range saved in the undo log, newest first, then clears
    /// the log. Returns the number of entries applied.
    pub(crate) fn rollback(&mut self) -> Result<usize, StoreError> {
        let header = self.header();
        let log = self.log_header()?;
        if log.count == 0 {
            return Ok(0);
        }

        let log_end = header.log_offset + header.log_capacity;
        let mut at = header.log_offset + LOG_HEADER_SIZE as u64;
        let mut entries = Vec::new();
        for _ in 0..log.count {
            let entry: LogEntry = self.read(at)?;
            let image_at = at + LOG_ENTRY_SIZE as u64;
            let next = align_up_u64(entry.len, WORD_SIZE as u64).and_then(|image| image_at.checked_add(image));
            match next {
                Some(next) if next <= log_end => {
                    self.range(entry.offset, entry.len)?;
                    entries.push((entry, image_at));
                    at = next;
                }
                _ => return Err(self.corrupt("undo log entry runs past the log")),
            }
        }

        for (entry, image_at) in entries.iter().rev() {
            let image = self.range(*image_at, entry.len)?;
            self.map.copy_within(image, entry.offset as usize);
        }
        self.flush()?;
        self.log_clear()?;
        Ok(entries.len())
    }

    pub(crate) fn flush_range(&self, offset: u64, len: u64) -> Result<(), StoreError> {
        if !self.sync {
            return Ok(());
        }
        self.persist(offset, len)
    }

    /// Flushes `[offset, offset + len)` to stable storage regardless of the
    /// sync setting.
    pub(crate) fn persist(&self, offset: u64, len: u64) -> Result<(), StoreError> {
        let range = self.range(offset, len)?;
        self.map
            .flush_range(range.start, range.len())
            .map_err(io_err(&self.path))
    }

    /// Flushes the whole mapping when syncing is enabled.
    pub(crate) fn flush_data(&self) -> Result<(), StoreError> {
        if self.sync {
            self.flush()?;
        }
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<(), StoreError> {
        self.map.flush().map_err(io_err(&self.path))
    }

    /// Flushes, unlocks and unmaps. On-disk contents stay as they are.
    pub(crate) fn close(self) -> Result<(), StoreError> {
        self.flush()?;
        FileExt::unlock(&self.file).map_err(io_err(&self.path))?;
        tracing::debug!(pool = %self.path.display(), "closed pool file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::layout::{BucketRecord, BUCKET_SIZE};
    use tempfile::tempdir;

    fn config() -> PoolConfig {
        PoolConfig::default().with_sync(false)
    }

    #[test]
    fn create_then_open_keeps_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");

        let store = ObjStore::create(&path, "layout", &config(), 0o600).unwrap();
        assert_eq!(store.state(), Some(PoolState::Created));
        assert_eq!(store.root_size(), 0);
        store.close().unwrap();

        let store = ObjStore::open(&path, "layout", false).unwrap();
        assert_eq!(store.len(), crate::config::MIN_POOL_SIZE);

        drop(store);
        let err = ObjStore::open(&path, "other", false).unwrap_err();
        assert!(matches!(err, StoreError::LayoutMismatch { .. }));
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");
        std::fs::write(&path, b"occupied").unwrap();
        assert!(matches!(
            ObjStore::create(&path, "layout", &config(), 0o600),
            Err(StoreError::Io { .. })
        ));
    }

    #[test]
    fn create_publishes_only_complete_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");
        let staging = staging_path(&path);
        // A crash mid-creation leaves the staging file and an empty target.
        std::fs::write(&staging, b"partial").unwrap();
        std::fs::File::create(&path).unwrap();

        let store = ObjStore::create(&path, "layout", &config(), 0o600).unwrap();
        assert_eq!(store.path(), path);
        assert_eq!(store.state(), Some(PoolState::Created));
        assert!(!staging.exists());
        store.close().unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("pool.0")]);
        assert!(ObjStore::open(&path, "layout", false).is_ok());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ObjStore::open(&dir.path().join("absent.0"), "layout", false),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn foreign_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign.0");
        std::fs::write(&path, vec![0xAB; HEADER_RESERVED as usize * 2]).unwrap();
        assert!(matches!(
            ObjStore::open(&path, "layout", false),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn second_handle_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");
        let _store = ObjStore::create(&path, "layout", &config(), 0o600).unwrap();
        assert!(matches!(
            ObjStore::open(&path, "layout", false),
            Err(StoreError::Locked { .. })
        ));
    }

    #[test]
    fn committed_writes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");
        let mut store = ObjStore::create(&path, "layout", &config(), 0o600).unwrap();

        let mut tx = store.begin();
        let at = tx.alloc_zeroed(BUCKET_SIZE as u64).unwrap();
        let record = BucketRecord {
            element_size: 1,
            element_count: 9,
            data: 0,
            next: 0,
        };
        tx.write_obj(at, &record).unwrap();
        tx.commit().unwrap();
        store.close().unwrap();

        let store = ObjStore::open(&path, "layout", false).unwrap();
        let back: BucketRecord = store.read(at).unwrap();
        assert_eq!(back.element_count, 9);
        assert_eq!(store.header().heap_top, at + BUCKET_SIZE as u64);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");
        let mut store = ObjStore::create(&path, "layout", &config(), 0o600).unwrap();
        let top = store.header().heap_top;

        {
            let mut tx = store.begin();
            tx.alloc_zeroed(128).unwrap();
            tx.update_header(|h| h.root_size = 99).unwrap();
        }

        let header = store.header();
        assert_eq!(header.heap_top, top);
        assert_eq!(header.root_size, 0);
        assert_eq!(store.log_header().unwrap().count, 0);
    }

    #[test]
    fn interrupted_transaction_is_undone_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");
        let mut store = ObjStore::create(&path, "layout", &config(), 0o600).unwrap();

        let mut tx = store.begin();
        let at = tx.alloc_zeroed(8).unwrap();
        tx.write(at, &7u64.to_ne_bytes()).unwrap();
        tx.commit().unwrap();
        let top = store.header().heap_top;

        // Simulate process death mid-transaction: no commit, no rollback.
        let mut tx = store.begin();
        tx.write(at, &42u64.to_ne_bytes()).unwrap();
        tx.alloc_zeroed(64).unwrap();
        std::mem::forget(tx);
        assert_eq!(store.read::<u64>(at).unwrap(), 42);
        drop(store);

        let store = ObjStore::open(&path, "layout", false).unwrap();
        assert_eq!(store.read::<u64>(at).unwrap(), 7);
        assert_eq!(store.header().heap_top, top);
        assert_eq!(store.log_header().unwrap().count, 0);
    }

    #[test]
    fn allocation_past_the_heap_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.0");
        let mut store = ObjStore::create(&path, "layout", &config(), 0o600).unwrap();

        let mut tx = store.begin();
        let err = tx.alloc_zeroed(crate::config::MIN_POOL_SIZE).unwrap_err();
        assert!(matches!(err, StoreError::OutOfSpace { .. }));
    }
}
