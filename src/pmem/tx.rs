//! Scoped undo-log transactions.

use crate::alloc::page::{align_up_u64, WORD_SIZE};
use crate::pmem::layout::{PoolHeader, HEADER_SIZE};
use crate::pmem::store::{ObjStore, StoreError};
use std::ops::Range;
use zerocopy::AsBytes;

/// An all-or-nothing group of writes to an [`ObjStore`].
///
/// Either [`Transaction::commit`] succeeds and every write is durable, or
/// the transaction is dropped (explicitly, by `?`, or by a failed commit)
/// and every write is undone.
pub(crate) struct Transaction<'a> {
    store: &'a mut ObjStore,
    fresh: Option<Range<u64>>,
    header_logged: bool,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a mut ObjStore) -> Self {
        Self {
            store,
            fresh: None,
            header_logged: false,
            finished: false,
        }
    }

    fn is_fresh(&self, offset: u64, len: u64) -> bool {
        self.fresh
            .as_ref()
            .is_some_and(|fresh| offset >= fresh.start && offset.saturating_add(len) <= fresh.end)
    }

    /// Read access to the store inside the transaction.
    pub(crate) fn store(&self) -> &ObjStore {
        &*self.store
    }

    /// Bump-allocates `len` zeroed bytes from the heap.
    pub(crate) fn alloc_zeroed(&mut self, len: u64) -> Result<u64, StoreError> {
        let header = self.store.header();
        let available = header.pool_size.saturating_sub(header.heap_top);
        let size = align_up_u64(len.max(1), WORD_SIZE as u64)
            .filter(|&size| size <= available)
            .ok_or(StoreError::OutOfSpace {
                requested: len,
                available,
            })?;

        let offset = header.heap_top;
        let end = offset + size;
        self.update_header(|h| h.heap_top = end)?;
        self.store.bytes_mut(offset, size)?.fill(0);
        self.fresh = Some(match self.fresh.take() {
            Some(fresh) => fresh.start..end,
            None => offset..end,
        });
        Ok(offset)
    }

    /// Writes `bytes` at `offset`, saving the old contents first unless they
    /// were allocated by this transaction.
    pub(crate) fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let len = bytes.len() as u64;
        if !self.is_fresh(offset, len) {
            self.store.log_append(offset, len)?;
        }
        self.store.bytes_mut(offset, len)?.copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn write_obj<T: AsBytes>(&mut self, offset: u64, obj: &T) -> Result<(), StoreError> {
        self.write(offset, obj.as_bytes())
    }

    /// Applies `f` to the pool header. The prior header is logged once.
    pub(crate) fn update_header<F>(&mut self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PoolHeader),
    {
        if !self.header_logged {
            self.store.log_append(0, HEADER_SIZE as u64)?;
            self.header_logged = true;
        }
        let mut header = self.store.header();
        f(&mut header);
        self.store.write_header(&header);
        Ok(())
    }

    /// Makes every write durable.
    pub(crate) fn commit(mut self) -> Result<(), StoreError> {
        self.store.flush_data()?;
        self.store.log_clear()?;
        self.finished = true;
        Ok(())
    }

    /// Undoes every write now and reports how many images were restored.
    pub(crate) fn abort(mut self) -> Result<usize, StoreError> {
        self.finished = true;
        self.store.rollback()
    }
}

impl ObjStore {
    /// Runs `f` inside a transaction: commits if it returns `Ok`, rolls back
    /// and returns its error otherwise.
    pub(crate) fn transaction<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.abort() {
                    tracing::error!(error = %rollback, "rollback after failed transaction failed");
                }
                Err(e)
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.store.rollback() {
            Ok(entries) => {
                tracing::debug!(pool = %self.store.path().display(), entries, "transaction rolled back");
            }
            Err(e) => {
                tracing::error!(pool = %self.store.path().display(), error = %e, "rollback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use tempfile::tempdir;

    #[test]
    fn writes_to_fresh_space_are_not_logged() {
        let dir = tempdir().unwrap();
        let mut store = ObjStore::create(&dir.path().join("p.0"), "t", &PoolConfig::default(), 0o600).unwrap();

        let mut tx = store.begin();
        let at = tx.alloc_zeroed(16).unwrap();
        assert!(tx.is_fresh(at, 16));
        assert!(!tx.is_fresh(at, 17));
        tx.write(at, &[1u8; 16]).unwrap();
        assert_eq!(tx.store().read::<[u8; 16]>(at).unwrap(), [1u8; 16]);
        tx.commit().unwrap();
    }

    #[test]
    fn explicit_abort_restores_header() {
        let dir = tempdir().unwrap();
        let mut store = ObjStore::create(&dir.path().join("p.0"), "t", &PoolConfig::default(), 0o600).unwrap();
        let before = store.header().heap_top;

        let mut tx = store.begin();
        tx.alloc_zeroed(100).unwrap();
        assert_eq!(tx.abort().unwrap(), 1);
        assert_eq!(store.header().heap_top, before);
    }

    #[test]
    fn scoped_transaction_commits_or_rolls_back() {
        let dir = tempdir().unwrap();
        let mut store = ObjStore::create(&dir.path().join("p.0"), "t", &PoolConfig::default(), 0o600).unwrap();
        let before = store.header().heap_top;

        let err = store
            .transaction(|tx| {
                tx.alloc_zeroed(64)?;
                tx.alloc_zeroed(u64::MAX)
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfSpace { .. }));
        assert_eq!(store.header().heap_top, before);

        let at = store.transaction(|tx| tx.alloc_zeroed(64)).unwrap();
        assert_eq!(at, before);
        assert_eq!(store.header().heap_top, before + 64);
    }

    #[test]
    fn full_log_fails_the_write() {
        let dir = tempdir().unwrap();
        let config = PoolConfig::default().with_log_capacity(0);
        let mut store = ObjStore::create(&dir.path().join("p.0"), "t", &config, 0o600).unwrap();

        let mut tx = store.begin();
        let big = vec![0u8; 8192];
        let heap_start = tx.store().header().heap_start;
        let err = tx.write(heap_start, &big).unwrap_err();
        assert!(matches!(err, StoreError::LogFull { .. }));
    }
}
