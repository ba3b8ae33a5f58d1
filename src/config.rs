//! Persistent pool configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest pool file the store will create: 8 MiB.
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Default undo-log capacity: 64 KiB.
pub const DEFAULT_LOG_CAPACITY: u64 = 64 * 1024;

/// Smallest undo log that still fits a header snapshot plus a root write.
pub const MIN_LOG_CAPACITY: u64 = 4 * 1024;

/// Settings for opening or creating a persistent pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding the per-rank pool files.
    pub directory: PathBuf,
    /// Size of newly created pool files. Raised to [`MIN_POOL_SIZE`].
    pub pool_size: u64,
    /// Bytes reserved for the undo log of newly created pools.
    pub log_capacity: u64,
    /// Flush the mapping to stable storage at every commit.
    pub sync_on_commit: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            pool_size: MIN_POOL_SIZE,
            log_capacity: DEFAULT_LOG_CAPACITY,
            sync_on_commit: true,
        }
    }
}

impl PoolConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns the parser error for malformed input.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Sets the pool directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Sets the size of newly created pools.
    pub fn with_pool_size(mut self, pool_size: u64) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the undo-log capacity of newly created pools.
    pub fn with_log_capacity(mut self, log_capacity: u64) -> Self {
        self.log_capacity = log_capacity;
        self
    }

    /// Enables or disables flushing at commit.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Pool size actually used on creation.
    pub fn effective_pool_size(&self) -> u64 {
        self.pool_size.max(MIN_POOL_SIZE)
    }

    /// Log capacity actually used on creation.
    pub fn effective_log_capacity(&self) -> u64 {
        self.log_capacity.max(MIN_LOG_CAPACITY)
    }
}
