//! Persistent allocation: per-unit pool files with a transactional bucket
//! list.
//!
//! ```text
//! PersistentPool  (pool.rs)    open / alloc / close, bucket list
//!       |
//! Transaction     (tx.rs)      undo-logged writes, commit / rollback
//!       |
//! ObjStore        (store.rs)   locked, memory-mapped pool file
//!       |
//! layout.rs                    on-disk structs
//! ```

pub(crate) mod layout;
pub mod pool;
pub mod store;
pub(crate) mod tx;

pub use layout::POOL_NAME_MAX;
pub use pool::{BucketInfo, Buckets, OpenFlags, PersistentPool};
pub use store::StoreError;
