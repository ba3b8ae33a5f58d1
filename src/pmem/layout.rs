//! On-disk structures of a pool file.
//!
//! ```text
//! 0                4096                4096 + log_capacity        pool_size
//! +----------------+-------------------+---------------------------+
//! | PoolHeader     | Undo log          | Heap (bump allocated)     |
//! | (page padded)  | LogHeader,        | BucketListRoot, Buckets,  |
//! |                | entries + images  | bucket data               |
//! +----------------+-------------------+---------------------------+
//! ```
//!
//! All integers are native-endian `u64`/`u32`; every struct is `repr(C)`
//! without padding so it can be copied in and out of the mapping as bytes.
//! References between objects are pool offsets, with `0` as the null
//! sentinel (offset zero is always the header, never an object).

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// File magic.
pub const POOL_MAGIC: [u8; 8] = *b"PGASPMEM";

/// Format version.
pub const POOL_VERSION: u32 = 1;

/// Bytes reserved for the header at the start of the file.
pub const HEADER_RESERVED: u64 = 4096;

/// Capacity of the layout tag and of a pool name, including the NUL.
pub const POOL_NAME_MAX: usize = 64;

/// The null object reference.
pub const NULL_REF: u64 = 0;

/// Lifecycle marker stored in [`PoolHeader::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PoolState {
    /// File laid out, root not yet committed.
    Created = 1,
    /// Root committed; the pool is valid.
    Rooted = 2,
}

impl PoolState {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(PoolState::Created),
            2 => Some(PoolState::Rooted),
            _ => None,
        }
    }
}

/// Header at offset zero.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct PoolHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub state: u32,
    pub layout: [u8; POOL_NAME_MAX],
    pub pool_size: u64,
    pub root_offset: u64,
    pub root_size: u64,
    pub heap_start: u64,
    pub heap_top: u64,
    pub log_offset: u64,
    pub log_capacity: u64,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<PoolHeader>();

/// Start of the undo log region.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct LogHeader {
    /// Valid entries. Zero means no transaction needs rolling back.
    pub count: u64,
    /// Bytes of entries and images following this header.
    pub used: u64,
}

pub const LOG_HEADER_SIZE: usize = core::mem::size_of::<LogHeader>();

/// One undo record; followed by `len` bytes of old data, padded to 8.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct LogEntry {
    pub offset: u64,
    pub len: u64,
}

pub const LOG_ENTRY_SIZE: usize = core::mem::size_of::<LogEntry>();

/// The pool root: name tag and head of the bucket list.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct BucketListRoot {
    pub name: [u8; POOL_NAME_MAX],
    pub head: u64,
}

pub const ROOT_SIZE: usize = core::mem::size_of::<BucketListRoot>();

/// One persisted allocation unit.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct BucketRecord {
    pub element_size: u64,
    pub element_count: u64,
    pub data: u64,
    pub next: u64,
}

pub const BUCKET_SIZE: usize = core::mem::size_of::<BucketRecord>();

/// Encodes `name` as a NUL-padded tag. `None` if it does not fit.
pub fn encode_name(name: &str) -> Option<[u8; POOL_NAME_MAX]> {
    let bytes = name.as_bytes();
    if bytes.len() >= POOL_NAME_MAX || bytes.contains(&0) {
        return None;
    }
    let mut tag = [0u8; POOL_NAME_MAX];
    tag[..bytes.len()].copy_from_slice(bytes);
    Some(tag)
}

/// Decodes a NUL-padded tag. `None` if it is not valid UTF-8.
pub fn decode_name(tag: &[u8; POOL_NAME_MAX]) -> Option<&str> {
    let end = tag.iter().position(|&b| b == 0).unwrap_or(POOL_NAME_MAX);
    core::str::from_utf8(&tag[..end]).ok()
}

const _: () = {
    assert!(HEADER_SIZE as u64 <= HEADER_RESERVED);
    assert!(HEADER_SIZE % 8 == 0);
    assert!(ROOT_SIZE % 8 == 0);
    assert!(BUCKET_SIZE == 32);
    assert!(LOG_ENTRY_SIZE == 16);
};
