//! Backing hashed key-value store
//!
//! The B+ tree engine only talks to its storage through the narrow [`Store`]
//! trait: opaque byte keys mapped to opaque byte values, a small flag word,
//! and a handful of maintenance hooks. [`HashStore`] is the single-file
//! implementation shipped with the crate.

mod error;
mod hash_store;
mod lock;

pub use error::{StoreError, StoreResult};
pub use hash_store::HashStore;

use std::ops::BitOr;

/// Open mode bits for a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READER: OpenMode = OpenMode(1 << 0);
    pub const WRITER: OpenMode = OpenMode(1 << 1);
    /// Create the file when it does not exist (writer only)
    pub const CREATE: OpenMode = OpenMode(1 << 2);
    /// Discard existing content (writer only)
    pub const TRUNCATE: OpenMode = OpenMode(1 << 3);
    /// Skip advisory file locking
    pub const NO_LOCK: OpenMode = OpenMode(1 << 4);
    /// Fail instead of waiting when the lock is held elsewhere
    pub const LOCK_NONBLOCKING: OpenMode = OpenMode(1 << 5);

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_writer(self) -> bool {
        self.contains(OpenMode::WRITER)
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// Storage contract consumed by the B+ tree engine
pub trait Store {
    /// Path the store was opened from
    fn name(&self) -> &str;

    fn is_writable(&self) -> bool;

    /// User flag word persisted in the file header
    fn flags(&self) -> u32;

    fn set_flags(&mut self, flags: u32) -> StoreResult<()>;

    fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Store a value. Returns `false` without writing when the key exists
    /// and `overwrite` is off.
    fn put(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> StoreResult<bool>;

    /// Remove a key, returning whether it was present
    fn delete(&mut self, key: &[u8]) -> StoreResult<bool>;

    /// Number of live records
    fn record_count(&self) -> usize;

    /// Snapshot of every live key, in file order
    fn iter_keys(&self) -> Vec<Vec<u8>>;

    /// Flush and force everything to the device
    fn sync(&mut self) -> StoreResult<()>;

    /// Flush in-process state to the file without forcing the device
    fn memory_sync(&mut self) -> StoreResult<()>;

    /// Padding policy for subsequently written records.
    ///
    /// Positive values round each record up to a multiple of the value;
    /// negative values pad each value by `len >> -align`; zero disables
    /// padding.
    fn set_alignment(&mut self, align: i32) -> StoreResult<()>;

    /// Reclaim space held by dead records
    fn optimize(&mut self) -> StoreResult<()>;

    /// Whether a write failure has left the store unreliable
    fn fatal_error(&self) -> bool;

    fn file_size(&self) -> u64;

    fn inode(&self) -> u64;

    /// Last modification time, in seconds since the Unix epoch
    fn mtime(&self) -> i64;

    /// Flush and release the file
    fn close(&mut self) -> StoreResult<()>;
}
