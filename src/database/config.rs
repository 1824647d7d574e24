use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Database, DbResult};
use crate::btree::CACHE_OUT;
use crate::compare::Comparator;
use crate::file::{HashStore, OpenMode};

pub const DEFAULT_LEAF_RECORD_MAX: usize = 49;
pub const DEFAULT_NODE_INDEX_MAX: usize = 192;
pub const DEFAULT_LEAF_CACHE_MAX: usize = 1024;
pub const DEFAULT_NODE_CACHE_MAX: usize = 512;

const MIN_LEAF_RECORD_MAX: usize = 3;
const MIN_NODE_INDEX_MAX: usize = 4;
const MIN_CACHE_MAX: usize = CACHE_OUT * 2;

/// Page size and cache limits of a handle
///
/// A field set to 0 means "use the default". Values below the minimum are
/// raised to it by [`Tuning::normalized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Records a leaf may hold before it splits
    pub leaf_record_max: usize,
    /// Separators a node may hold before it splits
    pub node_index_max: usize,
    /// Leaves kept in memory outside a transaction
    pub leaf_cache_max: usize,
    /// Nodes kept in memory outside a transaction
    pub node_cache_max: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            leaf_record_max: DEFAULT_LEAF_RECORD_MAX,
            node_index_max: DEFAULT_NODE_INDEX_MAX,
            leaf_cache_max: DEFAULT_LEAF_CACHE_MAX,
            node_cache_max: DEFAULT_NODE_CACHE_MAX,
        }
    }
}

impl Tuning {
    pub fn normalized(self) -> Self {
        fn clamp(value: usize, default: usize, min: usize) -> usize {
            let value = if value == 0 { default } else { value };
            value.max(min)
        }

        Self {
            leaf_record_max: clamp(self.leaf_record_max, DEFAULT_LEAF_RECORD_MAX, MIN_LEAF_RECORD_MAX),
            node_index_max: clamp(self.node_index_max, DEFAULT_NODE_INDEX_MAX, MIN_NODE_INDEX_MAX),
            leaf_cache_max: clamp(self.leaf_cache_max, DEFAULT_LEAF_CACHE_MAX, MIN_CACHE_MAX),
            node_cache_max: clamp(self.node_cache_max, DEFAULT_NODE_CACHE_MAX, MIN_CACHE_MAX),
        }
    }
}

/// Builder for opening a [`Database`] backed by a [`HashStore`]
///
/// ```no_run
/// use arbor::{Comparator, OpenOptions};
///
/// let mut db = OpenOptions::new()
///     .writer(true)
///     .create(true)
///     .open("data.arb", Comparator::Lexical)?;
/// db.put(b"key", b"value", Default::default())?;
/// db.close()?;
/// # Ok::<(), arbor::DbError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    pub writer: bool,
    pub create: bool,
    pub truncate: bool,
    pub no_lock: bool,
    pub lock_nonblocking: bool,
    /// Compress leaves of a newly created database
    pub compress: bool,
    pub tuning: Tuning,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&mut self, writer: bool) -> &mut Self {
        self.writer = writer;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    pub fn no_lock(&mut self, no_lock: bool) -> &mut Self {
        self.no_lock = no_lock;
        self
    }

    pub fn lock_nonblocking(&mut self, nonblocking: bool) -> &mut Self {
        self.lock_nonblocking = nonblocking;
        self
    }

    pub fn compress(&mut self, compress: bool) -> &mut Self {
        self.compress = compress;
        self
    }

    pub fn tuning(&mut self, tuning: Tuning) -> &mut Self {
        self.tuning = tuning;
        self
    }

    /// Store open mode these options translate to
    pub fn mode(&self) -> OpenMode {
        let mut mode = if self.writer { OpenMode::WRITER } else { OpenMode::READER };
        if self.writer && self.create {
            mode = mode | OpenMode::CREATE;
        }
        if self.writer && self.truncate {
            mode = mode | OpenMode::TRUNCATE;
        }
        if self.no_lock {
            mode = mode | OpenMode::NO_LOCK;
        }
        if self.lock_nonblocking {
            mode = mode | OpenMode::LOCK_NONBLOCKING;
        }
        mode
    }

    pub fn open<P: AsRef<Path>>(&self, path: P, cmp: Comparator) -> DbResult<Database<HashStore>> {
        let store = HashStore::open(path, self.mode())?;
        Database::from_store(store, cmp, self.compress, self.tuning)
    }
}
