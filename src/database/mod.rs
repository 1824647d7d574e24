//! The B+ tree engine
//!
//! A [`Database`] owns one backing [`Store`], the leaf and node caches, the
//! cursor and the tree metadata. Pages are loaded into the caches on demand,
//! mutated there, and written back when a cache overflows, at transaction
//! boundaries, on `sync` and on close.
//!
//! Every page lives in the store under its raw 4-byte ID. Five more records
//! under small negative keys hold the root ID, the last leaf ID and the leaf,
//! node and record counters.

mod config;
mod cursor;
mod error;
mod maintenance;
#[cfg(test)]
mod tests;
mod transaction;

pub use config::{
    DEFAULT_LEAF_CACHE_MAX, DEFAULT_LEAF_RECORD_MAX, DEFAULT_NODE_CACHE_MAX, DEFAULT_NODE_INDEX_MAX, OpenOptions,
    Tuning,
};
pub use cursor::JumpMode;
pub use error::{DbError, DbResult};

use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::btree::{
    AddOutcome, CACHE_OUT, DupMode, LEVEL_MAX, LeafId, LeafPage, NodeId, NodePage, PageCache, PageId, Record,
    serialization,
};
use crate::compare::Comparator;
use crate::file::{HashStore, Store};

use cursor::CursorPos;

/// Store flag marking a file as a B+ tree database
pub const FLAG_TREE: u32 = 1 << 0;
/// Store flag marking leaf bodies as compressed
pub const FLAG_COMPRESSED: u32 = 1 << 1;

const META_ROOT: i32 = -1;
const META_LAST: i32 = -2;
const META_LEAF_COUNT: i32 = -3;
const META_NODE_COUNT: i32 = -4;
const META_RECORD_COUNT: i32 = -5;

const INITIAL_AVG_SIZE: u32 = 448;
const ALIGN_RATIO: f64 = 1.4;

/// Tree root, leaf chain tail and counters; persisted as metadata records
/// and snapshotted by transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Meta {
    root: PageId,
    last: LeafId,
    leaf_count: u32,
    node_count: u32,
    record_count: u32,
}

impl Meta {
    fn empty() -> Self {
        Self {
            root: PageId::Leaf(LeafId::FIRST),
            last: LeafId::FIRST,
            leaf_count: 0,
            node_count: 0,
            record_count: 0,
        }
    }

    fn load<S: Store>(store: &mut S) -> DbResult<Meta> {
        let raw_root = read_meta(store, META_ROOT, "root")?;
        let raw_last = read_meta(store, META_LAST, "last leaf")?;

        let root = PageId::from_raw(raw_root.into())
            .ok_or_else(|| DbError::Broken(format!("invalid root page {raw_root}")))?;
        let last = match PageId::from_raw(raw_last.into()) {
            Some(PageId::Leaf(id)) => id,
            _ => return Err(DbError::Broken(format!("invalid last leaf {raw_last}"))),
        };

        Ok(Meta {
            root,
            last,
            leaf_count: read_counter(store, META_LEAF_COUNT, "leaf count")?,
            node_count: read_counter(store, META_NODE_COUNT, "node count")?,
            record_count: read_counter(store, META_RECORD_COUNT, "record count")?,
        })
    }

    fn save<S: Store>(&self, store: &mut S) -> DbResult<()> {
        let entries = [
            (META_ROOT, self.root.raw() as i32),
            (META_LAST, self.last.raw() as i32),
            (META_LEAF_COUNT, self.leaf_count as i32),
            (META_NODE_COUNT, self.node_count as i32),
            (META_RECORD_COUNT, self.record_count as i32),
        ];
        for (key, value) in entries {
            store.put(&key.to_ne_bytes(), &value.to_ne_bytes(), true)?;
        }
        Ok(())
    }
}

fn read_meta<S: Store>(store: &mut S, key: i32, name: &str) -> DbResult<i32> {
    let value = store.get(&key.to_ne_bytes())?;
    let bytes = value
        .as_deref()
        .and_then(|v| <[u8; 4]>::try_from(v).ok())
        .ok_or_else(|| DbError::Broken(format!("metadata record '{name}' is missing")))?;
    Ok(i32::from_ne_bytes(bytes))
}

fn read_counter<S: Store>(store: &mut S, key: i32, name: &str) -> DbResult<u32> {
    let raw = read_meta(store, key, name)?;
    u32::try_from(raw).map_err(|_| DbError::Broken(format!("negative {name} {raw}")))
}

/// Keep the first error of a best-effort sequence
fn keep_first(acc: &mut DbResult<()>, result: DbResult<()>) {
    if acc.is_ok() {
        *acc = result;
    }
}

/// Handle to an open B+ tree database
///
/// All operations take `&mut self`: even lookups move pages through the
/// caches. A handle is single-threaded; share it behind a lock if needed.
pub struct Database<S: Store = HashStore> {
    store: S,
    cmp: Comparator,
    writable: bool,
    compressed: bool,
    meta: Meta,
    leaves: PageCache<LeafId, LeafPage>,
    nodes: PageCache<NodeId, NodePage>,
    cursor: Option<CursorPos>,
    tuning: Tuning,
    avg_leaf_size: u32,
    avg_node_size: u32,
    /// Metadata as of `transaction_begin`, present while a transaction runs
    snapshot: Option<Meta>,
    error_handler: Option<Box<dyn Fn(&DbError)>>,
    closed: bool,
}

impl Database<HashStore> {
    /// Open a database file. See [`OpenOptions`] for the available knobs.
    pub fn open<P: AsRef<Path>>(path: P, options: &OpenOptions, cmp: Comparator) -> DbResult<Self> {
        options.open(path, cmp)
    }
}

impl<S: Store> Database<S> {
    /// Build a handle over an already opened store.
    ///
    /// A store holding records must carry the tree flag and all metadata
    /// records. An empty store is initialized with a single empty root leaf,
    /// which requires a writable store. `compress` only matters for an empty
    /// store; existing databases keep the mode they were created with.
    pub fn from_store(mut store: S, cmp: Comparator, compress: bool, tuning: Tuning) -> DbResult<Self> {
        let writable = store.is_writable();
        let mut flags = store.flags();

        let (meta, compressed) = if store.record_count() > 0 {
            if flags & FLAG_TREE == 0 {
                return Err(DbError::Broken(format!("{} is not a B+ tree database", store.name())));
            }
            let compressed = flags & FLAG_COMPRESSED != 0;
            if compressed && !serialization::COMPRESSION_AVAILABLE {
                return Err(DbError::Misc(format!(
                    "{} has compressed leaves but compression support is not built in",
                    store.name()
                )));
            }
            (Some(Meta::load(&mut store)?), compressed)
        } else {
            if !writable {
                return Err(DbError::Mode("an empty database can only be initialized by a writer"));
            }
            (None, compress && serialization::COMPRESSION_AVAILABLE)
        };

        if writable {
            flags |= FLAG_TREE;
            if compressed {
                flags |= FLAG_COMPRESSED;
            }
            store.set_flags(flags)?;
        }

        let fresh = meta.is_none();
        let mut db = Self {
            store,
            cmp,
            writable,
            compressed,
            meta: meta.unwrap_or_else(Meta::empty),
            leaves: PageCache::new(),
            nodes: PageCache::new(),
            cursor: None,
            tuning: tuning.normalized(),
            avg_leaf_size: INITIAL_AVG_SIZE,
            avg_node_size: INITIAL_AVG_SIZE,
            snapshot: None,
            error_handler: None,
            closed: false,
        };

        if fresh {
            let root = db.new_leaf(None, None)?;
            db.meta.root = PageId::Leaf(root);
            db.meta.last = root;
            // Persist the empty root through an immediately rolled back
            // transaction so the file is valid from the first moment
            db.transaction_begin()?;
            db.transaction_abort()?;
        }

        info!(
            name = db.store.name(),
            writable,
            compressed,
            comparator = cmp.name(),
            records = db.meta.record_count,
            "db.open"
        );
        Ok(db)
    }

    /// Flush everything and release the store.
    ///
    /// An active transaction is rolled back first. Every step runs even if
    /// an earlier one failed; the first error is returned.
    pub fn close(mut self) -> DbResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        if self.snapshot.is_some() {
            keep_first(&mut result, self.transaction_abort());
        }
        keep_first(&mut result, self.evict_all());
        if self.writable {
            keep_first(&mut result, self.store.set_alignment(0).map_err(DbError::from));
            keep_first(&mut result, self.meta.save(&mut self.store));
        }
        keep_first(&mut result, self.store.close().map_err(DbError::from));

        info!(name = self.store.name(), ok = result.is_ok(), "db.close");
        result
    }

    /// Install a callback invoked whenever an operation runs into damaged
    /// data
    pub fn set_error_handler(&mut self, handler: impl Fn(&DbError) + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    pub fn set_tuning(&mut self, tuning: Tuning) {
        self.tuning = tuning.normalized();
        debug!(name = self.store.name(), tuning = ?self.tuning, "db.tuning");
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    pub fn comparator(&self) -> Comparator {
        self.cmp
    }

    /// Store `value` under `key`, resolving an existing key with `mode`.
    ///
    /// Returns `false` when the key exists and `mode` is
    /// [`DupMode::KeepExisting`]. Invalidates the cursor.
    pub fn put(&mut self, key: &[u8], value: &[u8], mode: DupMode) -> DbResult<bool> {
        self.cursor = None;
        self.require_writer()?;

        let mut path = Vec::new();
        let leaf_id = self.find_leaf(key, Some(&mut path))?;
        let cmp = self.cmp;
        let (outcome, len) = {
            let leaf = self.load_leaf(leaf_id)?;
            let outcome = leaf.add_record(&cmp, mode, key, value);
            (outcome, leaf.len())
        };
        if outcome == AddOutcome::Kept {
            return Ok(false);
        }
        if outcome.adds_value() {
            self.meta.record_count += 1;
        }

        if len > self.tuning.leaf_record_max && len % 2 == 0 {
            self.split_leaf(leaf_id, path)?;
        }
        self.adjust_cache()?;
        Ok(true)
    }

    /// Add every value in `values` as duplicates of `key`
    pub fn put_list<V: AsRef<[u8]>>(&mut self, key: &[u8], values: &[V]) -> DbResult<()> {
        self.require_writer()?;
        if values.is_empty() {
            return Err(DbError::Misc("put_list needs at least one value".into()));
        }
        for value in values {
            self.put(key, value.as_ref(), DupMode::AllowDuplicate)?;
        }
        Ok(())
    }

    /// Remove the first value of `key`; the oldest duplicate, if any, takes
    /// its place. Returns `false` when the key is absent.
    pub fn out(&mut self, key: &[u8]) -> DbResult<bool> {
        self.cursor = None;
        self.require_writer()?;

        let leaf_id = self.find_leaf(key, None)?;
        let cmp = self.cmp;
        let removed = {
            let leaf = self.load_leaf(leaf_id)?;
            match leaf.search(&cmp, key) {
                Ok(index) => {
                    leaf.remove_first_value(index);
                    true
                }
                Err(_) => false,
            }
        };
        if !removed {
            return Ok(false);
        }

        self.meta.record_count = self.meta.record_count.saturating_sub(1);
        self.adjust_cache()?;
        Ok(true)
    }

    /// Remove every value of `key`
    pub fn out_list(&mut self, key: &[u8]) -> DbResult<bool> {
        self.require_writer()?;
        let count = self.vnum(key)?;
        if count == 0 {
            return Ok(false);
        }
        for _ in 0..count {
            self.out(key)?;
        }
        Ok(true)
    }

    /// First value of `key`
    pub fn get(&mut self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.lookup(key, |record| record.first.clone())
    }

    /// Number of values stored under `key`; 0 when absent
    pub fn vnum(&mut self, key: &[u8]) -> DbResult<usize> {
        Ok(self.lookup(key, Record::value_count)?.unwrap_or(0))
    }

    /// Every value of `key` in insertion order
    pub fn get_list(&mut self, key: &[u8]) -> DbResult<Option<Vec<Vec<u8>>>> {
        self.lookup(key, |record| record.values().map(<[u8]>::to_vec).collect())
    }

    /// Every value of `key` joined end to end
    pub fn get_cat(&mut self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.lookup(key, |record| record.values().flatten().copied().collect())
    }

    fn lookup<T>(&mut self, key: &[u8], extract: impl FnOnce(&Record) -> T) -> DbResult<Option<T>> {
        let leaf_id = self.find_leaf(key, None)?;
        let cmp = self.cmp;
        let found = {
            let leaf = self.load_leaf(leaf_id)?;
            leaf.search(&cmp, key).ok().map(|index| extract(&leaf.records[index]))
        };
        if found.is_some() {
            self.adjust_cache()?;
        }
        Ok(found)
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn file_size(&self) -> u64 {
        self.store.file_size()
    }

    pub fn leaf_count(&self) -> u32 {
        self.meta.leaf_count
    }

    pub fn node_count(&self) -> u32 {
        self.meta.node_count
    }

    /// Number of stored values, duplicates included
    pub fn record_count(&self) -> u32 {
        self.meta.record_count
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn fatal_error(&self) -> bool {
        self.store.fatal_error()
    }

    pub fn inode(&self) -> u64 {
        self.store.inode()
    }

    pub fn mtime(&self) -> i64 {
        self.store.mtime()
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn require_writer(&self) -> DbResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(DbError::Mode("operation requires a writer handle"))
        }
    }

    fn require_no_transaction(&self) -> DbResult<()> {
        if self.snapshot.is_some() {
            Err(DbError::Mode("operation not allowed inside a transaction"))
        } else {
            Ok(())
        }
    }

    /// Log a corruption error and hand it to the error handler
    fn report(&self, err: DbError) -> DbError {
        if err.is_broken() {
            error!(name = self.store.name(), error = %err, "db.broken");
            if let Some(handler) = &self.error_handler {
                handler(&err);
            }
        }
        err
    }

    /// Descend from the root to the leaf that owns `key`, recording the
    /// visited nodes in `path` when given
    fn find_leaf(&mut self, key: &[u8], mut path: Option<&mut Vec<NodeId>>) -> DbResult<LeafId> {
        let cmp = self.cmp;
        let mut page = self.meta.root;
        let mut depth = 0;
        loop {
            let node_id = match page {
                PageId::Leaf(id) => return Ok(id),
                PageId::Node(id) => id,
            };
            depth += 1;
            if depth > LEVEL_MAX {
                return Err(self.report(DbError::Broken(format!("tree deeper than {LEVEL_MAX} levels"))));
            }

            let child = self.load_node(node_id)?.child_for(&cmp, key);
            let Some(child) = child else {
                return Err(self.report(DbError::Broken(format!("{node_id} has no separators"))));
            };
            if let Some(path) = path.as_deref_mut() {
                path.push(node_id);
            }
            page = child;
        }
    }

    fn load_leaf(&mut self, id: LeafId) -> DbResult<&mut LeafPage> {
        if !self.leaves.contains(&id) {
            let leaf = self.read_leaf(id).map_err(|e| self.report(e))?;
            self.leaves.put(id, leaf);
        }
        self.leaves
            .get_mut(&id)
            .ok_or_else(|| DbError::Broken(format!("{id} vanished from the cache")))
    }

    fn load_node(&mut self, id: NodeId) -> DbResult<&mut NodePage> {
        if !self.nodes.contains(&id) {
            let node = self.read_node(id).map_err(|e| self.report(e))?;
            self.nodes.put(id, node);
        }
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| DbError::Broken(format!("{id} vanished from the cache")))
    }

    fn read_leaf(&mut self, id: LeafId) -> DbResult<LeafPage> {
        let Some(body) = self.store.get(&PageId::Leaf(id).storage_key())? else {
            return Err(DbError::Broken(format!("{id} is missing from the store")));
        };
        let body = if self.compressed {
            serialization::decompress(PageId::Leaf(id), &body)?
        } else {
            body
        };
        Ok(serialization::decode_leaf(id, &body))
    }

    fn read_node(&mut self, id: NodeId) -> DbResult<NodePage> {
        let Some(body) = self.store.get(&PageId::Node(id).storage_key())? else {
            return Err(DbError::Broken(format!("{id} is missing from the store")));
        };
        Ok(serialization::decode_node(id, &body)?)
    }

    /// Write a serialized page, steering the store's padding towards the
    /// running average page size
    fn write_page(&mut self, page: PageId, body: Vec<u8>) -> DbResult<()> {
        let body = match page {
            PageId::Leaf(_) if self.compressed => serialization::compress(&body)?,
            _ => body,
        };
        let avg = match page {
            PageId::Leaf(_) => &mut self.avg_leaf_size,
            PageId::Node(_) => &mut self.avg_node_size,
        };
        *avg = ((u64::from(*avg) * 9 + body.len() as u64) / 10) as u32;
        let align = (f64::from(*avg) * ALIGN_RATIO) as i32;

        self.store.set_alignment(align)?;
        self.store.put(&page.storage_key(), &body, true)?;
        Ok(())
    }

    fn flush_leaf(&mut self, id: LeafId) -> DbResult<()> {
        let body = match self.leaves.peek(&id) {
            Some(leaf) if leaf.dirty => serialization::encode_leaf(leaf),
            _ => return Ok(()),
        };
        self.write_page(PageId::Leaf(id), body)?;
        if let Some(leaf) = self.leaves.peek_mut(&id) {
            leaf.dirty = false;
        }
        Ok(())
    }

    fn flush_node(&mut self, id: NodeId) -> DbResult<()> {
        let body = match self.nodes.peek(&id) {
            Some(node) if node.dirty => serialization::encode_node(node),
            _ => return Ok(()),
        };
        self.write_page(PageId::Node(id), body)?;
        if let Some(node) = self.nodes.peek_mut(&id) {
            node.dirty = false;
        }
        Ok(())
    }

    /// Drop a leaf from the cache, writing it back first if dirty. The page
    /// leaves the cache even if the write fails.
    fn evict_leaf(&mut self, id: LeafId) -> DbResult<()> {
        let result = self.flush_leaf(id);
        self.leaves.remove(&id);
        result
    }

    fn evict_node(&mut self, id: NodeId) -> DbResult<()> {
        let result = self.flush_node(id);
        self.nodes.remove(&id);
        result
    }

    /// Write back every dirty page, keeping all of them cached
    fn flush_dirty(&mut self) -> DbResult<()> {
        let mut result = Ok(());
        for id in self.leaves.ids_where(|leaf| leaf.dirty) {
            keep_first(&mut result, self.flush_leaf(id));
        }
        for id in self.nodes.ids_where(|node| node.dirty) {
            keep_first(&mut result, self.flush_node(id));
        }
        result
    }

    /// Empty both caches, writing back dirty pages
    fn evict_all(&mut self) -> DbResult<()> {
        let mut result = Ok(());
        for id in self.leaves.ids_oldest_first() {
            keep_first(&mut result, self.evict_leaf(id));
        }
        for id in self.nodes.ids_oldest_first() {
            keep_first(&mut result, self.evict_node(id));
        }
        result
    }

    /// One eviction round: each cache over its limit loses its
    /// [`CACHE_OUT`] coldest pages. Nothing is evicted inside a transaction.
    fn adjust_cache(&mut self) -> DbResult<()> {
        if self.snapshot.is_some() {
            return Ok(());
        }

        let mut result = Ok(());
        if self.leaves.len() > self.tuning.leaf_cache_max {
            for id in self.leaves.oldest(CACHE_OUT) {
                keep_first(&mut result, self.evict_leaf(id));
            }
        }
        if self.nodes.len() > self.tuning.node_cache_max {
            for id in self.nodes.oldest(CACHE_OUT) {
                keep_first(&mut result, self.evict_node(id));
            }
        }
        if let Err(e) = &result {
            warn!(name = self.store.name(), error = %e, "db.cache.evict_failed");
        }
        result
    }

    /// Run eviction rounds until both caches are within their limits
    fn shrink_caches(&mut self) -> DbResult<()> {
        let mut result = Ok(());
        while self.leaves.len() > self.tuning.leaf_cache_max || self.nodes.len() > self.tuning.node_cache_max {
            keep_first(&mut result, self.adjust_cache());
        }
        result
    }

    fn allocate_leaf(&mut self) -> DbResult<LeafId> {
        let id = LeafId::from_seq(self.meta.leaf_count)
            .ok_or_else(|| DbError::Misc("leaf ID space exhausted".into()))?;
        self.meta.leaf_count += 1;
        Ok(id)
    }

    fn allocate_node(&mut self) -> DbResult<NodeId> {
        let id = NodeId::from_seq(self.meta.node_count)
            .ok_or_else(|| DbError::Misc("node ID space exhausted".into()))?;
        self.meta.node_count += 1;
        Ok(id)
    }

    fn new_leaf(&mut self, prev: Option<LeafId>, next: Option<LeafId>) -> DbResult<LeafId> {
        let id = self.allocate_leaf()?;
        self.leaves.put(id, LeafPage::new(id, prev, next));
        Ok(id)
    }

    /// Split an overfull leaf and push the new separator up `path`,
    /// splitting nodes on the way and growing a new root if the old one
    /// splits too
    fn split_leaf(&mut self, leaf_id: LeafId, mut path: Vec<NodeId>) -> DbResult<()> {
        let cmp = self.cmp;
        let new_id = self.allocate_leaf()?;
        let sibling = self.load_leaf(leaf_id)?.divide(new_id);
        let Some(separator) = sibling.records.first().map(|r| r.key.clone()) else {
            return Err(DbError::Misc(format!("{leaf_id} split produced an empty sibling")));
        };
        let old_next = sibling.next;
        self.leaves.put(new_id, sibling);

        if let Some(next_id) = old_next {
            let next = self.load_leaf(next_id)?;
            next.prev = Some(new_id);
            next.dirty = true;
        }
        if self.meta.last == leaf_id {
            self.meta.last = new_id;
        }
        debug!(leaf = leaf_id.raw(), sibling = new_id.raw(), "db.leaf.split");

        let mut heir = PageId::Leaf(leaf_id);
        let mut child = PageId::Leaf(new_id);
        let mut key = separator;
        loop {
            let Some(parent_id) = path.pop() else {
                let root_id = self.allocate_node()?;
                let mut root = NodePage::new(root_id, heir);
                root.add_index(&cmp, true, child, key);
                self.nodes.put(root_id, root);
                self.meta.root = PageId::Node(root_id);
                debug!(root = root_id.raw(), "db.root.grown");
                break;
            };

            let len = {
                let parent = self.load_node(parent_id)?;
                parent.add_index(&cmp, false, child, key);
                parent.len()
            };
            if len <= self.tuning.node_index_max || len % 2 != 0 {
                break;
            }

            let new_node_id = self.allocate_node()?;
            let Some((sibling, promoted)) = self.load_node(parent_id)?.split(new_node_id) else {
                return Err(DbError::Misc(format!("{parent_id} has too few separators to split")));
            };
            self.nodes.put(new_node_id, sibling);
            debug!(node = parent_id.raw(), sibling = new_node_id.raw(), "db.node.split");

            heir = PageId::Node(parent_id);
            child = PageId::Node(new_node_id);
            key = promoted;
        }
        Ok(())
    }
}

impl<S: Store> Drop for Database<S> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(name = self.store.name(), error = %e, "db.drop.close_failed");
        }
    }
}
