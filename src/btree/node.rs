use std::cmp::Ordering;
use std::fmt;

use crate::compare::Comparator;

use super::{LEAF_ID_MIN, NODE_ID_MIN};

/// Identifier of a leaf page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafId(u32);

/// Identifier of an interior node page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl LeafId {
    /// The leaf every database starts with; it heads the leaf chain forever
    pub const FIRST: LeafId = LeafId(LEAF_ID_MIN);

    /// ID of the `seq`-th leaf ever allocated
    ///
    /// The raw value `NODE_ID_MIN - 1` is reserved as the on-disk "no link"
    /// sentinel, so the leaf space ends just below it.
    pub fn from_seq(seq: u32) -> Option<LeafId> {
        let raw = LEAF_ID_MIN.checked_add(seq)?;
        (raw < NODE_ID_MIN - 1).then_some(LeafId(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl NodeId {
    /// ID of the `seq`-th node ever allocated
    pub fn from_seq(seq: u32) -> Option<NodeId> {
        let raw = NODE_ID_MIN.checked_add(seq)?;
        (raw <= i32::MAX as u32).then_some(NodeId(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leaf#{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A page reference: leaves and nodes share one ID space split at
/// [`NODE_ID_MIN`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageId {
    Leaf(LeafId),
    Node(NodeId),
}

impl PageId {
    /// Classify a raw on-disk ID. Anything below [`LEAF_ID_MIN`] or beyond
    /// the signed 32-bit range is not a page.
    pub fn from_raw(raw: i64) -> Option<PageId> {
        if raw < LEAF_ID_MIN as i64 || raw > i32::MAX as i64 {
            return None;
        }
        let raw = raw as u32;
        if raw < NODE_ID_MIN {
            Some(PageId::Leaf(LeafId(raw)))
        } else {
            Some(PageId::Node(NodeId(raw)))
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            PageId::Leaf(id) => id.0,
            PageId::Node(id) => id.0,
        }
    }

    /// Key under which the page body lives in the backing store
    pub fn storage_key(self) -> [u8; 4] {
        (self.raw() as i32).to_ne_bytes()
    }
}

impl From<LeafId> for PageId {
    fn from(id: LeafId) -> Self {
        PageId::Leaf(id)
    }
}

impl From<NodeId> for PageId {
    fn from(id: NodeId) -> Self {
        PageId::Node(id)
    }
}

/// Policy applied when a put targets a key that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DupMode {
    /// Replace the first value, keep any duplicates
    #[default]
    Overwrite,
    /// Leave the record untouched and report failure
    KeepExisting,
    /// Concatenate the new bytes onto the first value
    Concatenate,
    /// Append the value to the record's duplicate list
    AllowDuplicate,
}

/// What [`LeafPage::add_record`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new record was created
    Inserted,
    /// A duplicate value was appended to an existing record
    Appended,
    /// An existing value was replaced or extended in place
    Updated,
    /// The key existed and the mode forbade touching it
    Kept,
}

impl AddOutcome {
    /// Whether the logical record count grew
    pub fn adds_value(self) -> bool {
        matches!(self, AddOutcome::Inserted | AddOutcome::Appended)
    }
}

/// A key with one or more values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub first: Vec<u8>,
    /// Duplicate values, in insertion order
    pub rest: Vec<Vec<u8>>,
}

impl Record {
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            first: value.to_vec(),
            rest: Vec::new(),
        }
    }

    pub fn value_count(&self) -> usize {
        1 + self.rest.len()
    }

    /// Value at duplicate position `dup` (0 is the first value)
    pub fn value(&self, dup: usize) -> Option<&[u8]> {
        match dup {
            0 => Some(&self.first),
            n => self.rest.get(n - 1).map(Vec::as_slice),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.first.as_slice()).chain(self.rest.iter().map(Vec::as_slice))
    }
}

/// Leaf page: sorted records plus links to its neighbours
#[derive(Debug, Clone)]
pub struct LeafPage {
    pub id: LeafId,
    pub dirty: bool,
    pub records: Vec<Record>,
    pub prev: Option<LeafId>,
    pub next: Option<LeafId>,
}

impl LeafPage {
    /// A fresh, empty and dirty leaf
    pub fn new(id: LeafId, prev: Option<LeafId>, next: Option<LeafId>) -> Self {
        Self {
            id,
            dirty: true,
            records: Vec::new(),
            prev,
            next,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Locate `key`: `Ok(index)` on an exact hit, otherwise `Err(probe)` with
    /// the last probed index, which is at most `len()`
    pub fn search(&self, cmp: &Comparator, key: &[u8]) -> Result<usize, usize> {
        let len = self.records.len() as isize;
        let (mut left, mut right) = (0isize, len);
        let mut i = (left + right) / 2;
        while right >= left && i < len {
            match cmp.compare(key, &self.records[i as usize].key) {
                Ordering::Equal => return Ok(i as usize),
                Ordering::Less => right = i - 1,
                Ordering::Greater => left = i + 1,
            }
            i = (left + right) / 2;
        }
        Err(i as usize)
    }

    /// Add `value` under `key` according to `mode`; marks the page dirty
    /// unless the record was kept
    pub fn add_record(&mut self, cmp: &Comparator, mode: DupMode, key: &[u8], value: &[u8]) -> AddOutcome {
        // Narrow with a binary search, then settle linearly from there
        let mut i = match self.search(cmp, key) {
            Ok(i) | Err(i) => i,
        };

        while i < self.records.len() {
            match cmp.compare(key, &self.records[i].key) {
                Ordering::Equal => {
                    let record = &mut self.records[i];
                    let outcome = match mode {
                        DupMode::Overwrite => {
                            record.first = value.to_vec();
                            AddOutcome::Updated
                        }
                        DupMode::KeepExisting => return AddOutcome::Kept,
                        DupMode::Concatenate => {
                            record.first.extend_from_slice(value);
                            AddOutcome::Updated
                        }
                        DupMode::AllowDuplicate => {
                            record.rest.push(value.to_vec());
                            AddOutcome::Appended
                        }
                    };
                    self.dirty = true;
                    return outcome;
                }
                Ordering::Less => {
                    self.records.insert(i, Record::new(key, value));
                    self.dirty = true;
                    return AddOutcome::Inserted;
                }
                Ordering::Greater => i += 1,
            }
        }

        self.records.push(Record::new(key, value));
        self.dirty = true;
        AddOutcome::Inserted
    }

    /// Drop the first value of the record at `index`, promoting the oldest
    /// duplicate if there is one
    pub fn remove_first_value(&mut self, index: usize) {
        let Some(record) = self.records.get_mut(index) else {
            return;
        };
        if record.rest.is_empty() {
            self.records.remove(index);
        } else {
            record.first = record.rest.remove(0);
        }
        self.dirty = true;
    }

    /// Move the upper half of the records into a new leaf linked right after
    /// this one. The caller fixes the old right neighbour's `prev` link.
    pub fn divide(&mut self, new_id: LeafId) -> LeafPage {
        let mid = self.records.len() / 2;
        let mut sibling = LeafPage::new(new_id, Some(self.id), self.next);
        sibling.records = self.records.split_off(mid);
        self.next = Some(new_id);
        self.dirty = true;
        sibling
    }
}

/// Separator entry of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub child: PageId,
    /// Smallest key reachable through `child`
    pub key: Vec<u8>,
}

/// Interior page: a leftmost child plus sorted separators
#[derive(Debug, Clone)]
pub struct NodePage {
    pub id: NodeId,
    pub dirty: bool,
    /// Child holding every key below the first separator
    pub heir: PageId,
    pub indices: Vec<Index>,
}

impl NodePage {
    pub fn new(id: NodeId, heir: PageId) -> Self {
        Self {
            id,
            dirty: true,
            heir,
            indices: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Insert a separator. With `ordered` the entry is known to sort last and
    /// is appended; otherwise it goes after any equal keys.
    pub fn add_index(&mut self, cmp: &Comparator, ordered: bool, child: PageId, key: Vec<u8>) {
        self.dirty = true;
        let entry = Index { child, key };
        if ordered {
            self.indices.push(entry);
            return;
        }

        let len = self.indices.len() as isize;
        let (mut left, mut right) = (0isize, len);
        let mut i = (left + right) / 2;
        while right >= left && i < len {
            match cmp.compare(&entry.key, &self.indices[i as usize].key) {
                Ordering::Equal => break,
                Ordering::Less => right = i - 1,
                Ordering::Greater => left = i + 1,
            }
            i = (left + right) / 2;
        }

        let mut i = i as usize;
        while i < self.indices.len() {
            if cmp.compare(&entry.key, &self.indices[i].key) == Ordering::Less {
                self.indices.insert(i, entry);
                return;
            }
            i += 1;
        }
        self.indices.push(entry);
    }

    /// Child to descend into for `key`. `None` when the node has no
    /// separators, which a well-formed tree never produces.
    pub fn child_for(&self, cmp: &Comparator, key: &[u8]) -> Option<PageId> {
        let last = self.indices.last()?;

        let len = self.indices.len() as isize;
        let (mut left, mut right) = (1isize, len);
        let mut i = (left + right) / 2;
        while right >= left && i < len {
            match cmp.compare(key, &self.indices[i as usize].key) {
                Ordering::Equal => break,
                Ordering::Less => right = i - 1,
                Ordering::Greater => left = i + 1,
            }
            i = (left + right) / 2;
        }

        let mut i = (i as usize).saturating_sub(1);
        while i < self.indices.len() {
            if cmp.compare(key, &self.indices[i].key) == Ordering::Less {
                return Some(if i == 0 { self.heir } else { self.indices[i - 1].child });
            }
            i += 1;
        }
        Some(last.child)
    }

    /// Split around the middle separator. The middle child becomes the new
    /// node's heir and its key is returned for promotion; separators after
    /// it move to the new node.
    pub fn split(&mut self, new_id: NodeId) -> Option<(NodePage, Vec<u8>)> {
        let mid = self.indices.len() / 2;
        let mut upper = self.indices.split_off(mid);
        if upper.is_empty() {
            self.indices.append(&mut upper);
            return None;
        }
        let promoted = upper.remove(0);
        let mut sibling = NodePage::new(new_id, promoted.child);
        sibling.indices = upper;
        self.dirty = true;
        Some((sibling, promoted.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(keys: &[&[u8]]) -> LeafPage {
        let mut leaf = LeafPage::new(LeafId::FIRST, None, None);
        for key in keys {
            leaf.add_record(&Comparator::Lexical, DupMode::Overwrite, key, b"v");
        }
        leaf
    }

    fn keys_of(leaf: &LeafPage) -> Vec<&[u8]> {
        leaf.records.iter().map(|r| r.key.as_slice()).collect()
    }

    #[test]
    fn test_page_id_classification() {
        assert_eq!(PageId::from_raw(0), None);
        assert_eq!(PageId::from_raw(-1), None);
        assert_eq!(PageId::from_raw(1), Some(PageId::Leaf(LeafId::FIRST)));
        assert!(matches!(PageId::from_raw(NODE_ID_MIN as i64), Some(PageId::Node(_))));
        assert_eq!(PageId::from_raw(i64::from(i32::MAX) + 1), None);
        assert_eq!(LeafId::from_seq(0), Some(LeafId::FIRST));
        assert_eq!(NodeId::from_seq(0).map(NodeId::raw), Some(NODE_ID_MIN));
        // The link sentinel is never handed out as a leaf
        assert_eq!(LeafId::from_seq(NODE_ID_MIN - 1 - LEAF_ID_MIN), None);
    }

    #[test]
    fn test_add_record_keeps_order() {
        let leaf = leaf_with(&[b"m", b"c", b"x", b"a", b"q", b"d"]);
        assert_eq!(keys_of(&leaf), vec![b"a" as &[u8], b"c", b"d", b"m", b"q", b"x"]);
        assert!(leaf.dirty);
    }

    #[test]
    fn test_dup_modes() {
        let cmp = Comparator::Lexical;
        let mut leaf = LeafPage::new(LeafId::FIRST, None, None);
        assert_eq!(leaf.add_record(&cmp, DupMode::Overwrite, b"k", b"1"), AddOutcome::Inserted);
        assert_eq!(leaf.add_record(&cmp, DupMode::KeepExisting, b"k", b"2"), AddOutcome::Kept);
        assert_eq!(leaf.records[0].first, b"1");

        assert_eq!(leaf.add_record(&cmp, DupMode::Concatenate, b"k", b"2"), AddOutcome::Updated);
        assert_eq!(leaf.records[0].first, b"12");

        assert_eq!(leaf.add_record(&cmp, DupMode::AllowDuplicate, b"k", b"3"), AddOutcome::Appended);
        assert_eq!(leaf.add_record(&cmp, DupMode::Overwrite, b"k", b"0"), AddOutcome::Updated);
        let record = &leaf.records[0];
        assert_eq!(record.values().collect::<Vec<_>>(), vec![b"0" as &[u8], b"3"]);
        assert_eq!(record.value_count(), 2);
    }

    #[test]
    fn test_search() {
        let leaf = leaf_with(&[b"b", b"d", b"f"]);
        let cmp = Comparator::Lexical;
        assert_eq!(leaf.search(&cmp, b"d"), Ok(1));
        assert!(leaf.search(&cmp, b"e").is_err());
        let Err(probe) = leaf.search(&cmp, b"z") else {
            panic!("unexpected hit");
        };
        assert!(probe <= leaf.len());
    }

    #[test]
    fn test_remove_first_value_promotes_duplicate() {
        let cmp = Comparator::Lexical;
        let mut leaf = LeafPage::new(LeafId::FIRST, None, None);
        leaf.add_record(&cmp, DupMode::AllowDuplicate, b"k", b"a");
        leaf.add_record(&cmp, DupMode::AllowDuplicate, b"k", b"b");
        leaf.remove_first_value(0);
        assert_eq!(leaf.records[0].first, b"b");
        assert!(leaf.records[0].rest.is_empty());
        leaf.remove_first_value(0);
        assert!(leaf.is_empty());
    }

    #[test]
    fn test_divide_links_sibling() {
        let mut leaf = leaf_with(&[b"a", b"b", b"c", b"d"]);
        let next = LeafId::from_seq(7).unwrap();
        leaf.next = Some(next);
        let new_id = LeafId::from_seq(1).unwrap();

        let sibling = leaf.divide(new_id);
        assert_eq!(keys_of(&leaf), vec![b"a" as &[u8], b"b"]);
        assert_eq!(keys_of(&sibling), vec![b"c" as &[u8], b"d"]);
        assert_eq!(leaf.next, Some(new_id));
        assert_eq!(sibling.prev, Some(leaf.id));
        assert_eq!(sibling.next, Some(next));
        assert!(sibling.dirty);
    }

    fn leaf_ref(seq: u32) -> PageId {
        PageId::Leaf(LeafId::from_seq(seq).unwrap())
    }

    #[test]
    fn test_child_for_routes_by_separator() {
        let cmp = Comparator::Lexical;
        let mut node = NodePage::new(NodeId::from_seq(0).unwrap(), leaf_ref(0));
        node.add_index(&cmp, true, leaf_ref(1), b"d".to_vec());
        node.add_index(&cmp, true, leaf_ref(2), b"h".to_vec());
        node.add_index(&cmp, true, leaf_ref(3), b"p".to_vec());

        assert_eq!(node.child_for(&cmp, b"a"), Some(leaf_ref(0)));
        assert_eq!(node.child_for(&cmp, b"d"), Some(leaf_ref(1)));
        assert_eq!(node.child_for(&cmp, b"e"), Some(leaf_ref(1)));
        assert_eq!(node.child_for(&cmp, b"h"), Some(leaf_ref(2)));
        assert_eq!(node.child_for(&cmp, b"o"), Some(leaf_ref(2)));
        assert_eq!(node.child_for(&cmp, b"p"), Some(leaf_ref(3)));
        assert_eq!(node.child_for(&cmp, b"zzz"), Some(leaf_ref(3)));

        let empty = NodePage::new(NodeId::from_seq(1).unwrap(), leaf_ref(0));
        assert_eq!(empty.child_for(&cmp, b"a"), None);
    }

    #[test]
    fn test_unordered_add_index_sorts() {
        let cmp = Comparator::Lexical;
        let mut node = NodePage::new(NodeId::from_seq(0).unwrap(), leaf_ref(0));
        for (seq, key) in [(1, "m"), (2, "c"), (3, "x"), (4, "f")] {
            node.add_index(&cmp, false, leaf_ref(seq), key.as_bytes().to_vec());
        }
        let keys: Vec<&[u8]> = node.indices.iter().map(|i| i.key.as_slice()).collect();
        assert_eq!(keys, vec![b"c" as &[u8], b"f", b"m", b"x"]);
    }

    #[test]
    fn test_node_split_promotes_middle() {
        let cmp = Comparator::Lexical;
        let mut node = NodePage::new(NodeId::from_seq(0).unwrap(), leaf_ref(0));
        for (seq, key) in [(1, "b"), (2, "c"), (3, "d"), (4, "e")] {
            node.add_index(&cmp, true, leaf_ref(seq), key.as_bytes().to_vec());
        }
        let new_id = NodeId::from_seq(1).unwrap();
        let (sibling, promoted) = node.split(new_id).unwrap();

        assert_eq!(promoted, b"d");
        assert_eq!(node.len(), 2);
        assert_eq!(sibling.heir, leaf_ref(3));
        assert_eq!(sibling.indices, vec![Index { child: leaf_ref(4), key: b"e".to_vec() }]);
    }
}
