//! Ordered traversal over the leaf chain
//!
//! The cursor is a position `(leaf, record, duplicate)`; duplicate 0 is a
//! record's first value. Any `put` or `out` invalidates it.

use super::{Database, DbResult};
use crate::btree::{LeafId, Record};
use crate::file::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct CursorPos {
    leaf: LeafId,
    record: usize,
    dup: usize,
}

/// Where [`Database::cursor_jump`] lands when the key is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JumpMode {
    /// First value of the smallest key `>=` the target
    #[default]
    Forward,
    /// Last value of the largest key `<=` the target
    Backward,
}

impl<S: Store> Database<S> {
    /// Move to the first value of the smallest key
    pub fn cursor_first(&mut self) -> DbResult<bool> {
        self.cursor = None;
        let Some(leaf) = self.scan_leaves(LeafId::FIRST, JumpMode::Forward)? else {
            return Ok(false);
        };
        self.cursor = Some(CursorPos { leaf, record: 0, dup: 0 });
        Ok(true)
    }

    /// Move to the last value of the largest key
    pub fn cursor_last(&mut self) -> DbResult<bool> {
        self.cursor = None;
        let Some(leaf) = self.scan_leaves(self.meta.last, JumpMode::Backward)? else {
            return Ok(false);
        };
        self.cursor = self.tail_of(leaf)?;
        Ok(self.cursor.is_some())
    }

    /// Step to the previous value; `false` (and an invalid cursor) past the
    /// front
    pub fn cursor_prev(&mut self) -> DbResult<bool> {
        let Some(pos) = self.cursor else {
            return Ok(false);
        };
        let moved = self.step_back(pos);
        self.settle(moved)
    }

    /// Step to the next value; `false` (and an invalid cursor) past the end
    pub fn cursor_next(&mut self) -> DbResult<bool> {
        let Some(pos) = self.cursor else {
            return Ok(false);
        };
        let moved = self.step_forward(pos);
        self.settle(moved)
    }

    /// Position the cursor at `key`, or next to where it would be
    pub fn cursor_jump(&mut self, key: &[u8], mode: JumpMode) -> DbResult<bool> {
        self.cursor = None;
        let start = self.find_leaf(key, None)?;
        let Some(leaf_id) = self.scan_leaves(start, mode)? else {
            return Ok(false);
        };

        let cmp = self.cmp;
        let leaf = self.load_leaf(leaf_id)?;
        let (record, dup, settled) = match leaf.search(&cmp, key) {
            Ok(index) => {
                let dup = match mode {
                    JumpMode::Forward => 0,
                    JumpMode::Backward => leaf.records[index].rest.len(),
                };
                (index, dup, true)
            }
            Err(probe) => {
                let index = probe.min(leaf.len() - 1);
                let found = &leaf.records[index];
                let ord = cmp.compare(key, &found.key);
                match mode {
                    JumpMode::Forward if ord.is_lt() => (index, 0, true),
                    JumpMode::Forward => (index, found.rest.len(), false),
                    JumpMode::Backward if ord.is_gt() => (index, found.rest.len(), true),
                    JumpMode::Backward => (index, 0, false),
                }
            }
        };

        self.cursor = Some(CursorPos { leaf: leaf_id, record, dup });
        match (settled, mode) {
            (true, _) => Ok(true),
            // Parked on the neighbour on the wrong side of the key
            (false, JumpMode::Forward) => self.cursor_next(),
            (false, JumpMode::Backward) => self.cursor_prev(),
        }
    }

    pub fn cursor_key(&mut self) -> DbResult<Option<Vec<u8>>> {
        self.with_cursor_record(|record, _| record.key.clone())
    }

    pub fn cursor_value(&mut self) -> DbResult<Option<Vec<u8>>> {
        self.with_cursor_record(|record, dup| record.value(dup).map(<[u8]>::to_vec))
            .map(Option::flatten)
    }

    /// Key and value under the cursor
    pub fn cursor_record(&mut self) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.with_cursor_record(|record, dup| {
            record.value(dup).map(|value| (record.key.clone(), value.to_vec()))
        })
        .map(Option::flatten)
    }

    fn with_cursor_record<T>(&mut self, read: impl FnOnce(&Record, usize) -> T) -> DbResult<Option<T>> {
        let Some(pos) = self.cursor else {
            return Ok(None);
        };
        let result = self
            .load_leaf(pos.leaf)
            .map(|leaf| leaf.records.get(pos.record).map(|record| read(record, pos.dup)));
        if result.is_err() {
            self.cursor = None;
        }
        result
    }

    /// Apply the outcome of a step: move on success, invalidate otherwise
    fn settle(&mut self, moved: DbResult<Option<CursorPos>>) -> DbResult<bool> {
        match moved {
            Ok(Some(pos)) => {
                self.cursor = Some(pos);
                self.adjust_cache()?;
                Ok(true)
            }
            Ok(None) => {
                self.cursor = None;
                Ok(false)
            }
            Err(e) => {
                self.cursor = None;
                Err(e)
            }
        }
    }

    /// First non-empty leaf from `start` in the given direction
    fn scan_leaves(&mut self, start: LeafId, direction: JumpMode) -> DbResult<Option<LeafId>> {
        let mut id = start;
        loop {
            let leaf = self.load_leaf(id)?;
            if !leaf.is_empty() {
                return Ok(Some(id));
            }
            let link = match direction {
                JumpMode::Forward => leaf.next,
                JumpMode::Backward => leaf.prev,
            };
            match link {
                Some(next) => id = next,
                None => return Ok(None),
            }
        }
    }

    /// Position of the last value in a non-empty leaf
    fn tail_of(&mut self, leaf_id: LeafId) -> DbResult<Option<CursorPos>> {
        let leaf = self.load_leaf(leaf_id)?;
        Ok(leaf.records.last().map(|record| CursorPos {
            leaf: leaf_id,
            record: leaf.len() - 1,
            dup: record.rest.len(),
        }))
    }

    fn step_forward(&mut self, pos: CursorPos) -> DbResult<Option<CursorPos>> {
        let leaf = self.load_leaf(pos.leaf)?;
        if leaf.is_empty() {
            return Ok(None);
        }

        let dups = leaf.records.get(pos.record).map_or(0, |r| r.rest.len());
        let (record, dup) = if pos.dup < dups {
            (pos.record, pos.dup + 1)
        } else {
            (pos.record + 1, 0)
        };
        if record < leaf.len() {
            return Ok(Some(CursorPos { leaf: pos.leaf, record, dup }));
        }

        let Some(next) = leaf.next else {
            return Ok(None);
        };
        Ok(self
            .scan_leaves(next, JumpMode::Forward)?
            .map(|leaf| CursorPos { leaf, record: 0, dup: 0 }))
    }

    fn step_back(&mut self, pos: CursorPos) -> DbResult<Option<CursorPos>> {
        let leaf = self.load_leaf(pos.leaf)?;
        if leaf.is_empty() {
            return Ok(None);
        }

        if pos.dup > 0 {
            return Ok(Some(CursorPos { dup: pos.dup - 1, ..pos }));
        }
        if pos.record > 0 {
            let record = pos.record - 1;
            let dup = leaf.records.get(record).map_or(0, |r| r.rest.len());
            return Ok(Some(CursorPos { record, dup, ..pos }));
        }

        let Some(prev) = leaf.prev else {
            return Ok(None);
        };
        match self.scan_leaves(prev, JumpMode::Backward)? {
            Some(leaf) => self.tail_of(leaf),
            None => Ok(None),
        }
    }
}
