//! Single-level transactions
//!
//! Beginning a transaction writes every dirty page and the metadata, so the
//! store reflects the pre-transaction tree. While it runs, nothing is
//! evicted: every page touched stays in memory. Abort throws away the dirty
//! pages and restores the metadata snapshot; the next load of a discarded
//! page reads the pre-transaction version back from the store.

use tracing::debug;

use super::{Database, DbError, DbResult, keep_first};
use crate::file::Store;

impl<S: Store> Database<S> {
    pub fn transaction_begin(&mut self) -> DbResult<()> {
        self.require_writer()?;
        if self.snapshot.is_some() {
            return Err(DbError::Mode("a transaction is already active"));
        }

        self.persist_state()?;
        self.snapshot = Some(self.meta);
        debug!(name = self.store.name(), "db.transaction.begin");
        Ok(())
    }

    pub fn transaction_commit(&mut self) -> DbResult<()> {
        self.require_writer()?;
        if self.snapshot.is_none() {
            return Err(DbError::Mode("no active transaction"));
        }

        let result = self.persist_state();
        self.snapshot = None;
        result?;
        self.shrink_caches()?;
        debug!(name = self.store.name(), records = self.meta.record_count, "db.transaction.commit");
        Ok(())
    }

    pub fn transaction_abort(&mut self) -> DbResult<()> {
        self.require_writer()?;
        let Some(snapshot) = self.snapshot.take() else {
            return Err(DbError::Mode("no active transaction"));
        };

        let discarded_leaves = self.leaves.ids_where(|leaf| leaf.dirty);
        let discarded_nodes = self.nodes.ids_where(|node| node.dirty);
        for id in &discarded_leaves {
            self.leaves.remove(id);
        }
        for id in &discarded_nodes {
            self.nodes.remove(id);
        }
        self.meta = snapshot;
        self.cursor = None;

        debug!(
            name = self.store.name(),
            leaves = discarded_leaves.len(),
            nodes = discarded_nodes.len(),
            "db.transaction.abort"
        );
        self.shrink_caches()
    }

    /// Flush dirty pages and metadata to the store, then push the store's
    /// own buffers to the file
    fn persist_state(&mut self) -> DbResult<()> {
        let mut result = self.flush_dirty();
        keep_first(&mut result, self.store.set_alignment(0).map_err(DbError::from));
        keep_first(&mut result, self.meta.save(&mut self.store));
        keep_first(&mut result, self.store.memory_sync().map_err(DbError::from));
        result
    }
}
