use std::ffi::OsString;
use std::fs::{self, File};
use std::path::Path;

use tracing::{info, warn};

use super::{Database, DbError, DbResult, FLAG_COMPRESSED, FLAG_TREE, OpenOptions, keep_first};
use crate::btree::{DupMode, PageId, serialization};
use crate::compare::Comparator;
use crate::file::{HashStore, OpenMode, Store};

const REPAIR_SUFFIX: &str = ".repair";

impl<S: Store> Database<S> {
    /// Write every cached page and the metadata, then force the store to
    /// disk. Empties both caches.
    pub fn sync(&mut self) -> DbResult<()> {
        self.require_writer()?;
        self.require_no_transaction()?;

        let mut result = self.evict_all();
        keep_first(&mut result, self.store.set_alignment(0).map_err(DbError::from));
        keep_first(&mut result, self.meta.save(&mut self.store));
        keep_first(&mut result, self.store.sync().map_err(DbError::from));
        result
    }

    /// Sync, then let the store reclaim the space of dead records
    pub fn optimize(&mut self) -> DbResult<()> {
        self.require_writer()?;
        self.require_no_transaction()?;

        self.sync()?;
        let before = self.store.file_size();
        self.store.set_alignment(-3)?;
        self.store.optimize()?;
        info!(
            name = self.store.name(),
            before,
            after = self.store.file_size(),
            "db.optimize"
        );
        Ok(())
    }

    /// Dump every key/value pair in key order to a tab-separated file.
    ///
    /// Each row is `sequence key value`, the sequence in hexadecimal and the
    /// key and value hex-encoded, so the dump does not depend on byte order
    /// or on the comparator.
    pub fn export<P: AsRef<Path>>(&mut self, path: P) -> DbResult<u64> {
        let file = File::create(path.as_ref())?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);

        let mut rows = 0u64;
        let mut more = self.cursor_first()?;
        while more {
            let Some((key, value)) = self.cursor_record()? else {
                break;
            };
            writer.write_record([format!("{rows:x}"), hex::encode(&key), hex::encode(&value)])?;
            rows += 1;
            more = self.cursor_next()?;
        }
        writer.flush()?;

        info!(name = self.store.name(), rows, file = %path.as_ref().display(), "db.export");
        Ok(rows)
    }

    /// Load a dump written by [`Database::export`] into this empty database.
    /// Duplicates come back in their original order.
    pub fn import<P: AsRef<Path>>(&mut self, path: P) -> DbResult<u64> {
        self.require_writer()?;
        if self.meta.record_count > 0 {
            return Err(DbError::Misc("import requires an empty database".into()));
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(path.as_ref())?;

        let mut rows = Vec::new();
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let malformed = || DbError::Broken(format!("malformed dump row {}", line + 1));
            let [seq, key, value] = [0, 1, 2].map(|i| row.get(i));
            let (Some(seq), Some(key), Some(value)) = (seq, key, value) else {
                return Err(malformed());
            };
            let seq = u64::from_str_radix(seq, 16).map_err(|_| malformed())?;
            let key = hex::decode(key).map_err(|_| malformed())?;
            let value = hex::decode(value).map_err(|_| malformed())?;
            rows.push((seq, key, value));
        }
        rows.sort_by_key(|(seq, _, _)| *seq);

        for (_, key, value) in &rows {
            self.put(key, value, DupMode::AllowDuplicate)?;
        }

        info!(name = self.store.name(), rows = rows.len(), "db.import");
        Ok(rows.len() as u64)
    }
}

impl Database<HashStore> {
    /// Delete a database file
    pub fn remove<P: AsRef<Path>>(path: P) -> DbResult<()> {
        HashStore::remove(path)?;
        Ok(())
    }

    /// Rebuild a damaged database from whatever leaf pages survive.
    ///
    /// The store is salvaged first, then every readable leaf is replayed
    /// into a scratch file next to it, which then replaces the original.
    /// Node pages and metadata are rebuilt rather than trusted. Best
    /// effort: the rebuild runs even if salvaging reported an error, and
    /// that error is returned afterwards. A rebuild that fails leaves the
    /// original in place and removes the scratch file.
    pub fn repair<P: AsRef<Path>>(path: P, cmp: Comparator) -> DbResult<()> {
        let path = path.as_ref();
        let mut result: DbResult<()> = Ok(());

        if let Err(e) = HashStore::repair(path) {
            warn!(path = %path.display(), error = %e, "db.repair.salvage_failed");
            result = Err(e.into());
        }

        let mut source = HashStore::open(path, OpenMode::READER)?;
        let flags = source.flags();
        if flags & FLAG_TREE == 0 {
            return Err(DbError::Broken(format!("{} is not a B+ tree database", path.display())));
        }
        let compressed = flags & FLAG_COMPRESSED != 0;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut prefix = path.file_name().map(OsString::from).unwrap_or_default();
        prefix.push(".");
        // Removed on drop unless persisted over the original
        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(REPAIR_SUFFIX)
            .tempfile_in(dir)?;
        fs::set_permissions(temp.path(), fs::metadata(path)?.permissions())?;

        let mut target = OpenOptions::new()
            .writer(true)
            .create(true)
            .truncate(true)
            .compress(compressed)
            .open(temp.path(), cmp)?;

        let mut leaves = 0usize;
        let mut skipped = 0usize;
        for key in source.iter_keys() {
            let Ok(raw) = <[u8; 4]>::try_from(key.as_slice()) else {
                continue;
            };
            let id = match PageId::from_raw(i32::from_ne_bytes(raw).into()) {
                Some(PageId::Leaf(id)) => id,
                _ => continue,
            };

            let body = match source.get(&key) {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(e) => {
                    warn!(leaf = id.raw(), error = %e, "db.repair.unreadable_leaf");
                    skipped += 1;
                    continue;
                }
            };
            let body = if compressed {
                match serialization::decompress(PageId::Leaf(id), &body) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(leaf = id.raw(), error = %e, "db.repair.unreadable_leaf");
                        skipped += 1;
                        continue;
                    }
                }
            } else {
                body
            };

            for record in serialization::decode_leaf(id, &body).records {
                for value in record.values() {
                    target.put(&record.key, value, DupMode::AllowDuplicate)?;
                }
            }
            leaves += 1;
        }

        let records = target.record_count();
        target.close()?;
        source.close()?;
        drop(source);
        temp.persist(path).map_err(|e| DbError::Io(e.error))?;

        info!(path = %path.display(), leaves, skipped, records, "db.repair");
        result
    }
}
