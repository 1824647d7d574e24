use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use ahash::AHashMap;
use tracing::{debug, error, info, warn};

use super::error::{StoreError, StoreResult};
use super::{OpenMode, Store, lock};

/// File magic: "ARBS"
const MAGIC: &[u8; 4] = b"ARBS";

/// Current on-disk format version
const VERSION: u32 = 1;

/// Header: magic (4) | version (4) | flags (4) | reserved (4)
pub const HEADER_SIZE: u64 = 16;

/// Frame header: tag (1) | key_len (4) | value_len (4) | padding (4)
const FRAME_HEADER_SIZE: u64 = 13;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

/// Suffix of the scratch file `optimize` compacts into
const OPTIMIZE_SUFFIX: &str = ".opt";

/// Initial capacity of the in-memory index
const INITIAL_BUCKETS: usize = 4096;

/// Location of a live record in the file
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    key_len: u32,
    value_len: u32,
    /// Value bytes plus trailing padding; an overwrite that fits is done in place
    capacity: u32,
}

impl Slot {
    fn frame_len(&self) -> u64 {
        FRAME_HEADER_SIZE + self.key_len as u64 + self.capacity as u64
    }
}

/// Single-file hashed key-value store
///
/// Records are appended as self-describing frames; an in-memory hash index
/// maps each live key to its frame and is rebuilt by scanning the file on
/// open. Overwrites reuse the old frame when the new value fits into its
/// padded capacity, otherwise a new frame is appended and the old one
/// becomes dead space until [`Store::optimize`] compacts the file.
pub struct HashStore {
    file: File,
    path: PathBuf,
    name: String,
    writable: bool,
    locked: bool,
    flags: u32,
    index: AHashMap<Vec<u8>, Slot>,
    /// Offset one past the last frame
    end: u64,
    align: i32,
    dead_bytes: u64,
    fatal: bool,
    closed: bool,
}

impl HashStore {
    /// Open a store file with the given mode
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> StoreResult<Self> {
        Self::open_with(path.as_ref(), mode, false)
    }

    /// Delete a store file
    pub fn remove<P: AsRef<Path>>(path: P) -> StoreResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::FileNotFound(path.display().to_string()));
        }
        std::fs::remove_file(path)?;
        info!(path = %path.display(), "store.removed");
        Ok(())
    }

    /// Salvage a damaged store file in place.
    ///
    /// Every complete frame up to the first damaged one is kept and the rest
    /// of the file is cut off. A damaged header cannot be salvaged.
    pub fn repair<P: AsRef<Path>>(path: P) -> StoreResult<()> {
        let mut store = Self::open_with(
            path.as_ref(),
            OpenMode::WRITER | OpenMode::NO_LOCK,
            true,
        )?;
        store.close()
    }

    fn open_with(path: &Path, mode: OpenMode, salvage: bool) -> StoreResult<Self> {
        let writable = mode.is_writer();
        let create = writable && mode.contains(OpenMode::CREATE);
        if !create && !path.exists() {
            return Err(StoreError::FileNotFound(path.display().to_string()));
        }

        let mut options = OpenOptions::new();
        options.read(true);
        if writable {
            options.write(true).create(create);
        }
        let file = options.open(path)?;

        let locked = !mode.contains(OpenMode::NO_LOCK);
        if locked {
            let blocking = !mode.contains(OpenMode::LOCK_NONBLOCKING);
            lock::acquire(&file, path, writable, blocking)?;
        }
        if writable && mode.contains(OpenMode::TRUNCATE) {
            file.set_len(0)?;
        }

        let mut store = Self {
            file,
            path: path.to_path_buf(),
            name: path.display().to_string(),
            writable,
            locked,
            flags: 0,
            index: AHashMap::with_capacity(INITIAL_BUCKETS),
            end: HEADER_SIZE,
            align: 0,
            dead_bytes: 0,
            fatal: false,
            closed: false,
        };

        if store.file.metadata()?.len() == 0 {
            if !writable {
                return Err(StoreError::BadHeader(store.name.clone()));
            }
            store.write_header()?;
        } else {
            store.read_header()?;
            store.scan(salvage)?;
        }

        debug!(
            path = %store.name,
            writable,
            records = store.index.len(),
            "store.opened"
        );
        Ok(store)
    }

    fn read_header(&mut self) -> StoreResult<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(0))?;
        if self.file.read_exact(&mut buf).is_err() || &buf[0..4] != MAGIC {
            return Err(StoreError::BadHeader(self.name.clone()));
        }

        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        self.flags = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(())
    }

    fn write_header(&mut self) -> StoreResult<()> {
        let buf = encode_header(self.flags);
        self.write_at(0, &buf)
    }

    /// Rebuild the index from the frames on disk
    fn scan(&mut self, salvage: bool) -> StoreResult<()> {
        let len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut offset = HEADER_SIZE;
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        while offset < len {
            let frame = if offset + FRAME_HEADER_SIZE <= len {
                reader.read_exact(&mut header)?;
                let key_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
                let value_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
                let padding = u32::from_le_bytes([header[9], header[10], header[11], header[12]]);
                let slot = Slot {
                    offset,
                    key_len,
                    value_len,
                    capacity: value_len.saturating_add(padding),
                };
                let valid_tag = header[0] == TAG_PUT || header[0] == TAG_DELETE;
                (valid_tag && offset + slot.frame_len() <= len).then_some((header[0], slot))
            } else {
                None
            };

            let Some((tag, slot)) = frame else {
                if salvage {
                    warn!(
                        path = %self.name,
                        offset,
                        dropped = len - offset,
                        "store.repair.truncated"
                    );
                    break;
                }
                return Err(StoreError::CorruptFrame(offset));
            };

            let mut key = vec![0u8; slot.key_len as usize];
            reader.read_exact(&mut key)?;
            reader.seek_relative(slot.capacity as i64)?;

            if tag == TAG_PUT {
                if let Some(old) = self.index.insert(key, slot) {
                    self.dead_bytes += old.frame_len();
                }
            } else {
                if let Some(old) = self.index.remove(&key) {
                    self.dead_bytes += old.frame_len();
                }
                self.dead_bytes += slot.frame_len();
            }
            offset += slot.frame_len();
        }

        self.end = offset;
        if salvage && offset < len {
            self.file.set_len(offset)?;
        }
        Ok(())
    }

    fn check_writable(&self) -> StoreResult<()> {
        if !self.writable {
            return Err(StoreError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> StoreResult<()> {
        if self.fatal {
            return Err(StoreError::Fatal);
        }
        let result = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(buf));
        if let Err(e) = result {
            self.fatal = true;
            error!(path = %self.name, offset, error = %e, "store.write_failed");
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    fn write_frame(
        &mut self,
        offset: u64,
        tag: u8,
        key: &[u8],
        value: &[u8],
        padding: u32,
    ) -> StoreResult<()> {
        let buf = encode_frame(tag, key, value, padding)?;
        self.write_at(offset, &buf)
    }

    /// Padding appended after a value under the current alignment policy
    fn padding_for(&self, key_len: usize, value_len: usize) -> u32 {
        match self.align {
            align if align > 0 => {
                let base = FRAME_HEADER_SIZE + key_len as u64 + value_len as u64;
                let align = align as u64;
                (base.div_ceil(align) * align - base) as u32
            }
            align if align < 0 => {
                let shift = align.unsigned_abs().min(31);
                (value_len >> shift) as u32
            }
            _ => 0,
        }
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> StoreResult<Slot> {
        let padding = self.padding_for(key.len(), value.len());
        let slot = Slot {
            offset: self.end,
            key_len: checked_len(key.len())?,
            value_len: checked_len(value.len())?,
            capacity: checked_len(value.len())?.saturating_add(padding),
        };
        self.write_frame(slot.offset, TAG_PUT, key, value, padding)?;
        self.end += slot.frame_len();
        Ok(slot)
    }

    fn read_value(&mut self, slot: Slot) -> StoreResult<Vec<u8>> {
        let mut value = vec![0u8; slot.value_len as usize];
        self.file.seek(SeekFrom::Start(
            slot.offset + FRAME_HEADER_SIZE + slot.key_len as u64,
        ))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Bytes held by overwritten or deleted frames
    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn optimize_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(OPTIMIZE_SUFFIX);
        PathBuf::from(name)
    }

    /// Write every live record, padded under the current alignment, into a
    /// fresh file at `temp` and force it to disk. Returns the new file
    /// (locked like the current one), its index and its end offset.
    fn write_compacted(&mut self, temp: &Path) -> StoreResult<(File, AHashMap<Vec<u8>, Slot>, u64)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp)?;
        if self.locked {
            lock::acquire(&file, temp, true, false)?;
        }

        let mut index = AHashMap::with_capacity(self.index.len().max(INITIAL_BUCKETS));
        let mut end = HEADER_SIZE;
        {
            let mut writer = BufWriter::new(&file);
            writer.write_all(&encode_header(self.flags))?;
            for key in self.iter_keys() {
                let Some(slot) = self.index.get(&key).copied() else {
                    continue;
                };
                let value = self.read_value(slot)?;
                let padding = self.padding_for(key.len(), value.len());
                writer.write_all(&encode_frame(TAG_PUT, &key, &value, padding)?)?;

                let slot = Slot {
                    offset: end,
                    key_len: slot.key_len,
                    value_len: slot.value_len,
                    capacity: slot.value_len.saturating_add(padding),
                };
                end += slot.frame_len();
                index.insert(key, slot);
            }
            writer.flush()?;
        }
        file.sync_all()?;
        Ok((file, index, end))
    }
}

/// Drop a half-written scratch file; a directory squatting on the name is
/// left alone
fn discard_temp(temp: &Path) {
    if temp.is_file() {
        if let Err(e) = fs::remove_file(temp) {
            warn!(path = %temp.display(), error = %e, "store.temp_remove_failed");
        }
    }
}

fn checked_len(len: usize) -> StoreResult<u32> {
    u32::try_from(len).map_err(|_| StoreError::TooLarge(len))
}

fn encode_header(flags: u32) -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(MAGIC);
    buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
    buf[8..12].copy_from_slice(&flags.to_le_bytes());
    buf
}

fn encode_frame(tag: u8, key: &[u8], value: &[u8], padding: u32) -> StoreResult<Vec<u8>> {
    let key_len = checked_len(key.len())?;
    let value_len = checked_len(value.len())?;

    let total = FRAME_HEADER_SIZE as usize + key.len() + value.len() + padding as usize;
    let mut buf = Vec::with_capacity(total);
    buf.push(tag);
    buf.extend_from_slice(&key_len.to_le_bytes());
    buf.extend_from_slice(&value_len.to_le_bytes());
    buf.extend_from_slice(&padding.to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf.resize(total, 0);
    Ok(buf)
}

impl Store for HashStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn flags(&self) -> u32 {
        self.flags
    }

    fn set_flags(&mut self, flags: u32) -> StoreResult<()> {
        self.check_writable()?;
        self.flags = flags;
        self.write_header()
    }

    fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.index.get(key).copied() {
            Some(slot) => self.read_value(slot).map(Some),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> StoreResult<bool> {
        self.check_writable()?;

        if let Some(slot) = self.index.get(key).copied() {
            if !overwrite {
                return Ok(false);
            }
            let value_len = checked_len(value.len())?;
            if value_len <= slot.capacity {
                let padding = slot.capacity - value_len;
                self.write_frame(slot.offset, TAG_PUT, key, value, padding)?;
                self.index.insert(key.to_vec(), Slot { value_len, ..slot });
                return Ok(true);
            }
            self.dead_bytes += slot.frame_len();
        }

        let slot = self.append(key, value)?;
        self.index.insert(key.to_vec(), slot);
        Ok(true)
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<bool> {
        self.check_writable()?;

        let Some(old) = self.index.remove(key) else {
            return Ok(false);
        };
        let tombstone = Slot {
            offset: self.end,
            key_len: old.key_len,
            value_len: 0,
            capacity: 0,
        };
        self.write_frame(tombstone.offset, TAG_DELETE, key, &[], 0)?;
        self.end += tombstone.frame_len();
        self.dead_bytes += old.frame_len() + tombstone.frame_len();
        Ok(true)
    }

    fn record_count(&self) -> usize {
        self.index.len()
    }

    fn iter_keys(&self) -> Vec<Vec<u8>> {
        let mut entries: Vec<(u64, &Vec<u8>)> = self
            .index
            .iter()
            .map(|(key, slot)| (slot.offset, key))
            .collect();
        entries.sort_unstable_by_key(|(offset, _)| *offset);
        entries.into_iter().map(|(_, key)| key.clone()).collect()
    }

    fn sync(&mut self) -> StoreResult<()> {
        if !self.writable {
            return Ok(());
        }
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Rewrite the header and push file data to the device, skipping the
    /// metadata flush a full `sync` does
    fn memory_sync(&mut self) -> StoreResult<()> {
        if !self.writable {
            return Ok(());
        }
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn set_alignment(&mut self, align: i32) -> StoreResult<()> {
        self.check_writable()?;
        self.align = align;
        Ok(())
    }

    /// Compact into a scratch file next to the store, then rename it over
    /// the original. The original stays untouched until the rename.
    fn optimize(&mut self) -> StoreResult<()> {
        self.check_writable()?;
        if self.fatal {
            return Err(StoreError::Fatal);
        }

        let before = self.end;
        let temp = self.optimize_path();
        let (file, index, end) = match self.write_compacted(&temp) {
            Ok(compacted) => compacted,
            Err(e) => {
                warn!(path = %self.name, error = %e, "store.optimize_failed");
                discard_temp(&temp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp, &self.path) {
            warn!(path = %self.name, error = %e, "store.optimize_failed");
            drop(file);
            discard_temp(&temp);
            return Err(StoreError::Io(e));
        }

        if self.locked {
            lock::release(&self.file, &self.path);
        }
        self.file = file;
        self.index = index;
        self.end = end;
        self.dead_bytes = 0;

        info!(
            path = %self.name,
            before,
            after = self.end,
            records = self.index.len(),
            "store.optimize"
        );
        Ok(())
    }

    fn fatal_error(&self) -> bool {
        self.fatal
    }

    fn file_size(&self) -> u64 {
        self.end
    }

    fn inode(&self) -> u64 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            self.file.metadata().map(|m| m.ino()).unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            0
        }
    }

    fn mtime(&self) -> i64 {
        self.file
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.sync();
        if self.locked {
            lock::release(&self.file, &self.path);
        }
        debug!(path = %self.name, "store.closed");
        result
    }
}

impl Drop for HashStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.name, error = %e, "store.close_on_drop_failed");
        }
    }
}
