//! Advisory whole-file locking
//!
//! Writers take an exclusive lock, readers a shared one. The lock lives as
//! long as the file handle it was taken on.

use std::fs::File;
use std::io;
use std::path::Path;

use fs2::FileExt;
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};

/// Take the lock matching the open mode on `file`
pub(crate) fn acquire(file: &File, path: &Path, exclusive: bool, blocking: bool) -> StoreResult<()> {
    let result = match (exclusive, blocking) {
        (true, true) => FileExt::lock_exclusive(file),
        (true, false) => FileExt::try_lock_exclusive(file),
        (false, true) => FileExt::lock_shared(file),
        (false, false) => FileExt::try_lock_shared(file),
    };

    match result {
        Ok(()) => {
            debug!(path = %path.display(), exclusive, "store.lock.acquired");
            Ok(())
        }
        Err(e) if is_contended(&e) => {
            warn!(path = %path.display(), exclusive, "store.lock.contended");
            Err(StoreError::Locked(path.to_path_buf()))
        }
        Err(e) => Err(StoreError::Io(e)),
    }
}

pub(crate) fn release(file: &File, path: &Path) {
    if let Err(e) = FileExt::unlock(file) {
        warn!(path = %path.display(), error = %e, "store.lock.release_failed");
    }
}

fn is_contended(err: &io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error())
}
