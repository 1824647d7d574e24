use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Database file is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("Invalid store header in {0}")]
    BadHeader(String),

    #[error("Unsupported store version: {0}")]
    UnsupportedVersion(u32),

    #[error("Corrupted record frame at offset {0}")]
    CorruptFrame(u64),

    #[error("Record too large: {0} bytes")]
    TooLarge(usize),

    #[error("Store opened read-only: {0}")]
    ReadOnly(String),

    #[error("Store has a fatal error and refuses further writes")]
    Fatal,
}

impl StoreError {
    /// Whether the error means the file content cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::BadHeader(_) | StoreError::UnsupportedVersion(_) | StoreError::CorruptFrame(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
