use thiserror::Error;

use crate::btree::PageError;
use crate::file::StoreError;

/// Result type for engine operations
pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced by a [`Database`](super::Database) handle
#[derive(Debug, Error)]
pub enum DbError {
    /// Writer-only call on a reader, or a call the transaction state forbids
    #[error("Invalid mode: {0}")]
    Mode(&'static str),

    #[error("Broken database: {0}")]
    Broken(String),

    #[error("Invalid operation: {0}")]
    Misc(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Page error: {0}")]
    Page(#[from] PageError),

    #[error("Cannot read/write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export file error: {0}")]
    Csv(#[from] csv::Error),
}

impl DbError {
    /// Whether the error points at damaged on-disk data
    pub fn is_broken(&self) -> bool {
        match self {
            DbError::Broken(_) | DbError::Page(_) => true,
            DbError::Store(e) => e.is_corruption(),
            _ => false,
        }
    }
}
