use thiserror::Error;

/// Errors raised while encoding or decoding pages
#[derive(Debug, Clone, Error)]
pub enum PageError {
    #[error("Corrupted node page {0}: {1}")]
    CorruptNode(u32, String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error on page {0}: {1}")]
    Decompression(u32, String),
}

pub type PageResult<T> = Result<T, PageError>;
