//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure during a read or write.
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),

    /// `meta.json` parsed but a required side file is missing or inconsistent.
    #[error("corrupt entry {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// `clear` refused: the directory has content but none of it looks like
    /// cache entries.
    #[error("{path} does not look like a cache root, refusing to clear")]
    NotCacheRoot { path: PathBuf },
}

/// Convenience result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
