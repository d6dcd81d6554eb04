//! Error types for the metadata store.

use thiserror::Error;

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O failure opening the data directory or lock file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process already holds the data directory's lock file.
    #[error("data directory is already locked by another process")]
    AlreadyLocked,

    /// A row was expected but not found.
    #[error("not found")]
    NotFound,
}
