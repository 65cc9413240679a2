//! Application cache error types

use thiserror::Error;

use axiom_storage::StorageError;

#[derive(Error, Debug)]
pub enum CacheStorageError {
    #[error("Origin {origin} would exceed its application cache quota: {space_needed} bytes needed")]
    OriginQuotaExceeded { origin: String, space_needed: u64 },

    #[error("Application cache is full: {space_needed} more bytes needed")]
    DiskFull { space_needed: u64 },

    #[error("Not stored: {0}")]
    NotStored(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheStorageError {
    /// True when SQLite hit the page limit set by `set_maximum_size`
    pub fn is_disk_full(&self) -> bool {
        match self {
            CacheStorageError::DiskFull { .. } => true,
            CacheStorageError::Storage(err) => err.is_disk_full(),
            CacheStorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::DiskFull
            }
            _ => false,
        }
    }
}
