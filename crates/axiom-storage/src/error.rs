//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database is not open")]
    Closed,

    #[error("Database operation interrupted")]
    Interrupted,

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl StorageError {
    /// SQLite primary result code, when the failure came from SQLite itself
    pub fn sqlite_code(&self) -> Option<rusqlite::ErrorCode> {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => Some(err.code),
            _ => None,
        }
    }

    /// True when SQLite refused to grow the file past its page limit
    pub fn is_disk_full(&self) -> bool {
        self.sqlite_code() == Some(rusqlite::ErrorCode::DiskFull)
    }
}
