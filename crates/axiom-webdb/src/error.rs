//! Database error types
//!
//! `DatabaseError` is what Rust callers see from opening, tracking and
//! deleting databases. `SqlError` is what script callbacks see: a numeric
//! code plus a message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use axiom_storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlErrorCode {
    Unknown,
    Database,
    Version,
    TooLarge,
    Quota,
    Syntax,
    Constraint,
    Timeout,
}

impl SqlErrorCode {
    /// Numeric code exposed to scripts
    pub fn code(&self) -> u16 {
        match self {
            SqlErrorCode::Unknown => 0,
            SqlErrorCode::Database => 1,
            SqlErrorCode::Version => 2,
            SqlErrorCode::TooLarge => 3,
            SqlErrorCode::Quota => 4,
            SqlErrorCode::Syntax => 5,
            SqlErrorCode::Constraint => 6,
            SqlErrorCode::Timeout => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SqlErrorCode::Unknown => "UNKNOWN_ERR",
            SqlErrorCode::Database => "DATABASE_ERR",
            SqlErrorCode::Version => "VERSION_ERR",
            SqlErrorCode::TooLarge => "TOO_LARGE_ERR",
            SqlErrorCode::Quota => "QUOTA_ERR",
            SqlErrorCode::Syntax => "SYNTAX_ERR",
            SqlErrorCode::Constraint => "CONSTRAINT_ERR",
            SqlErrorCode::Timeout => "TIMEOUT_ERR",
        }
    }
}

impl std::fmt::Display for SqlErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error delivered to statement and transaction error callbacks
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct SqlError {
    pub code: SqlErrorCode,
    pub message: String,
}

impl SqlError {
    pub fn new(code: SqlErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(SqlErrorCode::Database, message)
    }

    pub fn quota() -> Self {
        Self::new(
            SqlErrorCode::Quota,
            "there was not enough remaining storage space, or the storage quota was reached and the user declined to allow more space",
        )
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Version mismatch: expected {expected:?}, found {actual:?}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Quota exceeded for {origin}: {requested} bytes requested, {usage} in use, quota is {quota}")]
    QuotaExceeded {
        origin: String,
        usage: u64,
        requested: u64,
        quota: u64,
    },

    #[error("Total quota exceeded: {requested} bytes requested, {usage} in use, limit is {limit}")]
    TotalQuotaExceeded {
        usage: u64,
        requested: u64,
        limit: u64,
    },

    #[error("Database {name:?} of {origin} is being deleted")]
    BeingDeleted { origin: String, name: String },

    #[error("Database {name:?} of {origin} is being created")]
    BeingCreated { origin: String, name: String },

    #[error("Database not found: {0}")]
    NotFound(String),

    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("Database tracker has been shut down")]
    TrackerClosed,

    #[error("Script context has stopped its databases")]
    ContextStopped,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatabaseError {
    /// Code reported to scripts when this error ends an operation
    pub fn code(&self) -> SqlErrorCode {
        match self {
            DatabaseError::VersionMismatch { .. } => SqlErrorCode::Version,
            DatabaseError::QuotaExceeded { .. } | DatabaseError::TotalQuotaExceeded { .. } => {
                SqlErrorCode::Quota
            }
            DatabaseError::Storage(StorageError::Interrupted) => SqlErrorCode::Timeout,
            DatabaseError::Storage(err) if err.is_disk_full() => SqlErrorCode::Quota,
            DatabaseError::InvalidOrigin(_) => SqlErrorCode::Unknown,
            _ => SqlErrorCode::Database,
        }
    }

    pub fn to_sql_error(&self) -> SqlError {
        SqlError::new(self.code(), self.to_string())
    }
}
