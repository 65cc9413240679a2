//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] axiom_storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] axiom_webdb::DatabaseError),

    #[error("Application cache error: {0}")]
    ApplicationCache(#[from] axiom_appcache::CacheStorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Web storage has been shut down")]
    ShutDown,
}
