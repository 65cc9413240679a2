//! AXIOM Core
//!
//! Wires the web storage subsystems together: configuration, logging, and
//! the `WebStorage` value that opens the database tracker and the
//! application cache and shuts them down again.

mod config;
mod error;
mod storage;

pub use config::Config;
pub use error::CoreError;
pub use storage::{OriginUsage, WebStorage};

// Re-export the subsystems
pub use axiom_appcache::{
    ApplicationCache, ApplicationCacheGroup, ApplicationCacheResource, ApplicationCacheStorage,
    CacheStorageConfig, CacheStorageError,
};
pub use axiom_storage::StorageError;
pub use axiom_webdb::{
    Database, DatabaseContext, DatabaseError, DatabaseManager, DatabaseTracker, ScriptContext,
    SecurityOrigin, SqlError, SqlErrorCode, TrackerConfig, TrackerNotification,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
