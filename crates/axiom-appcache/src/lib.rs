//! AXIOM Application Cache Storage
//!
//! Persists application cache groups, their newest cache and every cached
//! resource in `ApplicationCache.db`. Storing a new cache is all or nothing:
//! the SQLite transaction rolls back and a `StorageIdJournal` restores the
//! in-memory storage ids, so a failure leaves the previous cache in charge.

mod cache;
mod error;
mod group;
mod journal;
mod resource;
mod storage;

pub use cache::{ApplicationCache, FallbackEntry};
pub use error::CacheStorageError;
pub use group::ApplicationCacheGroup;
pub use journal::StorageIdJournal;
pub use resource::{ApplicationCacheResource, ResourceResponse, ResourceType};
pub use storage::{ApplicationCacheStorage, CacheStorageConfig, DEFAULT_FLAT_FILE_THRESHOLD};

pub type Result<T> = std::result::Result<T, CacheStorageError>;
