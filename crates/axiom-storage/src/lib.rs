//! AXIOM Storage Layer
//!
//! Thin synchronous wrapper over a single SQLite connection, plus the
//! schemas of the catalogs kept by the database tracker and the
//! application cache. A `SqliteDatabase` is owned by exactly one thread
//! at a time; sharing is the caller's business.

mod database;
mod error;
mod migrations;

pub use database::{InterruptFlag, JournalMode, SqliteDatabase};
pub use error::StorageError;
pub use migrations::{run_migrations, schema_applied_at, Catalog};

pub type Result<T> = std::result::Result<T, StorageError>;
