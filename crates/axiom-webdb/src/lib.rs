//! AXIOM Web SQL Databases
//!
//! Script-visible databases backed by one SQLite file per (origin, name):
//! - `Database` handles queue transactions, each run by a connection worker
//! - `SqlTransactionCoordinator` serializes transactions per database file
//! - `DatabaseTracker` owns the on-disk layout, quotas and usage
//! - callbacks are delivered to the `ScriptContext` that scheduled the work

mod backend;
mod context;
mod coordinator;
mod database;
mod details;
mod error;
mod manager;
mod origin;
mod quota;
mod statement;
mod tracker;
mod transaction;
mod value;

pub use context::{ScriptContext, ScriptEventLoop};
pub use coordinator::{
    ConnectionId, CoordinatorIdentity, CoordinatorLock, LockError, LockRequest,
    SqlTransactionCoordinator, TransactionId,
};
pub use database::{Database, DatabaseCallback};
pub use details::DatabaseDetails;
pub use error::{DatabaseError, SqlError, SqlErrorCode};
pub use manager::{DatabaseContext, DatabaseManager};
pub use origin::SecurityOrigin;
pub use quota::{QuotaDecision, QuotaHandler, QuotaRequest};
pub use statement::{StatementCallbacks, StatementErrorDecision};
pub use tracker::{
    CreationGuard, DatabaseTracker, TrackerConfig, TrackerNotification, DEFAULT_ORIGIN_QUOTA,
};
pub use transaction::{SqlTransaction, TransactionCallbacks};
pub use value::{SqlResultSet, SqlValue};

pub type Result<T> = std::result::Result<T, DatabaseError>;
