//! Transactions
//!
//! `SqlTransaction` is the script-side object handed to callbacks; statements
//! can only be queued on it while one of its callbacks is running. The state
//! machine that executes it lives in `backend`, on the connection worker.

mod backend;
mod state;
mod wrapper;

pub(crate) use backend::SqlTransactionBackend;
pub(crate) use wrapper::TransactionWrapper;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::coordinator::TransactionId;
use crate::error::SqlError;
use crate::statement::{PendingStatement, StatementCallbacks};
use crate::value::SqlValue;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_transaction_id() -> TransactionId {
    TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
}

type TransactionCallback = Box<dyn FnOnce(&SqlTransaction) + Send>;
type TransactionErrorCallback = Box<dyn FnOnce(SqlError) + Send>;
type TransactionSuccessCallback = Box<dyn FnOnce() + Send>;

/// Callbacks of one transaction. Each fires at most once, and exactly one
/// of `on_error` / `on_success` fires.
#[derive(Default)]
pub struct TransactionCallbacks {
    on_transaction: Option<TransactionCallback>,
    on_error: Option<TransactionErrorCallback>,
    on_success: Option<TransactionSuccessCallback>,
}

impl TransactionCallbacks {
    /// Callbacks whose transaction callback is `callback`
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(&SqlTransaction) + Send + 'static,
    {
        Self {
            on_transaction: Some(Box::new(callback)),
            ..Self::default()
        }
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(SqlError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for TransactionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCallbacks")
            .field("on_transaction", &self.on_transaction.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_success", &self.on_success.is_some())
            .finish()
    }
}

#[derive(Default)]
struct StatementQueue {
    accepting: bool,
    pending: VecDeque<PendingStatement>,
}

struct TransactionShared {
    id: TransactionId,
    read_only: bool,
    statements: Mutex<StatementQueue>,
}

#[derive(Clone)]
pub struct SqlTransaction {
    shared: Arc<TransactionShared>,
}

impl SqlTransaction {
    pub(crate) fn new(id: TransactionId, read_only: bool) -> Self {
        Self {
            shared: Arc::new(TransactionShared {
                id,
                read_only,
                statements: Mutex::new(StatementQueue::default()),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    /// Queue a statement. Only valid from inside one of this transaction's
    /// callbacks; anywhere else it is rejected with `DATABASE_ERR`.
    pub fn execute_sql(
        &self,
        sql: &str,
        args: Vec<SqlValue>,
        callbacks: StatementCallbacks,
    ) -> std::result::Result<(), SqlError> {
        let mut queue = self.shared.statements.lock();
        if !queue.accepting {
            return Err(SqlError::database(
                "SQL statements can only be queued from a transaction callback",
            ));
        }
        queue.pending.push_back(PendingStatement::new(
            sql,
            args,
            self.shared.read_only,
            callbacks,
        ));
        Ok(())
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.shared.statements.lock().accepting = accepting;
    }

    pub(crate) fn take_next_statement(&self) -> Option<PendingStatement> {
        self.shared.statements.lock().pending.pop_front()
    }

    /// Stop accepting and drop whatever is still queued
    pub(crate) fn close(&self) -> usize {
        let mut queue = self.shared.statements.lock();
        queue.accepting = false;
        let dropped = queue.pending.len();
        queue.pending.clear();
        dropped
    }

    pub fn pending_statements(&self) -> usize {
        self.shared.statements.lock().pending.len()
    }
}

impl std::fmt::Debug for SqlTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTransaction")
            .field("id", &self.shared.id)
            .field("read_only", &self.shared.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_sql_outside_callback_is_rejected() {
        let transaction = SqlTransaction::new(next_transaction_id(), false);
        let err = transaction
            .execute_sql("SELECT 1", vec![], StatementCallbacks::new())
            .unwrap_err();
        assert_eq!(err.code, crate::SqlErrorCode::Database);
        assert_eq!(transaction.pending_statements(), 0);
    }

    #[test]
    fn test_statements_keep_queue_order() {
        let transaction = SqlTransaction::new(next_transaction_id(), true);
        transaction.set_accepting(true);
        transaction
            .execute_sql("SELECT 1", vec![], StatementCallbacks::new())
            .unwrap();
        transaction
            .execute_sql("SELECT 2", vec![], StatementCallbacks::new())
            .unwrap();

        assert_eq!(transaction.take_next_statement().unwrap().sql(), "SELECT 1");
        assert_eq!(transaction.close(), 1);
        assert!(transaction.take_next_statement().is_none());
    }
}
