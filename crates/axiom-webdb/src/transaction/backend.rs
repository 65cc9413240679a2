//! Transaction execution
//!
//! Runs on the connection worker, one state per step. Every callback is a
//! round trip to the script context: the worker posts it and waits for the
//! acknowledgement, so the database is never touched while script code runs
//! and the order of callbacks is the order of states.

use std::sync::Arc;

use axiom_storage::{SqliteDatabase, StorageError};

use crate::backend::{self, DatabaseBackend};
use crate::coordinator::{CoordinatorLock, LockError, LockRequest, TransactionId};
use crate::error::{SqlError, SqlErrorCode};
use crate::quota::{QuotaDecision, QuotaRequest};
use crate::statement::{PendingStatement, StatementErrorDecision, StatementOutcome};
use crate::value::SqlResultSet;

use super::state::TransactionState;
use super::wrapper::{PreflightOutcome, TransactionWrapper};
use super::{SqlTransaction, TransactionCallbacks};

pub(crate) struct SqlTransactionBackend {
    database: Arc<DatabaseBackend>,
    transaction: SqlTransaction,
    callbacks: TransactionCallbacks,
    wrapper: TransactionWrapper,
    state: TransactionState,
    lock: Option<CoordinatorLock>,
    current: Option<PendingStatement>,
    current_results: Option<SqlResultSet>,
    current_error: Option<SqlError>,
    /// Statements that succeeded so far, replayed if SQLite rolls back
    executed: Vec<PendingStatement>,
    /// Quota negotiation already happened for the current statement
    quota_negotiated: bool,
    modified: bool,
    error: Option<SqlError>,
}

impl SqlTransactionBackend {
    pub fn new(
        database: Arc<DatabaseBackend>,
        id: TransactionId,
        read_only: bool,
        callbacks: TransactionCallbacks,
        wrapper: TransactionWrapper,
    ) -> Self {
        Self {
            database,
            transaction: SqlTransaction::new(id, read_only),
            callbacks,
            wrapper,
            state: TransactionState::AcquireLock,
            lock: None,
            current: None,
            current_results: None,
            current_error: None,
            executed: Vec::new(),
            quota_negotiated: false,
            modified: false,
            error: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    fn read_only(&self) -> bool {
        self.transaction.is_read_only()
    }

    /// Drive the transaction to its end on the connection worker
    pub fn run(mut self: Box<Self>, conn: &mut SqliteDatabase) {
        tracing::debug!(
            transaction = %self.id(),
            connection = %self.database.id(),
            read_only = self.read_only(),
            version_change = self.wrapper.is_version_change(),
            "Running transaction"
        );

        loop {
            let next = match self.state {
                TransactionState::AcquireLock => self.acquire_lock(),
                TransactionState::OpenTransactionAndPreflight => {
                    self.open_transaction_and_preflight(conn)
                }
                TransactionState::DeliverTransactionCallback => self.deliver_transaction_callback(),
                TransactionState::RunStatements => self.run_statements(conn),
                TransactionState::DeliverStatementCallback => self.deliver_statement_callback(),
                TransactionState::DeliverQuotaIncreaseCallback => {
                    self.deliver_quota_increase_callback(conn)
                }
                TransactionState::DeliverStatementErrorCallback => {
                    self.deliver_statement_error_callback(conn)
                }
                TransactionState::PostflightAndCommit => self.postflight_and_commit(conn),
                TransactionState::DeliverSuccessCallback => self.deliver_success_callback(),
                TransactionState::HandleTransactionError => self.handle_transaction_error(conn),
                TransactionState::DeliverTransactionErrorCallback => {
                    self.deliver_transaction_error_callback()
                }
                TransactionState::CleanupAndTerminate => self.cleanup_and_terminate(conn),
                TransactionState::End => break,
            };

            debug_assert!(
                self.state.can_transition_to(next),
                "invalid transaction transition {} -> {}",
                self.state,
                next
            );
            tracing::trace!(transaction = %self.id(), from = %self.state, to = %next, "Transaction step");
            if next.is_callback_delivery() {
                tracing::trace!(transaction = %self.id(), state = %next, "Delivering callback");
            }
            self.state = next;
        }
    }

    /// The transaction never reached a worker: report `error` and finish
    pub fn fail_unscheduled(mut self: Box<Self>, error: SqlError) {
        self.transaction.close();
        tracing::debug!(transaction = %self.id(), error = %error, "Transaction not scheduled");
        if let Some(callback) = self.callbacks.on_error.take() {
            self.database.script_context().post(move || callback(error));
        }
    }

    fn fail(&mut self, error: SqlError) -> TransactionState {
        if self.error.is_none() {
            self.error = Some(error);
        }
        TransactionState::HandleTransactionError
    }

    /// Run `task` on the script context with statement queuing open
    fn deliver<F, R>(&self, task: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.transaction.set_accepting(true);
        let result = self.database.script_context().call(task);
        self.transaction.set_accepting(false);
        result
    }

    fn apply_maximum_size(&self, conn: &SqliteDatabase) {
        let max_size = self
            .database
            .tracker()
            .max_size_for_database(self.database.origin(), self.database.name());
        if let Err(e) = conn.set_maximum_size(max_size) {
            tracing::warn!(transaction = %self.id(), error = %e, "Failed to apply maximum size");
        }
    }

    fn total_quota_binds(&self) -> bool {
        self.database
            .tracker()
            .total_quota_binds(self.database.origin(), self.database.name())
    }

    // === States ===

    fn acquire_lock(&mut self) -> TransactionState {
        if let Some(error) = self.database.termination_error() {
            return self.fail(error);
        }

        let request = LockRequest {
            identity: self.database.identity().clone(),
            transaction: self.id(),
            connection: self.database.id(),
            read_only: self.read_only(),
        };
        let database = Arc::clone(&self.database);
        let should_abort = move || database.termination_error().is_some();

        let acquired = self.database.coordinator().acquire(request, &should_abort);
        match acquired {
            Ok(lock) => {
                self.lock = Some(lock);
                TransactionState::OpenTransactionAndPreflight
            }
            Err(LockError::Cancelled) => {
                let error = self
                    .database
                    .termination_error()
                    .unwrap_or_else(|| SqlError::database("unable to acquire the database lock"));
                self.fail(error)
            }
            Err(LockError::ShutDown) => {
                self.fail(SqlError::database("database coordinator has shut down"))
            }
        }
    }

    fn open_transaction_and_preflight(&mut self, conn: &SqliteDatabase) -> TransactionState {
        if let Some(error) = self.database.termination_error() {
            return self.fail(error);
        }

        self.apply_maximum_size(conn);
        if let Err(e) = conn.begin(!self.read_only()) {
            return self.fail(storage_failure("unable to begin transaction", &e));
        }

        let actual = match backend::read_version(conn) {
            Ok(version) => version,
            Err(e) => {
                return self.fail(SqlError::database(format!(
                    "unable to read version ({e})"
                )))
            }
        };
        self.database.cache_version(&actual);

        match self.wrapper.preflight(&self.database, &actual) {
            PreflightOutcome::Proceed => TransactionState::DeliverTransactionCallback,
            PreflightOutcome::Fail(error) => self.fail(error),
        }
    }

    fn deliver_transaction_callback(&mut self) -> TransactionState {
        if let Some(callback) = self.callbacks.on_transaction.take() {
            let transaction = self.transaction.clone();
            if self.deliver(move || callback(&transaction)).is_none() {
                return self.fail(SqlError::new(
                    SqlErrorCode::Unknown,
                    "the SQLTransactionCallback was null or threw an exception",
                ));
            }
        }
        TransactionState::RunStatements
    }

    fn run_statements(&mut self, conn: &SqliteDatabase) -> TransactionState {
        if let Some(error) = self.database.termination_error() {
            return self.fail(error);
        }

        // A statement is still current only when it is being retried
        if self.current.is_none() {
            match self.transaction.take_next_statement() {
                Some(statement) => {
                    self.current = Some(statement);
                    self.quota_negotiated = false;
                }
                None => return TransactionState::PostflightAndCommit,
            }
        }
        let Some(statement) = self.current.as_ref() else {
            return TransactionState::PostflightAndCommit;
        };

        self.apply_maximum_size(conn);
        match statement.execute(conn) {
            StatementOutcome::Success { results, modified } => {
                self.executed.push(statement.replica());
                self.modified |= modified;
                self.current_results = Some(results);
                TransactionState::DeliverStatementCallback
            }
            StatementOutcome::QuotaExceeded
                if !self.quota_negotiated && !self.total_quota_binds() =>
            {
                TransactionState::DeliverQuotaIncreaseCallback
            }
            StatementOutcome::QuotaExceeded => self.statement_failed(SqlError::quota(), conn),
            StatementOutcome::Failed(error) => self.statement_failed(error, conn),
        }
    }

    fn statement_failed(&mut self, error: SqlError, conn: &SqliteDatabase) -> TransactionState {
        tracing::debug!(
            transaction = %self.id(),
            code = %error.code,
            message = %error.message,
            "Statement failed"
        );

        let has_callback = self
            .current
            .as_ref()
            .is_some_and(PendingStatement::has_error_callback);
        // SQLite may roll the whole transaction back on its own
        if has_callback && conn.in_transaction() {
            self.current_error = Some(error);
            TransactionState::DeliverStatementErrorCallback
        } else {
            self.current = None;
            self.fail(error)
        }
    }

    fn deliver_statement_callback(&mut self) -> TransactionState {
        let mut statement = self.current.take();
        let results = self.current_results.take().unwrap_or_default();

        if let Some(callback) = statement.as_mut().and_then(PendingStatement::take_success_callback) {
            let transaction = self.transaction.clone();
            if self.deliver(move || callback(&transaction, &results)).is_none() {
                return self.fail(SqlError::new(
                    SqlErrorCode::Unknown,
                    "the statement callback raised an exception or statement error callback did not return false",
                ));
            }
        }
        TransactionState::RunStatements
    }

    /// One negotiation per statement: a raised quota retries the statement,
    /// anything else fails it with `QUOTA_ERR`
    fn deliver_quota_increase_callback(&mut self, conn: &SqliteDatabase) -> TransactionState {
        self.quota_negotiated = true;

        let tracker = self.database.tracker();
        let origin = self.database.origin();
        let name = self.database.name();
        let quota = tracker.quota_for_origin(origin);
        let request = QuotaRequest {
            origin: origin.clone(),
            database_name: name.to_string(),
            current_quota: quota,
            current_usage: tracker.usage_for_origin(origin),
            requested_usage: quota.saturating_add(1),
        };
        tracker.notify_quota_exceeded(origin, name, request.current_usage, request.requested_usage);

        let decision = match self.database.quota_handler() {
            Some(handler) => self
                .database
                .script_context()
                .call(move || handler(&request))
                .unwrap_or(QuotaDecision::Deny),
            None => QuotaDecision::Deny,
        };

        if let Some(raised) = decision.raised_quota(quota) {
            match tracker.set_quota(origin, raised) {
                Ok(()) => {
                    tracing::info!(
                        transaction = %self.id(),
                        origin = %origin,
                        quota = raised,
                        "Quota raised, retrying statement"
                    );
                    if conn.in_transaction() {
                        return TransactionState::RunStatements;
                    }
                    return match self.reopen_transaction(conn) {
                        Ok(()) => TransactionState::RunStatements,
                        Err(error) => {
                            self.current = None;
                            self.fail(error)
                        }
                    };
                }
                Err(e) => {
                    tracing::warn!(origin = %origin, error = %e, "Failed to store raised quota");
                }
            }
        }

        self.statement_failed(SqlError::quota(), conn)
    }

    /// `SQLITE_FULL` rolls back the whole transaction. Begin again and run
    /// the statements that already succeeded, under the raised maximum size.
    fn reopen_transaction(&self, conn: &SqliteDatabase) -> Result<(), SqlError> {
        self.apply_maximum_size(conn);
        conn.begin(!self.read_only())
            .map_err(|e| storage_failure("unable to begin transaction", &e))?;

        tracing::debug!(
            transaction = %self.id(),
            statements = self.executed.len(),
            "Replaying statements after rollback"
        );
        for statement in &self.executed {
            match statement.execute(conn) {
                StatementOutcome::Success { .. } => {}
                StatementOutcome::QuotaExceeded => return Err(SqlError::quota()),
                StatementOutcome::Failed(error) => return Err(error),
            }
        }
        Ok(())
    }

    fn deliver_statement_error_callback(&mut self, conn: &SqliteDatabase) -> TransactionState {
        let mut statement = self.current.take();
        let error = self
            .current_error
            .take()
            .unwrap_or_else(|| SqlError::new(SqlErrorCode::Unknown, "statement failed"));

        let decision = match statement.as_mut().and_then(PendingStatement::take_error_callback) {
            Some(callback) => {
                let transaction = self.transaction.clone();
                let delivered = error.clone();
                self.deliver(move || callback(&transaction, &delivered))
                    .unwrap_or(StatementErrorDecision::Abort)
            }
            None => StatementErrorDecision::Abort,
        };

        match decision {
            StatementErrorDecision::Continue if conn.in_transaction() => {
                TransactionState::RunStatements
            }
            StatementErrorDecision::Continue => {
                self.fail(SqlError::database("the transaction was rolled back by SQLite"))
            }
            StatementErrorDecision::Abort => self.fail(error),
        }
    }

    fn postflight_and_commit(&mut self, conn: &SqliteDatabase) -> TransactionState {
        self.transaction.close();
        if let Some(error) = self.database.termination_error() {
            return self.fail(error);
        }

        if let Err(error) = self.wrapper.postflight(&self.database, conn) {
            return self.fail(error);
        }

        if let Err(e) = conn.commit() {
            self.wrapper.handle_commit_failed_after_postflight(&self.database);
            let error = if e.is_disk_full() {
                SqlError::quota()
            } else {
                storage_failure("unable to commit transaction", &e)
            };
            return self.fail(error);
        }

        // Let the next transaction in before delivering callbacks
        self.lock = None;

        if self.modified || self.wrapper.is_version_change() {
            self.database.tracker().database_modified(
                self.database.origin(),
                self.database.name(),
                self.database.path(),
            );
        }
        TransactionState::DeliverSuccessCallback
    }

    fn deliver_success_callback(&mut self) -> TransactionState {
        if let Some(callback) = self.callbacks.on_success.take() {
            if self.deliver(callback).is_none() {
                tracing::debug!(transaction = %self.id(), "Success callback undeliverable");
            }
        }
        TransactionState::CleanupAndTerminate
    }

    fn handle_transaction_error(&mut self, conn: &SqliteDatabase) -> TransactionState {
        self.transaction.close();
        if let Err(e) = conn.rollback() {
            tracing::warn!(transaction = %self.id(), error = %e, "Rollback failed");
        }
        self.lock = None;
        TransactionState::DeliverTransactionErrorCallback
    }

    fn deliver_transaction_error_callback(&mut self) -> TransactionState {
        let error = self
            .error
            .take()
            .unwrap_or_else(|| SqlError::new(SqlErrorCode::Unknown, "transaction failed"));
        tracing::debug!(
            transaction = %self.id(),
            code = %error.code,
            message = %error.message,
            "Transaction failed"
        );

        if let Some(callback) = self.callbacks.on_error.take() {
            if self.deliver(move || callback(error)).is_none() {
                tracing::debug!(transaction = %self.id(), "Error callback undeliverable");
            }
        }
        TransactionState::CleanupAndTerminate
    }

    fn cleanup_and_terminate(&mut self, conn: &SqliteDatabase) -> TransactionState {
        if conn.in_transaction() {
            if let Err(e) = conn.rollback() {
                tracing::warn!(transaction = %self.id(), error = %e, "Rollback failed");
            }
        }
        self.lock = None;
        self.current = None;
        self.executed.clear();
        self.transaction.close();
        TransactionState::End
    }
}

/// Failures of transaction control statements. Interruption between
/// statements surfaces as a timeout.
fn storage_failure(context: &str, err: &StorageError) -> SqlError {
    match err {
        StorageError::Interrupted => SqlError::new(SqlErrorCode::Timeout, "interrupted"),
        StorageError::Closed => SqlError::database("database has been closed"),
        other => SqlError::database(format!("{context} ({other})")),
    }
}

impl std::fmt::Debug for SqlTransactionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTransactionBackend")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("holds_lock", &self.lock.is_some())
            .finish()
    }
}
