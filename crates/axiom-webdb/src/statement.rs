//! Statements queued on a transaction
//!
//! A statement is prepared, bound and stepped in one go on the connection
//! worker. Failures are classified here into script-visible codes; quota
//! exhaustion is reported separately so the transaction can negotiate.

use rusqlite::{params_from_iter, ErrorCode};

use axiom_storage::SqliteDatabase;

use crate::error::{SqlError, SqlErrorCode};
use crate::transaction::SqlTransaction;
use crate::value::{SqlResultSet, SqlValue};

/// Table holding the database version. Scripts may not touch it.
pub(crate) const INFO_TABLE_NAME: &str = "__WebDatabaseInfoTable__";

/// What a statement error callback wants the transaction to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementErrorDecision {
    /// Ignore the failure and run the next statement
    Continue,
    /// Roll the whole transaction back
    Abort,
}

type StatementSuccessCallback = Box<dyn FnOnce(&SqlTransaction, &SqlResultSet) + Send>;
type StatementErrorCallback =
    Box<dyn FnOnce(&SqlTransaction, &SqlError) -> StatementErrorDecision + Send>;

#[derive(Default)]
pub struct StatementCallbacks {
    on_success: Option<StatementSuccessCallback>,
    on_error: Option<StatementErrorCallback>,
}

impl StatementCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&SqlTransaction, &SqlResultSet) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&SqlTransaction, &SqlError) -> StatementErrorDecision + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn has_error_callback(&self) -> bool {
        self.on_error.is_some()
    }
}

impl std::fmt::Debug for StatementCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum StatementOutcome {
    Success {
        results: SqlResultSet,
        /// False for statements SQLite reports as read-only
        modified: bool,
    },
    /// `SQLITE_FULL`: the database hit its maximum size
    QuotaExceeded,
    Failed(SqlError),
}

#[derive(Debug)]
pub(crate) struct PendingStatement {
    sql: String,
    args: Vec<SqlValue>,
    read_only: bool,
    callbacks: StatementCallbacks,
}

impl PendingStatement {
    pub fn new(
        sql: impl Into<String>,
        args: Vec<SqlValue>,
        read_only: bool,
        callbacks: StatementCallbacks,
    ) -> Self {
        Self {
            sql: sql.into(),
            args,
            read_only,
            callbacks,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn has_error_callback(&self) -> bool {
        self.callbacks.has_error_callback()
    }

    /// The same statement without callbacks, for replaying it
    pub fn replica(&self) -> Self {
        Self::new(
            self.sql.clone(),
            self.args.clone(),
            self.read_only,
            StatementCallbacks::new(),
        )
    }

    pub fn take_success_callback(&mut self) -> Option<StatementSuccessCallback> {
        self.callbacks.on_success.take()
    }

    pub fn take_error_callback(&mut self) -> Option<StatementErrorCallback> {
        self.callbacks.on_error.take()
    }

    /// Run the statement to completion. Never leaves a statement half
    /// stepped: rows are collected before returning.
    pub fn execute(&self, db: &SqliteDatabase) -> StatementOutcome {
        let Ok(conn) = db.connection() else {
            return StatementOutcome::Failed(SqlError::database("database has been closed"));
        };

        if self.sql.to_ascii_lowercase().contains(&INFO_TABLE_NAME.to_ascii_lowercase()) {
            return StatementOutcome::Failed(not_authorized());
        }

        let mut stmt = match conn.prepare(&self.sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                return StatementOutcome::Failed(SqlError::new(
                    SqlErrorCode::Syntax,
                    format!("could not prepare statement ({})", describe(&e)),
                ))
            }
        };

        let modifies = !stmt.readonly();
        if self.read_only && modifies {
            return StatementOutcome::Failed(not_authorized());
        }
        if stmt.parameter_count() != self.args.len() {
            return StatementOutcome::Failed(SqlError::new(
                SqlErrorCode::Syntax,
                "number of '?'s in statement string does not match argument count",
            ));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let last_row_id = conn.last_insert_rowid();
        let changes_before = conn.total_changes();

        let mut collected = Vec::new();
        let step = (|| -> rusqlite::Result<()> {
            let mut rows = stmt.query(params_from_iter(self.args.iter()))?;
            while let Some(row) = rows.next()? {
                let values = (0..columns.len())
                    .map(|i| row.get_ref(i).map(SqlValue::from))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                collected.push(values);
            }
            Ok(())
        })();

        if let Err(e) = step {
            return classify_step_error(&e);
        }

        // `changes()` keeps the last DML count across DDL
        let rows_affected = conn.total_changes().saturating_sub(changes_before);
        let insert_id = (conn.last_insert_rowid() != last_row_id && rows_affected > 0)
            .then(|| conn.last_insert_rowid());

        StatementOutcome::Success {
            results: SqlResultSet::new(columns, collected, rows_affected, insert_id),
            modified: modifies,
        }
    }
}

fn not_authorized() -> SqlError {
    SqlError::database("could not prepare statement (23 not authorized)")
}

/// `<extended code> <message>`, the way SQLite reports it
fn describe(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(failure, Some(message)) => {
            format!("{} {}", failure.extended_code, message)
        }
        rusqlite::Error::SqliteFailure(failure, None) => {
            format!("{} {}", failure.extended_code, failure)
        }
        other => other.to_string(),
    }
}

fn classify_step_error(err: &rusqlite::Error) -> StatementOutcome {
    let code = match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => return StatementOutcome::QuotaExceeded,
        Some(ErrorCode::ConstraintViolation) => SqlErrorCode::Constraint,
        Some(ErrorCode::TooBig) => SqlErrorCode::TooLarge,
        Some(ErrorCode::OperationInterrupted) => SqlErrorCode::Timeout,
        _ => SqlErrorCode::Database,
    };
    StatementOutcome::Failed(SqlError::new(
        code,
        format!("could not execute statement ({})", describe(err)),
    ))
}
