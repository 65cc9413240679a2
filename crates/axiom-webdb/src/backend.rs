//! Connection backend
//!
//! Everything the script-side handle, the tracker and the running
//! transactions share about one open connection. The SQLite connection
//! itself is owned by the worker thread and never leaves it.

use parking_lot::{Condvar, Mutex};
use rusqlite::OptionalExtension;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use axiom_storage::{InterruptFlag, SqliteDatabase, StorageError};

use crate::context::ScriptContext;
use crate::coordinator::{ConnectionId, CoordinatorIdentity, SqlTransactionCoordinator};
use crate::error::{DatabaseError, SqlError, SqlErrorCode};
use crate::origin::SecurityOrigin;
use crate::quota::{QuotaHandler, QuotaHandlerSlot};
use crate::statement::INFO_TABLE_NAME;
use crate::tracker::DatabaseTracker;
use crate::transaction::SqlTransactionBackend;
use crate::Result;

const VERSION_KEY: &str = "WebDatabaseVersionKey";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum DatabaseTask {
    Transaction(Box<SqlTransactionBackend>),
    TableNames(oneshot::Sender<Result<Vec<String>>>),
    Close,
}

#[derive(Debug, Clone)]
pub(crate) struct OpenParams {
    pub origin: SecurityOrigin,
    pub name: String,
    pub expected_version: String,
    pub display_name: String,
    pub estimated_size: u64,
    /// A creation callback will set the version itself
    pub has_creation_callback: bool,
}

pub(crate) struct DatabaseBackend {
    id: ConnectionId,
    origin: SecurityOrigin,
    name: String,
    display_name: String,
    estimated_size: u64,
    path: PathBuf,
    identity: CoordinatorIdentity,
    expected_version: Mutex<String>,
    cached_version: Mutex<String>,
    tracker: Arc<DatabaseTracker>,
    coordinator: Arc<SqlTransactionCoordinator>,
    context: ScriptContext,
    quota_handler: QuotaHandlerSlot,
    interrupt: InterruptFlag,
    closing: AtomicBool,
    deleted: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<DatabaseTask>>>,
    closed: Mutex<bool>,
    closed_signal: Condvar,
}

impl DatabaseBackend {
    /// Open the file, verify its version and start the worker. Returns the
    /// backend and whether the file was created by this call.
    pub fn open(
        params: OpenParams,
        tracker: Arc<DatabaseTracker>,
        coordinator: Arc<SqlTransactionCoordinator>,
        context: ScriptContext,
        quota_handler: QuotaHandlerSlot,
    ) -> Result<(Arc<Self>, bool)> {
        let path = tracker.full_path_for_database(&params.origin, &params.name, true)?;
        let is_new = std::fs::metadata(&path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);

        let mut conn = SqliteDatabase::open(&path)?;
        let version = match verify_version(&conn, &params, is_new) {
            Ok(version) => version,
            Err(e) => {
                if let Err(close_error) = conn.close() {
                    tracing::warn!(error = %close_error, "Failed to close rejected database");
                }
                return Err(e);
            }
        };

        tracker.set_database_details(
            &params.origin,
            &params.name,
            &params.display_name,
            params.estimated_size,
        )?;
        tracker.record_usage(&params.origin, &params.name, file_size(&path));

        let expected_version = if is_new && params.has_creation_callback {
            String::new()
        } else {
            params.expected_version
        };

        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            id,
            identity: CoordinatorIdentity::new(&params.origin, &params.name),
            origin: params.origin,
            name: params.name,
            display_name: params.display_name,
            estimated_size: params.estimated_size,
            path,
            expected_version: Mutex::new(expected_version),
            cached_version: Mutex::new(version),
            tracker: Arc::clone(&tracker),
            coordinator,
            context,
            quota_handler,
            interrupt: conn.interrupt_flag(),
            closing: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            closed: Mutex::new(false),
            closed_signal: Condvar::new(),
        });

        let worker = Arc::clone(&backend);
        std::thread::Builder::new()
            .name(format!("webdb-{}", id.0))
            .spawn(move || run_worker(worker, conn, receiver))?;
        tracker.add_open_database(&backend);

        tracing::info!(
            connection = %id,
            origin = %backend.origin,
            name = %backend.name,
            new = is_new,
            "Opened database"
        );
        Ok((backend, is_new))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn origin(&self) -> &SecurityOrigin {
        &self.origin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn estimated_size(&self) -> u64 {
        self.estimated_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &CoordinatorIdentity {
        &self.identity
    }

    pub fn tracker(&self) -> &Arc<DatabaseTracker> {
        &self.tracker
    }

    pub fn coordinator(&self) -> &Arc<SqlTransactionCoordinator> {
        &self.coordinator
    }

    pub fn script_context(&self) -> &ScriptContext {
        &self.context
    }

    pub fn quota_handler(&self) -> Option<QuotaHandler> {
        self.quota_handler.read().clone()
    }

    // === Versions ===

    pub fn expected_version(&self) -> String {
        self.expected_version.lock().clone()
    }

    /// Returns the expected version that was replaced
    pub fn replace_expected_version(&self, version: String) -> String {
        std::mem::replace(&mut *self.expected_version.lock(), version)
    }

    /// Last version read from or written to the file by this connection
    pub fn version(&self) -> String {
        self.cached_version.lock().clone()
    }

    pub fn cache_version(&self, version: &str) {
        let mut cached = self.cached_version.lock();
        if *cached != version {
            *cached = version.to_string();
        }
    }

    // === Scheduling ===

    pub fn opened(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.sender.lock().is_some()
    }

    /// Why new work must fail right now, if it must
    pub fn termination_error(&self) -> Option<SqlError> {
        if self.deleted.load(Ordering::SeqCst) {
            Some(SqlError::database("database has been deleted"))
        } else if self.closing.load(Ordering::SeqCst) {
            Some(SqlError::database("database has been closed"))
        } else if self.interrupt.is_set() {
            Some(SqlError::new(
                SqlErrorCode::Timeout,
                "database has been interrupted",
            ))
        } else {
            None
        }
    }

    fn send(&self, task: DatabaseTask) -> Option<DatabaseTask> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(task).err().map(|rejected| rejected.0),
            None => Some(task),
        }
    }

    /// Queue `transaction` behind the connection's earlier ones. A closed
    /// connection fails it right away, on the script context.
    pub fn schedule(&self, transaction: Box<SqlTransactionBackend>) {
        if let Some(DatabaseTask::Transaction(transaction)) =
            self.send(DatabaseTask::Transaction(transaction))
        {
            let error = self
                .termination_error()
                .unwrap_or_else(|| SqlError::database("database has been closed"));
            transaction.fail_unscheduled(error);
        }
    }

    /// User table names, read on the worker. Blocks; never call it from a
    /// callback of this connection.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let (reply, response) = oneshot::channel();
        if self.send(DatabaseTask::TableNames(reply)).is_some() {
            return Err(DatabaseError::Storage(StorageError::Closed));
        }
        response
            .blocking_recv()
            .map_err(|_| DatabaseError::Storage(StorageError::Closed))?
    }

    // === Interruption and closing ===

    /// Fail the running transaction at its next statement boundary and
    /// every queued one, until `reset_interrupt`
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
        self.coordinator.cancel_connection(self.id);
        tracing::debug!(connection = %self.id, "Interrupted database");
    }

    pub fn reset_interrupt(&self) {
        self.interrupt.reset();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    /// Let queued transactions finish, then stop the worker
    pub fn close(&self) {
        if let Some(sender) = self.sender.lock().take() {
            // The worker only goes away after receiving this
            let _ = sender.send(DatabaseTask::Close);
            tracing::debug!(connection = %self.id, "Closing database");
        }
    }

    /// Fail everything pending with "database has been closed" and stop
    pub fn close_immediately(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.coordinator.cancel_connection(self.id);
        self.close();
    }

    /// Terminal: fail everything pending with "database has been deleted"
    pub fn mark_as_deleted_and_close(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.close_immediately();
    }

    fn signal_closed(&self) {
        *self.closed.lock() = true;
        self.closed_signal.notify_all();
    }

    /// Wait for the worker to release the file. False on timeout.
    pub fn wait_until_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut closed = self.closed.lock();
        while !*closed {
            if self
                .closed_signal
                .wait_until(&mut closed, deadline)
                .timed_out()
            {
                return *closed;
            }
        }
        true
    }
}

impl std::fmt::Debug for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBackend")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("path", &self.path)
            .field("opened", &self.opened())
            .finish()
    }
}

fn run_worker(
    backend: Arc<DatabaseBackend>,
    mut conn: SqliteDatabase,
    mut tasks: mpsc::UnboundedReceiver<DatabaseTask>,
) {
    tracing::debug!(connection = %backend.id, "Database worker started");

    while let Some(task) = tasks.blocking_recv() {
        match task {
            DatabaseTask::Transaction(transaction) => transaction.run(&mut conn),
            DatabaseTask::TableNames(reply) => {
                let names = conn
                    .table_names()
                    .map(|names| {
                        names
                            .into_iter()
                            .filter(|name| !name.eq_ignore_ascii_case(INFO_TABLE_NAME))
                            .collect()
                    })
                    .map_err(DatabaseError::from);
                let _ = reply.send(names);
            }
            DatabaseTask::Close => break,
        }
    }

    tasks.close();
    let error = backend
        .termination_error()
        .unwrap_or_else(|| SqlError::database("database has been closed"));
    while let Ok(task) = tasks.try_recv() {
        if let DatabaseTask::Transaction(transaction) = task {
            transaction.fail_unscheduled(error.clone());
        }
    }

    if let Err(e) = conn.close() {
        tracing::warn!(connection = %backend.id, error = %e, "Failed to close database");
    }
    backend.tracker.remove_open_database(&backend);
    backend.signal_closed();
    tracing::debug!(connection = %backend.id, "Database worker finished");
}

/// Create the info table if needed and reconcile the stored version with
/// the one the opener expects
fn verify_version(conn: &SqliteDatabase, params: &OpenParams, is_new: bool) -> Result<String> {
    conn.set_busy_timeout(Duration::from_secs(30))?;
    conn.connection()?.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {INFO_TABLE_NAME} (
            key TEXT NOT NULL ON CONFLICT FAIL UNIQUE ON CONFLICT REPLACE,
            value TEXT NOT NULL ON CONFLICT FAIL
        )"
    ))?;

    let stored = stored_version(conn)?;
    match stored {
        Some(actual) if !is_new => {
            if !params.expected_version.is_empty() && params.expected_version != actual {
                return Err(DatabaseError::VersionMismatch {
                    expected: params.expected_version.clone(),
                    actual,
                });
            }
            Ok(actual)
        }
        _ => {
            let version = if params.has_creation_callback {
                ""
            } else {
                params.expected_version.as_str()
            };
            write_version(conn, version)?;
            Ok(version.to_string())
        }
    }
}

fn stored_version(conn: &SqliteDatabase) -> Result<Option<String>> {
    let version = conn
        .connection()?
        .query_row(
            &format!("SELECT value FROM {INFO_TABLE_NAME} WHERE key = ?1"),
            [VERSION_KEY],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(version)
}

/// Stored version, empty when none was ever written
pub(crate) fn read_version(conn: &SqliteDatabase) -> Result<String> {
    Ok(stored_version(conn)?.unwrap_or_default())
}

pub(crate) fn write_version(conn: &SqliteDatabase, version: &str) -> Result<()> {
    conn.connection()?.execute(
        &format!("INSERT INTO {INFO_TABLE_NAME} (key, value) VALUES (?1, ?2)"),
        [VERSION_KEY, version],
    )?;
    Ok(())
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}
