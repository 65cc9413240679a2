//! Shared helpers for the integration tests. Callbacks run on a spawned
//! script thread; the test thread waits on condvars with a timeout.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axiom_webdb::{
    Database, DatabaseContext, DatabaseManager, DatabaseTracker, ScriptContext, SecurityOrigin,
    SqlError, SqlResultSet, SqlValue, StatementCallbacks, TrackerConfig, TransactionCallbacks,
};

pub const TIMEOUT: Duration = Duration::from_secs(20);

/// A value produced on another thread
pub struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub fn fill(&self, value: T) {
        *self.value.lock() = Some(value);
        self.ready.notify_all();
    }

    pub fn wait(&self) -> T {
        let deadline = Instant::now() + TIMEOUT;
        let mut value = self.value.lock();
        loop {
            if let Some(value) = value.take() {
                return value;
            }
            if self.ready.wait_until(&mut value, deadline).timed_out() {
                panic!("timed out waiting for callback");
            }
        }
    }
}

/// Ordered log of events from any thread
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    changed: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    /// Block until `event` has been recorded
    pub fn wait_for(&self, event: &str) {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.events.lock();
        while !events.iter().any(|e| e == event) {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                panic!("timed out waiting for {event:?}, saw {:?}", *events);
            }
        }
    }

    /// Block until at least `count` events have been recorded
    pub fn wait_for_count(&self, count: usize) -> Vec<String> {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.events.lock();
        while events.len() < count {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                panic!("timed out waiting for {count} events, saw {:?}", *events);
            }
        }
        events.clone()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub manager: DatabaseManager,
}

impl Harness {
    pub fn new(default_quota: u64) -> Self {
        Self::with_total_quota(default_quota, None)
    }

    pub fn with_total_quota(default_quota: u64, total_quota: Option<u64>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig {
            default_origin_quota: default_quota,
            total_quota,
            close_timeout: Duration::from_secs(5),
            ..TrackerConfig::new(dir.path().join("databases"))
        };
        let tracker = DatabaseTracker::open(config).unwrap();
        Self {
            dir,
            manager: DatabaseManager::new(tracker),
        }
    }

    pub fn tracker(&self) -> &Arc<DatabaseTracker> {
        self.manager.tracker()
    }

    /// A context for `origin()` with its own script thread
    pub fn context(&self, thread_name: &str) -> DatabaseContext {
        let (script, _thread) = ScriptContext::spawn(thread_name).unwrap();
        self.manager.create_context(script, origin())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

pub fn origin() -> SecurityOrigin {
    SecurityOrigin::from_url("https://example.com/app").unwrap()
}

pub fn open(context: &DatabaseContext, name: &str, version: &str) -> Database {
    context
        .open_database(name, version, "Test database", 1024, None)
        .unwrap()
}

/// Run `statements` in one write transaction and wait for its outcome
pub fn execute(db: &Database, statements: &[&str]) -> Result<(), SqlError> {
    let outcome = Slot::new();
    let (failed, succeeded) = (Arc::clone(&outcome), Arc::clone(&outcome));
    let statements: Vec<String> = statements.iter().map(|s| s.to_string()).collect();

    db.transaction(
        TransactionCallbacks::new(move |tx| {
            for sql in &statements {
                tx.execute_sql(sql, vec![], StatementCallbacks::new()).unwrap();
            }
        })
        .on_error(move |err| failed.fill(Err(err)))
        .on_success(move || succeeded.fill(Ok(()))),
    );
    outcome.wait()
}

/// Run one read-only query and return its rows
pub fn query(db: &Database, sql: &str, args: Vec<SqlValue>) -> Result<SqlResultSet, SqlError> {
    let outcome = Slot::new();
    let (rows, failed) = (Arc::clone(&outcome), Arc::clone(&outcome));
    let sql = sql.to_string();

    db.read_transaction(
        TransactionCallbacks::new(move |tx| {
            tx.execute_sql(
                &sql,
                args,
                StatementCallbacks::new().on_success(move |_, results| rows.fill(Ok(results.clone()))),
            )
            .unwrap();
        })
        .on_error(move |err| failed.fill(Err(err))),
    );
    outcome.wait()
}

pub fn count(db: &Database, table: &str) -> f64 {
    let results = query(db, &format!("SELECT COUNT(*) AS n FROM {table}"), vec![]).unwrap();
    results.value(0, "n").and_then(SqlValue::as_number).unwrap()
}
