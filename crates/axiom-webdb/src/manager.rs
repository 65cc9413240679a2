//! Database Manager
//!
//! Entry point for scripts. The manager owns the tracker and coordinator
//! handles; each script context gets a `DatabaseContext` that opens
//! databases for one origin and stops them when the context goes away.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::backend::{DatabaseBackend, OpenParams};
use crate::context::ScriptContext;
use crate::coordinator::SqlTransactionCoordinator;
use crate::database::{Database, DatabaseCallback};
use crate::error::DatabaseError;
use crate::origin::SecurityOrigin;
use crate::quota::{QuotaDecision, QuotaHandlerSlot, QuotaRequest};
use crate::tracker::DatabaseTracker;
use crate::Result;

pub struct DatabaseManager {
    tracker: Arc<DatabaseTracker>,
    coordinator: Arc<SqlTransactionCoordinator>,
}

impl DatabaseManager {
    pub fn new(tracker: Arc<DatabaseTracker>) -> Self {
        Self {
            tracker,
            coordinator: Arc::new(SqlTransactionCoordinator::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<DatabaseTracker> {
        &self.tracker
    }

    pub fn coordinator(&self) -> &Arc<SqlTransactionCoordinator> {
        &self.coordinator
    }

    /// Databases opened through the returned context belong to `origin` and
    /// deliver their callbacks on `script`
    pub fn create_context(&self, script: ScriptContext, origin: SecurityOrigin) -> DatabaseContext {
        DatabaseContext {
            inner: Arc::new(ContextInner {
                script,
                origin,
                tracker: Arc::clone(&self.tracker),
                coordinator: Arc::clone(&self.coordinator),
                quota_handler: Arc::new(RwLock::new(None)),
                open_databases: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Fail every waiting transaction and close every database
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.tracker.shutdown();
    }
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("tracker", &self.tracker)
            .finish()
    }
}

struct ContextInner {
    script: ScriptContext,
    origin: SecurityOrigin,
    tracker: Arc<DatabaseTracker>,
    coordinator: Arc<SqlTransactionCoordinator>,
    quota_handler: QuotaHandlerSlot,
    open_databases: Mutex<Vec<Weak<DatabaseBackend>>>,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct DatabaseContext {
    inner: Arc<ContextInner>,
}

impl DatabaseContext {
    pub fn origin(&self) -> &SecurityOrigin {
        &self.inner.origin
    }

    pub fn script_context(&self) -> &ScriptContext {
        &self.inner.script
    }

    /// Host hook consulted when an open or a statement runs out of quota
    pub fn set_quota_handler<F>(&self, handler: F)
    where
        F: Fn(&QuotaRequest) -> QuotaDecision + Send + Sync + 'static,
    {
        *self.inner.quota_handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_quota_handler(&self) {
        *self.inner.quota_handler.write() = None;
    }

    /// Open (creating if needed) the database `name` of this context's
    /// origin.
    ///
    /// A non-empty `expected_version` must match the stored version. When
    /// the file is new and `creation_callback` is given, the version is left
    /// empty and the callback is posted to the script context.
    pub fn open_database(
        &self,
        name: &str,
        expected_version: &str,
        display_name: &str,
        estimated_size: u64,
        creation_callback: Option<DatabaseCallback>,
    ) -> Result<Database> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(DatabaseError::ContextStopped);
        }

        let origin = &self.inner.origin;
        let tracker = &self.inner.tracker;
        let _creating = tracker.begin_creation(origin, name)?;
        self.admit(name, estimated_size)?;

        let params = OpenParams {
            origin: origin.clone(),
            name: name.to_string(),
            expected_version: expected_version.to_string(),
            display_name: display_name.to_string(),
            estimated_size,
            has_creation_callback: creation_callback.is_some(),
        };
        let (backend, created) = DatabaseBackend::open(
            params,
            Arc::clone(tracker),
            Arc::clone(&self.inner.coordinator),
            self.inner.script.clone(),
            Arc::clone(&self.inner.quota_handler),
        )?;

        {
            let mut open = self.inner.open_databases.lock();
            open.retain(|weak| weak.strong_count() > 0);
            open.push(Arc::downgrade(&backend));
        }

        let database = Database::new(backend);
        if let (true, Some(callback)) = (created, creation_callback) {
            let created_database = database.clone();
            if !self.inner.script.post(move || callback(created_database)) {
                tracing::warn!(origin = %origin, name = %name, "Creation callback undeliverable");
            }
        }
        Ok(database)
    }

    /// Admission control with one chance to raise the quota
    fn admit(&self, name: &str, estimated_size: u64) -> Result<()> {
        let origin = &self.inner.origin;
        let tracker = &self.inner.tracker;

        let err = match tracker.can_establish_database(origin, name, estimated_size) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let DatabaseError::QuotaExceeded {
            usage,
            requested,
            quota,
            ..
        } = err
        else {
            return Err(err);
        };

        let requested_usage = usage.saturating_add(requested);
        tracker.notify_quota_exceeded(origin, name, usage, requested_usage);

        // Open runs on the script thread, so the handler is called directly
        let handler = self.inner.quota_handler.read().clone();
        let decision = handler
            .map(|handler| {
                handler(&QuotaRequest {
                    origin: origin.clone(),
                    database_name: name.to_string(),
                    current_quota: quota,
                    current_usage: usage,
                    requested_usage,
                })
            })
            .unwrap_or(QuotaDecision::Deny);

        match decision.raised_quota(quota) {
            Some(raised) => {
                tracker.set_quota(origin, raised)?;
                tracker.can_establish_database(origin, name, estimated_size)
            }
            None => Err(err),
        }
    }

    /// Close every database this context opened; later opens fail
    pub fn stop_databases(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let open: Vec<_> = self.inner.open_databases.lock().drain(..).collect();
        let mut stopped = 0;
        for backend in open.iter().filter_map(Weak::upgrade) {
            backend.close_immediately();
            stopped += 1;
        }
        tracing::info!(origin = %self.inner.origin, stopped, "Stopped databases");
    }

    pub fn has_open_databases(&self) -> bool {
        self.inner
            .open_databases
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .any(|backend| backend.opened())
    }
}

impl std::fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("origin", &self.inner.origin)
            .field("script", &self.inner.script)
            .finish()
    }
}
