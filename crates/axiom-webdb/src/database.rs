//! Script-side database handle
//!
//! `Database` is cheap to clone. When the last clone goes away the
//! connection closes once its queued transactions have run.

use std::path::Path;
use std::sync::Arc;

use crate::backend::DatabaseBackend;
use crate::origin::SecurityOrigin;
use crate::transaction::{
    next_transaction_id, SqlTransactionBackend, TransactionCallbacks, TransactionWrapper,
};
use crate::Result;

/// Called on the script context after a database file was created
pub type DatabaseCallback = Box<dyn FnOnce(Database) + Send>;

struct DatabaseHandle {
    backend: Arc<DatabaseBackend>,
}

impl Drop for DatabaseHandle {
    fn drop(&mut self) {
        self.backend.close();
    }
}

#[derive(Clone)]
pub struct Database {
    handle: Arc<DatabaseHandle>,
}

impl Database {
    pub(crate) fn new(backend: Arc<DatabaseBackend>) -> Self {
        Self {
            handle: Arc::new(DatabaseHandle { backend }),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<DatabaseBackend> {
        &self.handle.backend
    }

    pub fn origin(&self) -> &SecurityOrigin {
        self.backend().origin()
    }

    pub fn name(&self) -> &str {
        self.backend().name()
    }

    pub fn display_name(&self) -> &str {
        self.backend().display_name()
    }

    pub fn estimated_size(&self) -> u64 {
        self.backend().estimated_size()
    }

    pub fn file_path(&self) -> &Path {
        self.backend().path()
    }

    /// `origin_identifier/name`, shared by every handle on the same file
    pub fn string_identifier(&self) -> &str {
        self.backend().identity().as_str()
    }

    /// Version as last seen by this connection
    pub fn version(&self) -> String {
        self.backend().version()
    }

    pub fn expected_version(&self) -> String {
        self.backend().expected_version()
    }

    pub fn opened(&self) -> bool {
        self.backend().opened()
    }

    pub fn transaction(&self, callbacks: TransactionCallbacks) {
        self.schedule(false, callbacks, TransactionWrapper::Standard);
    }

    pub fn read_transaction(&self, callbacks: TransactionCallbacks) {
        self.schedule(true, callbacks, TransactionWrapper::Standard);
    }

    /// Runs `callbacks` and moves the version from `old_version` to
    /// `new_version`, provided the stored version still equals `old_version`
    /// when the transaction starts
    pub fn change_version(
        &self,
        old_version: &str,
        new_version: &str,
        callbacks: TransactionCallbacks,
    ) {
        self.schedule(
            false,
            callbacks,
            TransactionWrapper::change_version(old_version, new_version),
        );
    }

    fn schedule(
        &self,
        read_only: bool,
        callbacks: TransactionCallbacks,
        wrapper: TransactionWrapper,
    ) {
        let transaction = SqlTransactionBackend::new(
            Arc::clone(self.backend()),
            next_transaction_id(),
            read_only,
            callbacks,
            wrapper,
        );
        tracing::trace!(
            transaction = %transaction.id(),
            database = %self.string_identifier(),
            read_only,
            "Scheduling transaction"
        );
        self.backend().schedule(Box::new(transaction));
    }

    pub fn interrupt(&self) {
        self.backend().interrupt();
    }

    pub fn reset_interrupt(&self) {
        self.backend().reset_interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.backend().is_interrupted()
    }

    pub fn close_immediately(&self) {
        self.backend().close_immediately();
    }

    /// Names of the tables scripts created. Waits for queued transactions.
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.backend().table_names()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("identifier", &self.string_identifier())
            .field("opened", &self.opened())
            .finish()
    }
}
