//! SQLite connection wrapper
//!
//! One `SqliteDatabase` per underlying connection. All methods take `&self`
//! except `close`, but the handle is meant to be driven by a single thread:
//! the connection worker for web databases, or whoever holds the catalog
//! lock for the tracker and the application cache.

use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Delete,
    Wal,
}

impl JournalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Wal => "WAL",
        }
    }
}

/// Interrupt request shared between a connection and the threads that may
/// want to stop it. It is only consulted before a command starts, so a
/// statement that is already stepping always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SqliteDatabase {
    conn: Option<Connection>,
    path: Option<PathBuf>,
    interrupt: InterruptFlag,
}

impl SqliteDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        tracing::debug!(path = %path.display(), "Opened SQLite database");

        Ok(Self {
            conn: Some(conn),
            path: Some(path.to_path_buf()),
            interrupt: InterruptFlag::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        Ok(Self {
            conn: Some(conn),
            path: None,
            interrupt: InterruptFlag::new(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// File backing this connection, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
            if let Some(path) = &self.path {
                tracing::debug!(path = %path.display(), "Closed SQLite database");
            }
        }
        Ok(())
    }

    pub fn connection(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(StorageError::Closed)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(self.connection()?)
    }

    // === Interruption ===

    /// A clone of the flag, for threads that do not own the connection
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub fn reset_interrupt(&self) {
        self.interrupt.reset();
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.interrupt.is_set() {
            return Err(StorageError::Interrupted);
        }
        Ok(())
    }

    // === Commands and transactions ===

    pub fn execute_command(&self, sql: &str) -> Result<()> {
        self.check_interrupted()?;
        self.connection()?.execute_batch(sql)?;
        Ok(())
    }

    /// Begin a transaction. Writers take the RESERVED lock up front.
    pub fn begin(&self, immediate: bool) -> Result<()> {
        self.execute_command(if immediate { "BEGIN IMMEDIATE" } else { "BEGIN" })
    }

    // Commit and rollback ignore the interrupt flag: an interrupted
    // transaction still has to be finished one way or the other.
    pub fn commit(&self) -> Result<()> {
        self.connection()?.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        if self.in_transaction() {
            self.connection()?.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.conn
            .as_ref()
            .map(|conn| !conn.is_autocommit())
            .unwrap_or(false)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let found = self
            .connection()?
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Names of user tables, excluding SQLite's own bookkeeping tables
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn vacuum(&self) -> Result<()> {
        self.execute_command("VACUUM")
    }

    // === Pragmas ===

    pub fn page_size(&self) -> Result<u64> {
        let size: i64 = self
            .connection()?
            .pragma_query_value(None, "page_size", |row| row.get(0))?;
        Ok(size.max(0) as u64)
    }

    pub fn page_count(&self) -> Result<u64> {
        let count: i64 = self
            .connection()?
            .pragma_query_value(None, "page_count", |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Size of the database in bytes as seen by this connection, including
    /// pages written by a transaction that has not committed yet
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.page_count()? * self.page_size()?)
    }

    pub fn free_space_size(&self) -> Result<u64> {
        let free: i64 = self
            .connection()?
            .pragma_query_value(None, "freelist_count", |row| row.get(0))?;
        Ok(free.max(0) as u64 * self.page_size()?)
    }

    /// Cap the file at `size` bytes, rounded up to whole pages. SQLite never
    /// lowers the cap below the current page count; the applied limit is
    /// returned.
    pub fn set_maximum_size(&self, size: u64) -> Result<u64> {
        let page_size = self.page_size()?.max(1);
        let pages = size.div_ceil(page_size).max(1);
        let applied: i64 = self.connection()?.pragma_update_and_check(
            None,
            "max_page_count",
            pages as i64,
            |row| row.get(0),
        )?;
        Ok(applied.max(0) as u64 * page_size)
    }

    pub fn maximum_size(&self) -> Result<u64> {
        let pages: i64 = self
            .connection()?
            .pragma_query_value(None, "max_page_count", |row| row.get(0))?;
        Ok(pages.max(0) as u64 * self.page_size()?)
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.connection()?.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn set_journal_mode(&self, mode: JournalMode) -> Result<()> {
        let _: String = self.connection()?.pragma_update_and_check(
            None,
            "journal_mode",
            mode.as_str(),
            |row| row.get(0),
        )?;
        Ok(())
    }

    pub fn enable_foreign_keys(&self) -> Result<()> {
        self.connection()?
            .pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    pub fn last_changes(&self) -> Result<u64> {
        Ok(self.connection()?.changes() as u64)
    }

    pub fn last_insert_row_id(&self) -> Result<i64> {
        Ok(self.connection()?.last_insert_rowid())
    }
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.path)
            .field("open", &self.conn.is_some())
            .field("interrupted", &self.interrupt.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut db = SqliteDatabase::open(&path).unwrap();
        assert!(db.is_open());
        assert_eq!(db.path(), Some(path.as_path()));

        db.execute_command("CREATE TABLE t (x INTEGER)").unwrap();
        assert!(db.table_exists("t").unwrap());
        assert!(!db.table_exists("missing").unwrap());

        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.connection(), Err(StorageError::Closed)));
        // Second close is harmless
        db.close().unwrap();
    }

    #[test]
    fn test_interrupt_blocks_new_commands() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let flag = db.interrupt_flag();

        flag.interrupt();
        assert!(db.is_interrupted());
        assert!(matches!(
            db.execute_command("CREATE TABLE t (x)"),
            Err(StorageError::Interrupted)
        ));

        db.reset_interrupt();
        db.execute_command("CREATE TABLE t (x)").unwrap();
    }

    #[test]
    fn test_maximum_size_reports_disk_full() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_command("CREATE TABLE blobs (data BLOB)").unwrap();

        let page_size = db.page_size().unwrap();
        let applied = db.set_maximum_size(page_size * 4).unwrap();
        assert_eq!(applied, page_size * 4);
        assert_eq!(db.maximum_size().unwrap(), page_size * 4);

        let err = db
            .execute_command("INSERT INTO blobs VALUES (zeroblob(1048576))")
            .unwrap_err();
        assert!(err.is_disk_full());
    }

    #[test]
    fn test_transaction_helpers() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_command("CREATE TABLE t (x INTEGER)").unwrap();

        db.begin(true).unwrap();
        assert!(db.in_transaction());
        db.execute_command("INSERT INTO t VALUES (1)").unwrap();
        db.rollback().unwrap();
        assert!(!db.in_transaction());

        let count: i64 = db
            .connection()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        db.begin(false).unwrap();
        db.execute_command("INSERT INTO t VALUES (2)").unwrap();
        assert_eq!(db.last_changes().unwrap(), 1);
        db.commit().unwrap();

        assert_eq!(db.table_names().unwrap(), vec!["t".to_string()]);
    }
}
