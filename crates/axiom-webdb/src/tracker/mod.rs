//! Database tracker
//!
//! Process-wide registry of every web database on disk: where it lives, how
//! much space it uses and how much its origin may use. Bookkeeping persists
//! in `Databases.db` under the database directory:
//!
//! ```text
//! <database_directory>/Databases.db
//! <database_directory>/<origin identifier>/<guid as %016x>.db
//! ```
//!
//! The tracker is an ordinary value: open it, share the `Arc`, shut it down.

mod locks;
mod notification;

pub use notification::TrackerNotification;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use axiom_storage::{run_migrations, Catalog, JournalMode, SqliteDatabase};

use crate::backend::DatabaseBackend;
use crate::details::DatabaseDetails;
use crate::error::DatabaseError;
use crate::origin::SecurityOrigin;
use crate::Result;

use locks::{DatabaseKey, QuotaMap, Registry, TrackerLocks};
use notification::Notifier;

pub const DEFAULT_ORIGIN_QUOTA: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub database_directory: PathBuf,
    pub default_origin_quota: u64,
    /// Combined limit for all origins; `None` leaves only origin quotas
    pub total_quota: Option<u64>,
    /// How long deletion waits for open handles to let go of a file
    pub close_timeout: Duration,
}

impl TrackerConfig {
    pub fn new(database_directory: impl Into<PathBuf>) -> Self {
        Self {
            database_directory: database_directory.into(),
            default_origin_quota: DEFAULT_ORIGIN_QUOTA,
            total_quota: None,
            close_timeout: Duration::from_secs(5),
        }
    }
}

pub struct DatabaseTracker {
    config: TrackerConfig,
    locks: TrackerLocks,
    notifier: Notifier,
    shut_down: AtomicBool,
}

impl DatabaseTracker {
    /// Open (or create) the catalog and load quotas and usage
    pub fn open(config: TrackerConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.database_directory)?;

        let catalog_path = config
            .database_directory
            .join(Catalog::DatabaseTracker.file_name());
        let catalog = SqliteDatabase::open(&catalog_path)?;
        catalog.set_journal_mode(JournalMode::Wal)?;
        catalog.set_busy_timeout(Duration::from_secs(5))?;
        run_migrations(catalog.connection()?, Catalog::DatabaseTracker)?;

        let mut quotas = QuotaMap {
            default_quota: config.default_origin_quota,
            total_quota: config.total_quota,
            ..QuotaMap::default()
        };
        load_quotas(&catalog, &mut quotas)?;
        load_usage(&catalog, &config.database_directory, &mut quotas)?;

        tracing::info!(
            path = %catalog_path.display(),
            origins = quotas.quotas.len(),
            databases = quotas.usage.len(),
            "Database tracker opened"
        );

        Ok(Arc::new(Self {
            config,
            locks: TrackerLocks::new(Registry::new(catalog), quotas),
            notifier: Notifier::default(),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Close every open database and the catalog. Later calls fail with
    /// `TrackerClosed`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for backend in self.live_backends(|_| true) {
            backend.close_immediately();
        }

        let mut registry = self.locks.registry();
        registry.open_databases.clear();
        if let Err(e) = registry.catalog.close() {
            tracing::warn!(error = %e, "Failed to close tracker catalog");
        }
        drop(registry);

        self.notifier.clear();
        tracing::info!("Database tracker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TrackerNotification> {
        self.notifier.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(DatabaseError::TrackerClosed);
        }
        Ok(())
    }

    pub fn origin_directory(&self, origin: &SecurityOrigin) -> PathBuf {
        self.config
            .database_directory
            .join(origin.database_identifier())
    }

    // === Admission ===

    /// Whether `origin` may open `name` expecting `estimated_size` bytes.
    ///
    /// Reads state only. Databases that already exist are always admitted;
    /// new ones must fit into what is left of the origin's quota and of the
    /// total quota.
    pub fn can_establish_database(
        &self,
        origin: &SecurityOrigin,
        name: &str,
        estimated_size: u64,
    ) -> Result<()> {
        self.ensure_running()?;
        let registry = self.locks.registry();
        let key = (origin.clone(), name.to_string());
        if registry.is_being_deleted(&key) {
            return Err(being_deleted(&key));
        }

        let quotas = registry.quotas();
        if quotas.usage.contains_key(&key) {
            return Ok(());
        }

        let requested = estimated_size.max(1);
        if let Some(limit) = quotas.total_quota {
            let usage = quotas.total_usage();
            if !fits(usage, requested, limit) {
                return Err(DatabaseError::TotalQuotaExceeded {
                    usage,
                    requested,
                    limit,
                });
            }
        }

        let usage = quotas.usage_for_origin(origin);
        let quota = quotas.quota_for(origin);
        if fits(usage, requested, quota) {
            Ok(())
        } else {
            Err(DatabaseError::QuotaExceeded {
                origin: origin.to_string(),
                usage,
                requested,
                quota,
            })
        }
    }

    /// Mark `name` as being created until the guard drops. Deletion of a
    /// database that is being created is refused.
    pub fn begin_creation(
        self: &Arc<Self>,
        origin: &SecurityOrigin,
        name: &str,
    ) -> Result<CreationGuard> {
        self.ensure_running()?;
        let key = (origin.clone(), name.to_string());
        let mut registry = self.locks.registry();
        if registry.is_being_deleted(&key) {
            return Err(being_deleted(&key));
        }
        *registry.being_created.entry(key.clone()).or_insert(0) += 1;

        Ok(CreationGuard {
            tracker: Arc::clone(self),
            key,
        })
    }

    fn end_creation(&self, key: &DatabaseKey) {
        let mut registry = self.locks.registry();
        if let Some(count) = registry.being_created.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                registry.being_created.remove(key);
            }
        }
    }

    // === Registry ===

    /// Path of the file backing (`origin`, `name`). With `create_if_missing`
    /// a catalog row and the origin directory are created on first use.
    pub fn full_path_for_database(
        &self,
        origin: &SecurityOrigin,
        name: &str,
        create_if_missing: bool,
    ) -> Result<PathBuf> {
        self.ensure_running()?;
        let registry = self.locks.registry();
        let key = (origin.clone(), name.to_string());
        if registry.is_being_deleted(&key) {
            return Err(being_deleted(&key));
        }

        let origin_dir = self.origin_directory(origin);
        if let Some(file) = lookup_path(&registry.catalog, origin, name)? {
            return Ok(origin_dir.join(file));
        }
        if !create_if_missing {
            return Err(DatabaseError::NotFound(format!("{origin}/{name}")));
        }

        std::fs::create_dir_all(&origin_dir)?;
        let conn = registry.catalog.connection()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO databases (origin, name, path, created_at) VALUES (?1, ?2, '', ?3)",
            params![origin.database_identifier(), name, Utc::now().to_rfc3339()],
        )?;
        let guid = tx.last_insert_rowid();
        let file = format!("{guid:016x}.db");
        tx.execute(
            "UPDATE databases SET path = ?1 WHERE guid = ?2",
            params![file, guid],
        )?;
        tx.commit()?;

        registry.quotas().usage.entry(key).or_insert(0);
        tracing::info!(origin = %origin, name = %name, file = %file, "Registered database");

        Ok(origin_dir.join(file))
    }

    pub fn set_database_details(
        &self,
        origin: &SecurityOrigin,
        name: &str,
        display_name: &str,
        estimated_size: u64,
    ) -> Result<()> {
        self.ensure_running()?;
        let registry = self.locks.registry();
        let updated = registry.catalog.connection()?.execute(
            "UPDATE databases SET display_name = ?1, estimated_size = ?2
             WHERE origin = ?3 AND name = ?4",
            params![
                display_name,
                estimated_size as i64,
                origin.database_identifier(),
                name
            ],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(format!("{origin}/{name}")));
        }
        Ok(())
    }

    pub fn details_for_name_and_origin(
        &self,
        name: &str,
        origin: &SecurityOrigin,
    ) -> Result<DatabaseDetails> {
        self.ensure_running()?;
        let registry = self.locks.registry();
        let row = registry
            .catalog
            .connection()?
            .query_row(
                "SELECT display_name, estimated_size, path, created_at FROM databases
                 WHERE origin = ?1 AND name = ?2",
                params![origin.database_identifier(), name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((display_name, estimated_size, file, created_at)) = row else {
            return Err(DatabaseError::NotFound(format!("{origin}/{name}")));
        };
        let current_usage = registry
            .quotas()
            .usage_for_database(&(origin.clone(), name.to_string()));
        drop(registry);

        let modification_time = std::fs::metadata(self.origin_directory(origin).join(file))
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Ok(DatabaseDetails {
            name: name.to_string(),
            display_name,
            expected_usage: estimated_size.max(0) as u64,
            current_usage,
            creation_time: DateTime::parse_from_rfc3339(&created_at)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            modification_time,
        })
    }

    pub fn database_names_for_origin(&self, origin: &SecurityOrigin) -> Result<Vec<String>> {
        self.ensure_running()?;
        let registry = self.locks.registry();
        let conn = registry.catalog.connection()?;
        let mut stmt = conn.prepare("SELECT name FROM databases WHERE origin = ?1 ORDER BY name")?;
        let names = stmt
            .query_map([origin.database_identifier()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Every origin with a database or an explicit quota
    pub fn origins(&self) -> Result<Vec<SecurityOrigin>> {
        self.ensure_running()?;
        let registry = self.locks.registry();
        let conn = registry.catalog.connection()?;
        let mut stmt = conn.prepare(
            "SELECT origin FROM databases UNION SELECT origin FROM origins ORDER BY 1",
        )?;
        let identifiers = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(identifiers
            .iter()
            .filter_map(|id| SecurityOrigin::from_database_identifier(id))
            .collect())
    }

    // === Quota and usage ===

    pub fn quota_for_origin(&self, origin: &SecurityOrigin) -> u64 {
        self.locks.quotas().quota_for(origin)
    }

    pub fn set_quota(&self, origin: &SecurityOrigin, quota: u64) -> Result<()> {
        self.ensure_running()?;
        let registry = self.locks.registry();
        registry.catalog.connection()?.execute(
            "INSERT INTO origins (origin, quota) VALUES (?1, ?2)",
            params![origin.database_identifier(), quota.min(i64::MAX as u64) as i64],
        )?;
        registry.quotas().quotas.insert(origin.clone(), quota);

        tracing::info!(origin = %origin, quota, "Set origin quota");
        Ok(())
    }

    /// Committed bytes across all of the origin's databases
    pub fn usage_for_origin(&self, origin: &SecurityOrigin) -> u64 {
        self.locks.quotas().usage_for_origin(origin)
    }

    pub fn usage_for_database(&self, origin: &SecurityOrigin, name: &str) -> u64 {
        self.locks
            .quotas()
            .usage_for_database(&(origin.clone(), name.to_string()))
    }

    /// Largest size `name` may grow to: its quota minus what the origin's
    /// other databases use, capped by what the total quota leaves over,
    /// never less than what it already uses
    pub fn max_size_for_database(&self, origin: &SecurityOrigin, name: &str) -> u64 {
        self.locks
            .quotas()
            .max_size_for(&(origin.clone(), name.to_string()))
    }

    pub fn total_usage(&self) -> u64 {
        self.locks.quotas().total_usage()
    }

    /// Raising the origin quota would not let `name` grow
    pub fn total_quota_binds(&self, origin: &SecurityOrigin, name: &str) -> bool {
        self.locks
            .quotas()
            .total_quota_binds(&(origin.clone(), name.to_string()))
    }

    pub(crate) fn record_usage(&self, origin: &SecurityOrigin, name: &str, bytes: u64) {
        self.locks
            .quotas()
            .usage
            .insert((origin.clone(), name.to_string()), bytes);
    }

    /// Refresh the committed size of `name` from its file and tell
    /// subscribers. Called after a modifying transaction commits.
    pub fn database_modified(&self, origin: &SecurityOrigin, name: &str, path: &Path) {
        let usage = file_size(path);
        self.record_usage(origin, name, usage);

        tracing::debug!(origin = %origin, name = %name, usage, "Database modified");
        self.notifier.notify(TrackerNotification::DatabaseChanged {
            origin: origin.clone(),
            name: name.to_string(),
            usage,
        });
    }

    pub fn notify_quota_exceeded(
        &self,
        origin: &SecurityOrigin,
        name: &str,
        current_usage: u64,
        requested_usage: u64,
    ) {
        let quota = self.quota_for_origin(origin);
        tracing::info!(
            origin = %origin,
            name = %name,
            current_usage,
            requested_usage,
            quota,
            "Database exceeded quota"
        );
        self.notifier.notify(TrackerNotification::QuotaExceeded {
            origin: origin.clone(),
            name: name.to_string(),
            current_usage,
            requested_usage,
            quota,
        });
    }

    // === Open databases ===

    pub(crate) fn add_open_database(&self, backend: &Arc<DatabaseBackend>) {
        let key = (backend.origin().clone(), backend.name().to_string());
        self.locks
            .registry()
            .open_databases
            .entry(key)
            .or_default()
            .push(Arc::downgrade(backend));
    }

    pub(crate) fn remove_open_database(&self, backend: &DatabaseBackend) {
        let key = (backend.origin().clone(), backend.name().to_string());
        let mut registry = self.locks.registry();
        if let Some(handles) = registry.open_databases.get_mut(&key) {
            handles.retain(|weak| {
                weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), backend)
            });
            if handles.is_empty() {
                registry.open_databases.remove(&key);
            }
        }
    }

    /// Number of live connections to (`origin`, `name`)
    pub fn open_database_count(&self, origin: &SecurityOrigin, name: &str) -> usize {
        self.locks
            .registry()
            .open_databases
            .get(&(origin.clone(), name.to_string()))
            .map(|handles| handles.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    fn live_backends<F>(&self, filter: F) -> Vec<Arc<DatabaseBackend>>
    where
        F: Fn(&DatabaseKey) -> bool,
    {
        let registry = self.locks.registry();
        registry
            .open_databases
            .iter()
            .filter(|(key, _)| filter(key))
            .flat_map(|(_, handles)| handles.iter().filter_map(Weak::upgrade))
            .collect()
    }

    /// Interrupt every connection of `origin`; their transactions fail with
    /// `TIMEOUT_ERR` at the next statement boundary
    pub fn interrupt_all_databases_for_origin(&self, origin: &SecurityOrigin) {
        let backends = self.live_backends(|(o, _)| o == origin);
        tracing::info!(origin = %origin, count = backends.len(), "Interrupting databases");
        for backend in backends {
            backend.interrupt();
        }
    }

    // === Deletion ===

    /// Close every connection to (`origin`, `name`), then remove its file
    /// and catalog row
    pub fn delete_database(&self, origin: &SecurityOrigin, name: &str) -> Result<()> {
        self.ensure_running()?;
        let key = (origin.clone(), name.to_string());
        {
            let mut registry = self.locks.registry();
            if registry.is_being_created(&key) {
                return Err(DatabaseError::BeingCreated {
                    origin: origin.to_string(),
                    name: name.to_string(),
                });
            }
            if registry.is_being_deleted(&key) {
                return Err(being_deleted(&key));
            }
            registry.being_deleted.insert(key.clone());
        }

        let result = self.close_and_remove(std::slice::from_ref(&key));
        self.locks.registry().being_deleted.remove(&key);
        result?;

        tracing::info!(origin = %origin, name = %name, "Deleted database");
        self.notifier.notify(TrackerNotification::DatabaseDeleted {
            origin: origin.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// Delete every database of `origin` along with its quota record
    pub fn delete_origin(&self, origin: &SecurityOrigin) -> Result<()> {
        self.ensure_running()?;
        let names = self.database_names_for_origin(origin)?;
        {
            let mut registry = self.locks.registry();
            if registry.being_created.keys().any(|(o, _)| o == origin) {
                return Err(DatabaseError::BeingCreated {
                    origin: origin.to_string(),
                    name: String::new(),
                });
            }
            if !registry.origins_being_deleted.insert(origin.clone()) {
                return Err(DatabaseError::BeingDeleted {
                    origin: origin.to_string(),
                    name: String::new(),
                });
            }
        }

        let keys: Vec<DatabaseKey> = names
            .iter()
            .map(|name| (origin.clone(), name.clone()))
            .collect();
        let result = self.close_and_remove(&keys).and_then(|()| {
            let registry = self.locks.registry();
            registry.catalog.connection()?.execute(
                "DELETE FROM origins WHERE origin = ?1",
                [origin.database_identifier()],
            )?;
            registry.quotas().quotas.remove(origin);
            Ok(())
        });
        if result.is_ok() {
            remove_dir_if_exists(&self.origin_directory(origin));
        }
        self.locks.registry().origins_being_deleted.remove(origin);
        result?;

        tracing::info!(origin = %origin, databases = names.len(), "Deleted origin");
        for name in names {
            self.notifier.notify(TrackerNotification::DatabaseDeleted {
                origin: origin.clone(),
                name,
            });
        }
        Ok(())
    }

    pub fn delete_all_databases(&self) -> Result<()> {
        for origin in self.origins()? {
            self.delete_origin(&origin)?;
        }
        Ok(())
    }

    fn close_and_remove(&self, keys: &[DatabaseKey]) -> Result<()> {
        let backends = self.live_backends(|key| keys.contains(key));
        for backend in &backends {
            backend.mark_as_deleted_and_close();
        }
        for backend in &backends {
            if !backend.wait_until_closed(self.config.close_timeout) {
                tracing::warn!(
                    origin = %backend.origin(),
                    name = %backend.name(),
                    "Timed out waiting for database to close"
                );
            }
        }

        for (origin, name) in keys {
            let registry = self.locks.registry();
            let Some(file) = lookup_path(&registry.catalog, origin, name)? else {
                continue;
            };
            let path = self.origin_directory(origin).join(file);
            remove_database_files(&path)?;

            registry.catalog.connection()?.execute(
                "DELETE FROM databases WHERE origin = ?1 AND name = ?2",
                params![origin.database_identifier(), name],
            )?;
            registry
                .quotas()
                .usage
                .remove(&(origin.clone(), name.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DatabaseTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseTracker")
            .field("database_directory", &self.config.database_directory)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Keeps (origin, name) in the being-created set
pub struct CreationGuard {
    tracker: Arc<DatabaseTracker>,
    key: DatabaseKey,
}

impl Drop for CreationGuard {
    fn drop(&mut self) {
        self.tracker.end_creation(&self.key);
    }
}

fn fits(usage: u64, requested: u64, limit: u64) -> bool {
    usage.checked_add(requested).is_some_and(|needed| needed <= limit)
}

fn being_deleted((origin, name): &DatabaseKey) -> DatabaseError {
    DatabaseError::BeingDeleted {
        origin: origin.to_string(),
        name: name.clone(),
    }
}

fn lookup_path(
    catalog: &SqliteDatabase,
    origin: &SecurityOrigin,
    name: &str,
) -> Result<Option<String>> {
    let file = catalog
        .connection()?
        .query_row(
            "SELECT path FROM databases WHERE origin = ?1 AND name = ?2",
            params![origin.database_identifier(), name],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(file)
}

fn load_quotas(catalog: &SqliteDatabase, quotas: &mut QuotaMap) -> Result<()> {
    let conn = catalog.connection()?;
    let mut stmt = conn.prepare("SELECT origin, quota FROM origins")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (identifier, quota) in rows {
        match SecurityOrigin::from_database_identifier(&identifier) {
            Some(origin) => {
                quotas.quotas.insert(origin, quota.max(0) as u64);
            }
            None => tracing::warn!(origin = %identifier, "Skipping malformed origin in catalog"),
        }
    }
    Ok(())
}

fn load_usage(catalog: &SqliteDatabase, directory: &Path, quotas: &mut QuotaMap) -> Result<()> {
    let conn = catalog.connection()?;
    let mut stmt = conn.prepare("SELECT origin, name, path FROM databases")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (identifier, name, file) in rows {
        let Some(origin) = SecurityOrigin::from_database_identifier(&identifier) else {
            tracing::warn!(origin = %identifier, "Skipping malformed origin in catalog");
            continue;
        };
        let usage = file_size(&directory.join(&identifier).join(file));
        quotas.usage.insert((origin, name), usage);
    }
    Ok(())
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn remove_database_files(path: &Path) -> Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        candidates.push(PathBuf::from(side));
    }

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn remove_dir_if_exists(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove origin directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SqlErrorCode;

    fn tracker(dir: &Path, quota: u64) -> Arc<DatabaseTracker> {
        let config = TrackerConfig {
            default_origin_quota: quota,
            ..TrackerConfig::new(dir)
        };
        DatabaseTracker::open(config).unwrap()
    }

    fn origin() -> SecurityOrigin {
        SecurityOrigin::new("https", "example.com", 443)
    }

    #[test]
    fn test_full_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 1024);

        let first = tracker
            .full_path_for_database(&origin(), "notes", true)
            .unwrap();
        let second = tracker
            .full_path_for_database(&origin(), "todo", true)
            .unwrap();

        let origin_dir = dir.path().join("https_example.com_443");
        assert_eq!(first, origin_dir.join("0000000000000001.db"));
        assert_eq!(second, origin_dir.join("0000000000000002.db"));
        assert!(origin_dir.is_dir());

        // Stable across lookups
        assert_eq!(
            tracker
                .full_path_for_database(&origin(), "notes", false)
                .unwrap(),
            first
        );
        assert!(matches!(
            tracker.full_path_for_database(&origin(), "missing", false),
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_can_establish_is_side_effect_free() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 1000);

        for _ in 0..3 {
            tracker
                .can_establish_database(&origin(), "small", 500)
                .unwrap();
            let err = tracker
                .can_establish_database(&origin(), "big", 5000)
                .unwrap_err();
            assert!(matches!(
                err,
                DatabaseError::QuotaExceeded {
                    requested: 5000,
                    quota: 1000,
                    ..
                }
            ));
        }
        assert!(tracker.database_names_for_origin(&origin()).unwrap().is_empty());
        assert_eq!(tracker.usage_for_origin(&origin()), 0);
    }

    #[test]
    fn test_existing_database_is_always_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 10);

        tracker
            .full_path_for_database(&origin(), "db", true)
            .unwrap();
        tracker.record_usage(&origin(), "db", 4096);

        tracker.can_establish_database(&origin(), "db", 1 << 20).unwrap();
        assert!(tracker
            .can_establish_database(&origin(), "other", 1)
            .is_err());
    }

    #[test]
    fn test_quota_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = tracker(dir.path(), 100);
            assert_eq!(tracker.quota_for_origin(&origin()), 100);
            tracker.set_quota(&origin(), 20_000).unwrap();
            tracker.shutdown();
        }

        let tracker = tracker(dir.path(), 100);
        assert_eq!(tracker.quota_for_origin(&origin()), 20_000);
        assert_eq!(tracker.origins().unwrap(), vec![origin()]);
    }

    #[test]
    fn test_max_size_accounts_for_sibling_databases() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 10_000);

        tracker.record_usage(&origin(), "a", 3_000);
        tracker.record_usage(&origin(), "b", 4_000);
        assert_eq!(tracker.usage_for_origin(&origin()), 7_000);
        assert_eq!(tracker.max_size_for_database(&origin(), "a"), 6_000);

        // Over quota: a database may keep what it has
        tracker.record_usage(&origin(), "b", 20_000);
        assert_eq!(tracker.max_size_for_database(&origin(), "a"), 3_000);
    }

    #[test]
    fn test_total_quota_binds_before_origin_quota() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig {
            default_origin_quota: 10_000,
            total_quota: Some(8_000),
            ..TrackerConfig::new(dir.path())
        };
        let tracker = DatabaseTracker::open(config).unwrap();
        let other = SecurityOrigin::new("https", "other.example", 443);

        tracker.record_usage(&other, "theirs", 5_000);
        tracker.record_usage(&origin(), "a", 1_000);
        assert_eq!(tracker.total_usage(), 6_000);

        // The origin quota alone would leave 9_000
        assert_eq!(tracker.max_size_for_database(&origin(), "a"), 3_000);
        assert!(tracker.total_quota_binds(&origin(), "a"));
        tracker.can_establish_database(&origin(), "b", 2_000).unwrap();
        let err = tracker
            .can_establish_database(&origin(), "b", 2_001)
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::TotalQuotaExceeded {
                usage: 6_000,
                requested: 2_001,
                limit: 8_000,
            }
        ));
        assert_eq!(err.code(), SqlErrorCode::Quota);

        // Never below what a database already holds
        tracker.record_usage(&other, "theirs", 9_000);
        assert_eq!(tracker.max_size_for_database(&origin(), "a"), 1_000);
        tracker.can_establish_database(&origin(), "a", 1 << 20).unwrap();
    }

    #[test]
    fn test_details_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 10_000);

        tracker
            .full_path_for_database(&origin(), "notes", true)
            .unwrap();
        tracker
            .set_database_details(&origin(), "notes", "My notes", 2048)
            .unwrap();

        let details = tracker
            .details_for_name_and_origin("notes", &origin())
            .unwrap();
        assert_eq!(details.display_name, "My notes");
        assert_eq!(details.expected_usage, 2048);
        assert!(details.creation_time.is_some());

        assert_eq!(
            tracker.database_names_for_origin(&origin()).unwrap(),
            vec!["notes".to_string()]
        );
        assert!(tracker
            .set_database_details(&origin(), "missing", "", 0)
            .is_err());
    }

    #[test]
    fn test_delete_refused_while_being_created() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 10_000);

        tracker
            .full_path_for_database(&origin(), "db", true)
            .unwrap();
        let guard = tracker.begin_creation(&origin(), "db").unwrap();
        assert!(matches!(
            tracker.delete_database(&origin(), "db"),
            Err(DatabaseError::BeingCreated { .. })
        ));

        drop(guard);
        tracker.delete_database(&origin(), "db").unwrap();
        assert!(tracker.database_names_for_origin(&origin()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_database_removes_file_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 10_000);
        let mut events = tracker.subscribe();

        let path = tracker
            .full_path_for_database(&origin(), "db", true)
            .unwrap();
        std::fs::write(&path, b"not really sqlite").unwrap();
        tracker.database_modified(&origin(), "db", &path);
        assert_eq!(tracker.usage_for_database(&origin(), "db"), 17);

        tracker.delete_database(&origin(), "db").unwrap();
        assert!(!path.exists());
        assert_eq!(tracker.usage_for_origin(&origin()), 0);

        assert!(matches!(
            events.try_recv().unwrap(),
            TrackerNotification::DatabaseChanged { usage: 17, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            TrackerNotification::DatabaseDeleted { .. }
        ));
    }

    #[test]
    fn test_delete_origin_clears_quota_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 10_000);

        tracker.set_quota(&origin(), 50_000).unwrap();
        tracker.full_path_for_database(&origin(), "a", true).unwrap();
        tracker.full_path_for_database(&origin(), "b", true).unwrap();

        tracker.delete_origin(&origin()).unwrap();
        assert!(tracker.origins().unwrap().is_empty());
        assert_eq!(tracker.quota_for_origin(&origin()), 10_000);
        assert!(!tracker.origin_directory(&origin()).exists());
    }

    #[test]
    fn test_shutdown_rejects_further_calls() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), 10_000);

        tracker.shutdown();
        assert!(matches!(
            tracker.full_path_for_database(&origin(), "db", true),
            Err(DatabaseError::TrackerClosed)
        ));
        // Idempotent
        tracker.shutdown();
    }
}
