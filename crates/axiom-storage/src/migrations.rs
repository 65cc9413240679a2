//! Catalog schemas
//!
//! Two catalogs live on disk next to the data they describe: the database
//! tracker's registry of origins and databases, and the application cache's
//! store of groups, caches and resources. Both are versioned through a
//! `schema_version` table that also records when the version was applied.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::Result;

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Catalog {
    /// `Databases.db`: origins, quotas and per-origin database files
    DatabaseTracker,
    /// `ApplicationCache.db`: cache groups, caches and resources
    ApplicationCache,
}

impl Catalog {
    pub fn file_name(&self) -> &'static str {
        match self {
            Catalog::DatabaseTracker => "Databases.db",
            Catalog::ApplicationCache => "ApplicationCache.db",
        }
    }
}

pub fn run_migrations(conn: &Connection, catalog: Catalog) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "{} has schema version {}, newer than supported version {}",
            catalog.file_name(),
            current_version,
            SCHEMA_VERSION
        )));
    }

    if current_version < 1 {
        match catalog {
            Catalog::DatabaseTracker => migrate_tracker_v1(conn)?,
            Catalog::ApplicationCache => migrate_application_cache_v1(conn)?,
        }
    }

    if current_version < SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
    }
    Ok(())
}

/// When the catalog's current schema version was applied
pub fn schema_applied_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let applied_at: Option<Option<String>> = conn
        .query_row("SELECT applied_at FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    applied_at
        .flatten()
        .map(|text| {
            DateTime::parse_from_rfc3339(&text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StorageError::Migration(format!("invalid applied_at {text:?}: {e}")))
        })
        .transpose()
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result: std::result::Result<i32, _> =
        conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        });

    match result {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(rusqlite::Error::SqliteFailure(_, _)) => {
            // Table doesn't exist yet
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL, applied_at TEXT)",
                [],
            )?;
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![version, Utc::now().to_rfc3339()],
    )?;
    tracing::debug!(version, "Schema version recorded");
    Ok(())
}

fn migrate_tracker_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1: database tracker catalog");

    // One row per origin that has an explicit quota
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS origins (
            origin TEXT NOT NULL UNIQUE ON CONFLICT REPLACE,
            quota INTEGER NOT NULL ON CONFLICT FAIL
        );
    "#,
    )?;

    // One row per (origin, name); path is relative to the origin directory
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS databases (
            guid INTEGER PRIMARY KEY AUTOINCREMENT,
            origin TEXT NOT NULL,
            name TEXT NOT NULL,
            display_name TEXT NOT NULL DEFAULT '',
            estimated_size INTEGER NOT NULL DEFAULT 0,
            path TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (origin, name)
        );

        CREATE INDEX IF NOT EXISTS idx_databases_origin ON databases(origin);
    "#,
    )?;

    Ok(())
}

fn migrate_application_cache_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1: application cache catalog");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cache_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            manifest_host_hash INTEGER NOT NULL,
            manifest_url TEXT NOT NULL UNIQUE,
            newest_cache INTEGER,
            origin TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cache_group INTEGER NOT NULL,
            size INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS cache_whitelist_urls (
            url TEXT NOT NULL ON CONFLICT FAIL,
            cache INTEGER NOT NULL ON CONFLICT FAIL
        );

        CREATE TABLE IF NOT EXISTS cache_allows_all_network_requests (
            wildcard INTEGER NOT NULL ON CONFLICT FAIL,
            cache INTEGER NOT NULL ON CONFLICT FAIL
        );

        CREATE TABLE IF NOT EXISTS fallback_urls (
            namespace TEXT NOT NULL,
            fallback_url TEXT NOT NULL,
            cache INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            cache INTEGER NOT NULL ON CONFLICT FAIL,
            type INTEGER NOT NULL,
            resource INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL ON CONFLICT FAIL,
            status_code INTEGER NOT NULL,
            response_url TEXT NOT NULL,
            mime_type TEXT,
            text_encoding_name TEXT,
            headers TEXT NOT NULL DEFAULT '[]',
            data INTEGER NOT NULL ON CONFLICT FAIL
        );

        CREATE TABLE IF NOT EXISTS cache_resource_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            data BLOB,
            path TEXT
        );

        CREATE TABLE IF NOT EXISTS deleted_cache_resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS origins (
            origin TEXT NOT NULL UNIQUE ON CONFLICT IGNORE,
            quota INTEGER NOT NULL ON CONFLICT FAIL
        );

        CREATE INDEX IF NOT EXISTS idx_cache_groups_origin ON cache_groups(origin);
        CREATE INDEX IF NOT EXISTS idx_caches_group ON caches(cache_group);
        CREATE INDEX IF NOT EXISTS idx_cache_entries_cache ON cache_entries(cache);
    "#,
    )?;

    // Deleting a row cascades down to its resources; flat files are queued
    // in deleted_cache_resources and removed from disk by the storage layer
    conn.execute_batch(
        r#"
        CREATE TRIGGER IF NOT EXISTS cache_group_deleted AFTER DELETE ON cache_groups
        FOR EACH ROW BEGIN
            DELETE FROM caches WHERE cache_group = OLD.id;
        END;

        CREATE TRIGGER IF NOT EXISTS cache_deleted AFTER DELETE ON caches
        FOR EACH ROW BEGIN
            DELETE FROM cache_entries WHERE cache = OLD.id;
            DELETE FROM cache_whitelist_urls WHERE cache = OLD.id;
            DELETE FROM cache_allows_all_network_requests WHERE cache = OLD.id;
            DELETE FROM fallback_urls WHERE cache = OLD.id;
        END;

        CREATE TRIGGER IF NOT EXISTS cache_entry_deleted AFTER DELETE ON cache_entries
        FOR EACH ROW BEGIN
            DELETE FROM cache_resources WHERE id = OLD.resource;
        END;

        CREATE TRIGGER IF NOT EXISTS cache_resource_deleted AFTER DELETE ON cache_resources
        FOR EACH ROW BEGIN
            DELETE FROM cache_resource_data WHERE id = OLD.data;
        END;

        CREATE TRIGGER IF NOT EXISTS cache_resource_data_deleted AFTER DELETE ON cache_resource_data
        FOR EACH ROW WHEN OLD.path NOT NULL BEGIN
            INSERT INTO deleted_cache_resources (path) VALUES (OLD.path);
        END;
    "#,
    )?;

    Ok(())
}
