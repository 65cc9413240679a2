//! Application cache storage
//!
//! ```text
//! <cache_directory>/ApplicationCache.db
//! <cache_directory>/ApplicationCache/<sha256 of body>   flat file resources
//! ```
//!
//! Bodies larger than the flat file threshold are written next to the
//! catalog instead of into it. Deleting rows queues their flat files in
//! `deleted_cache_resources` (see the catalog triggers); the files are
//! removed once nothing references them any more.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use axiom_storage::{run_migrations, Catalog, SqliteDatabase};

use crate::cache::{ApplicationCache, FallbackEntry};
use crate::error::CacheStorageError;
use crate::group::ApplicationCacheGroup;
use crate::journal::StorageIdJournal;
use crate::resource::{ApplicationCacheResource, ResourceResponse, ResourceType};
use crate::Result;

pub const DEFAULT_FLAT_FILE_THRESHOLD: u64 = 64 * 1024;

const FLAT_FILE_DIRECTORY: &str = "ApplicationCache";

#[derive(Debug, Clone)]
pub struct CacheStorageConfig {
    pub cache_directory: PathBuf,
    /// Catalog plus flat files; `u64::MAX` leaves the cache unbounded
    pub maximum_size: u64,
    pub default_origin_quota: u64,
    pub flat_file_threshold: u64,
}

impl CacheStorageConfig {
    pub fn new(cache_directory: impl Into<PathBuf>) -> Self {
        Self {
            cache_directory: cache_directory.into(),
            maximum_size: u64::MAX,
            default_origin_quota: 5 * 1024 * 1024,
            flat_file_threshold: DEFAULT_FLAT_FILE_THRESHOLD,
        }
    }
}

/// What a journal record refers to while a cache is being stored
#[derive(Debug, Clone, PartialEq, Eq)]
enum StorageEntity {
    Group,
    Cache,
    /// Resource key inside the newest cache
    Resource(String),
}

/// Flat files touched by one store
#[derive(Default)]
struct FlatFileWrites {
    /// (resource key, file name) for every resource stored as a flat file
    assigned: Vec<(String, String)>,
    /// Files this store created and must remove if it fails
    created: Vec<PathBuf>,
}

struct StoredResource {
    id: i64,
    url: String,
    status_code: u16,
    response_url: String,
    mime_type: Option<String>,
    text_encoding_name: Option<String>,
    headers: String,
    resource_type: u32,
    data: Option<Vec<u8>>,
    path: Option<String>,
}

struct StorageInner {
    db: SqliteDatabase,
    maximum_size: u64,
    default_origin_quota: u64,
}

pub struct ApplicationCacheStorage {
    config: CacheStorageConfig,
    catalog_path: PathBuf,
    flat_file_directory: PathBuf,
    inner: Mutex<StorageInner>,
}

impl ApplicationCacheStorage {
    pub fn open(config: CacheStorageConfig) -> Result<Self> {
        let flat_file_directory = config.cache_directory.join(FLAT_FILE_DIRECTORY);
        std::fs::create_dir_all(&flat_file_directory)?;

        let catalog_path = config
            .cache_directory
            .join(Catalog::ApplicationCache.file_name());
        let db = SqliteDatabase::open(&catalog_path)?;
        db.set_busy_timeout(Duration::from_secs(5))?;
        run_migrations(db.connection()?, Catalog::ApplicationCache)?;

        let storage = Self {
            inner: Mutex::new(StorageInner {
                db,
                maximum_size: config.maximum_size,
                default_origin_quota: config.default_origin_quota,
            }),
            config,
            catalog_path,
            flat_file_directory,
        };

        {
            let inner = storage.inner.lock();
            storage.apply_maximum_size(&inner)?;
            // Files queued by a run that stopped before cleaning up
            storage.check_for_deleted_resources(inner.db.connection()?)?;
        }

        tracing::info!(
            directory = %storage.config.cache_directory.display(),
            "Opened application cache storage"
        );
        Ok(storage)
    }

    pub fn config(&self) -> &CacheStorageConfig {
        &self.config
    }

    pub fn flat_file_directory(&self) -> &Path {
        &self.flat_file_directory
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock().db.close()?;
        Ok(())
    }

    // === Storing ===

    /// Persist the group's newest cache and make it the one the group
    /// serves. Older caches of the group go away with the same commit.
    ///
    /// All or nothing: on failure the catalog still holds the previous
    /// newest cache, the group and its cache keep the storage ids they had
    /// before the call, and flat files written on the way are removed.
    pub fn store_newest_cache(&self, group: &mut ApplicationCacheGroup) -> Result<()> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let cache = group.newest_cache().ok_or_else(|| {
            CacheStorageError::NotStored(format!(
                "cache group {} has no newest cache",
                group.manifest_url()
            ))
        })?;
        if cache.storage_id().is_some() {
            return Err(CacheStorageError::NotStored(format!(
                "newest cache of {} is already stored",
                group.manifest_url()
            )));
        }

        let origin = group.origin();
        let cache_size = cache.estimated_size_in_storage();
        check_origin_quota(
            conn,
            &origin,
            group.storage_id(),
            cache_size,
            inner.default_origin_quota,
        )?;
        self.apply_maximum_size(&inner)?;

        let mut journal = StorageIdJournal::new();
        let mut flat_files = FlatFileWrites::default();

        let tx = conn.unchecked_transaction()?;
        let result = match self.write_newest_cache(
            &tx,
            group,
            inner.default_origin_quota,
            &mut journal,
            &mut flat_files,
        ) {
            Ok(()) => tx.commit().map_err(CacheStorageError::from),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "Failed to roll back application cache store");
                }
                Err(err)
            }
        };

        if let Err(err) = result {
            journal.revert(|entity, previous| restore_storage_id(group, entity, previous));
            for path in &flat_files.created {
                if let Err(remove_err) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %remove_err, "Failed to remove flat file");
                }
            }

            let err = if err.is_disk_full() {
                CacheStorageError::DiskFull {
                    space_needed: self.space_needed_locked(&inner, cache_size)?,
                }
            } else {
                err
            };
            tracing::warn!(
                manifest = %group.manifest_url(),
                error = %err,
                "Failed to store newest application cache"
            );
            return Err(err);
        }

        journal.commit();
        if let Some(cache) = group.newest_cache_mut() {
            for (key, name) in flat_files.assigned {
                if let Some(resource) = cache.resource_for_key_mut(&key) {
                    resource.set_path(Some(self.flat_file_directory.join(name)));
                }
            }
        }
        self.check_for_deleted_resources(conn)?;

        tracing::info!(
            manifest = %group.manifest_url(),
            origin = %origin,
            size = cache_size,
            "Stored newest application cache"
        );
        Ok(())
    }

    fn write_newest_cache(
        &self,
        conn: &Connection,
        group: &mut ApplicationCacheGroup,
        default_origin_quota: u64,
        journal: &mut StorageIdJournal<StorageEntity>,
        flat_files: &mut FlatFileWrites,
    ) -> Result<()> {
        let group_id = match group.storage_id() {
            Some(id) => id,
            None => store_group(conn, group, default_origin_quota, journal)?,
        };

        let cache = group.newest_cache_mut().ok_or_else(|| {
            CacheStorageError::NotStored("cache group lost its newest cache".into())
        })?;
        let cache_id = self.store_cache(conn, group_id, cache, journal, flat_files)?;

        conn.execute(
            "UPDATE cache_groups SET newest_cache = ?1 WHERE id = ?2",
            params![cache_id, group_id],
        )?;
        conn.execute(
            "DELETE FROM caches WHERE cache_group = ?1 AND id != ?2",
            params![group_id, cache_id],
        )?;
        Ok(())
    }

    fn store_cache(
        &self,
        conn: &Connection,
        group_id: i64,
        cache: &mut ApplicationCache,
        journal: &mut StorageIdJournal<StorageEntity>,
        flat_files: &mut FlatFileWrites,
    ) -> Result<i64> {
        journal.record(StorageEntity::Cache, cache.storage_id());
        conn.execute(
            "INSERT INTO caches (cache_group, size) VALUES (?1, ?2)",
            params![group_id, cache.estimated_size_in_storage() as i64],
        )?;
        let cache_id = conn.last_insert_rowid();
        cache.set_storage_id(Some(cache_id));

        for (key, resource) in cache.resources_mut() {
            self.store_resource(conn, cache_id, key, resource, journal, flat_files)?;
        }

        for url in cache.online_whitelist() {
            conn.execute(
                "INSERT INTO cache_whitelist_urls (url, cache) VALUES (?1, ?2)",
                params![url.as_str(), cache_id],
            )?;
        }

        if cache.allows_all_network_requests() {
            conn.execute(
                "INSERT INTO cache_allows_all_network_requests (wildcard, cache) VALUES (1, ?1)",
                params![cache_id],
            )?;
        }

        for entry in cache.fallback_urls() {
            conn.execute(
                "INSERT INTO fallback_urls (namespace, fallback_url, cache) VALUES (?1, ?2, ?3)",
                params![entry.namespace.as_str(), entry.fallback_url.as_str(), cache_id],
            )?;
        }

        Ok(cache_id)
    }

    fn store_resource(
        &self,
        conn: &Connection,
        cache_id: i64,
        key: &str,
        resource: &mut ApplicationCacheResource,
        journal: &mut StorageIdJournal<StorageEntity>,
        flat_files: &mut FlatFileWrites,
    ) -> Result<()> {
        journal.record(StorageEntity::Resource(key.to_string()), resource.storage_id());
        let data = resource.data();
        let (blob, path): (Option<&[u8]>, Option<String>) =
            if data.len() as u64 > self.config.flat_file_threshold {
                (None, Some(self.write_flat_file(data, flat_files)?))
            } else {
                (Some(data), None)
            };

        conn.execute(
            "INSERT INTO cache_resource_data (data, path) VALUES (?1, ?2)",
            params![blob, path],
        )?;
        let data_id = conn.last_insert_rowid();

        let response = resource.response();
        let headers = serde_json::to_string(&response.headers)?;
        conn.execute(
            "INSERT INTO cache_resources (url, status_code, response_url, mime_type, text_encoding_name, headers, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                resource.url().as_str(),
                response.status_code,
                response.url.as_str(),
                response.mime_type,
                response.text_encoding_name,
                headers,
                data_id,
            ],
        )?;
        let resource_id = conn.last_insert_rowid();

        conn.execute(
            "INSERT INTO cache_entries (cache, type, resource) VALUES (?1, ?2, ?3)",
            params![cache_id, resource.resource_type().bits(), resource_id],
        )?;

        resource.set_storage_id(Some(resource_id));
        if let Some(name) = path {
            flat_files.assigned.push((key.to_string(), name));
        }
        Ok(())
    }

    /// Write `data` to a file named by its content hash. Identical bodies
    /// share one file.
    fn write_flat_file(&self, data: &[u8], flat_files: &mut FlatFileWrites) -> Result<String> {
        let name = content_hash(data);
        let path = self.flat_file_directory.join(&name);
        if !path.exists() {
            flat_files.created.push(path.clone());
            std::fs::write(&path, data)?;
        }
        Ok(name)
    }

    /// Change the kind of an already stored resource
    pub fn store_updated_type(
        &self,
        resource: &ApplicationCacheResource,
        cache: &ApplicationCache,
    ) -> Result<()> {
        let (Some(resource_id), Some(cache_id)) = (resource.storage_id(), cache.storage_id()) else {
            return Err(CacheStorageError::NotStored(format!(
                "resource {} is not stored",
                resource.url()
            )));
        };

        let inner = self.inner.lock();
        let updated = inner.db.connection()?.execute(
            "UPDATE cache_entries SET type = ?1 WHERE resource = ?2 AND cache = ?3",
            params![resource.resource_type().bits(), resource_id, cache_id],
        )?;
        if updated == 0 {
            return Err(CacheStorageError::NotStored(format!(
                "no entry for {} in cache {cache_id}",
                resource.url()
            )));
        }
        Ok(())
    }

    // === Loading ===

    pub fn load_cache_group(&self, manifest_url: &Url) -> Result<Option<ApplicationCacheGroup>> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let row: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT id, newest_cache FROM cache_groups WHERE manifest_url = ?1",
                [manifest_url.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((group_id, newest_cache)) = row else {
            return Ok(None);
        };

        let mut group = ApplicationCacheGroup::new(manifest_url.clone());
        group.set_storage_id(Some(group_id));
        if let Some(cache_id) = newest_cache {
            group.set_newest_cache(self.load_cache(conn, cache_id)?);
        }
        Ok(Some(group))
    }

    /// The stored group for `manifest_url`, or a fresh unstored one
    pub fn cache_group_for_manifest(&self, manifest_url: &Url) -> Result<ApplicationCacheGroup> {
        Ok(self
            .load_cache_group(manifest_url)?
            .unwrap_or_else(|| ApplicationCacheGroup::new(manifest_url.clone())))
    }

    fn load_cache(&self, conn: &Connection, cache_id: i64) -> Result<ApplicationCache> {
        let mut cache = ApplicationCache::new();

        let mut stmt = conn.prepare(
            "SELECT r.id, r.url, r.status_code, r.response_url, r.mime_type, r.text_encoding_name,
                    r.headers, e.type, d.data, d.path
             FROM cache_entries e
             JOIN cache_resources r ON r.id = e.resource
             JOIN cache_resource_data d ON d.id = r.data
             WHERE e.cache = ?1",
        )?;
        let rows = stmt.query_map([cache_id], |row| {
            Ok(StoredResource {
                id: row.get(0)?,
                url: row.get(1)?,
                status_code: row.get(2)?,
                response_url: row.get(3)?,
                mime_type: row.get(4)?,
                text_encoding_name: row.get(5)?,
                headers: row.get(6)?,
                resource_type: row.get(7)?,
                data: row.get(8)?,
                path: row.get(9)?,
            })
        })?;

        for row in rows {
            let row = row?;
            let (data, path) = match row.path {
                Some(name) => {
                    let path = self.flat_file_path(&name);
                    (std::fs::read(&path)?, Some(path))
                }
                None => (row.data.unwrap_or_default(), None),
            };

            let response = ResourceResponse {
                url: Url::parse(&row.response_url)?,
                status_code: row.status_code,
                mime_type: row.mime_type,
                text_encoding_name: row.text_encoding_name,
                headers: serde_json::from_str(&row.headers)?,
            };
            let mut resource = ApplicationCacheResource::new(
                Url::parse(&row.url)?,
                response,
                ResourceType::from_bits(row.resource_type),
                data,
            );
            resource.set_storage_id(Some(row.id));
            resource.set_path(path);
            cache.add_resource(resource);
        }

        let mut stmt = conn.prepare("SELECT url FROM cache_whitelist_urls WHERE cache = ?1")?;
        let whitelist = stmt
            .query_map([cache_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        cache.set_online_whitelist(
            whitelist
                .iter()
                .map(|url| Url::parse(url))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        );

        let allows_all: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM cache_allows_all_network_requests WHERE cache = ?1 AND wildcard = 1)",
            [cache_id],
            |row| row.get(0),
        )?;
        cache.set_allows_all_network_requests(allows_all);

        let mut stmt =
            conn.prepare("SELECT namespace, fallback_url FROM fallback_urls WHERE cache = ?1")?;
        let fallbacks = stmt
            .query_map([cache_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut entries = Vec::with_capacity(fallbacks.len());
        for (namespace, fallback_url) in fallbacks {
            entries.push(FallbackEntry {
                namespace: Url::parse(&namespace)?,
                fallback_url: Url::parse(&fallback_url)?,
            });
        }
        cache.set_fallback_urls(entries);

        cache.set_storage_id(Some(cache_id));
        Ok(cache)
    }

    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let mut stmt = conn.prepare("SELECT manifest_url FROM cache_groups ORDER BY id")?;
        let urls = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        urls.iter()
            .map(|url| Url::parse(url).map_err(CacheStorageError::from))
            .collect()
    }

    pub fn origins_with_cache(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let mut stmt = conn.prepare("SELECT DISTINCT origin FROM cache_groups ORDER BY origin")?;
        let origins = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(origins)
    }

    // === Removal ===

    /// Delete a stored cache. When it was its group's newest cache the
    /// group goes too, since nothing is left for it to serve.
    pub fn remove_cache(&self, cache: &mut ApplicationCache) -> Result<()> {
        let Some(cache_id) = cache.storage_id() else {
            return Ok(());
        };

        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let tx = conn.unchecked_transaction()?;
        let owning_group: Option<i64> = tx
            .query_row(
                "SELECT id FROM cache_groups WHERE newest_cache = ?1",
                [cache_id],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute("DELETE FROM caches WHERE id = ?1", [cache_id])?;
        if let Some(group_id) = owning_group {
            tx.execute("DELETE FROM cache_groups WHERE id = ?1", [group_id])?;
        }
        tx.commit()?;

        clear_storage_ids(cache);
        self.check_for_deleted_resources(conn)?;

        tracing::debug!(cache_id, "Removed application cache");
        Ok(())
    }

    /// The manifest is gone: drop the group and everything stored for it
    pub fn cache_group_made_obsolete(&self, group: &mut ApplicationCacheGroup) -> Result<()> {
        if let Some(group_id) = group.storage_id() {
            let inner = self.inner.lock();
            let conn = inner.db.connection()?;
            conn.execute("DELETE FROM cache_groups WHERE id = ?1", [group_id])?;
            self.check_for_deleted_resources(conn)?;
        }

        if let Some(cache) = group.newest_cache_mut() {
            clear_storage_ids(cache);
        }
        group.mark_obsolete();

        tracing::info!(manifest = %group.manifest_url(), "Application cache group made obsolete");
        Ok(())
    }

    /// Returns whether a group was stored for `manifest_url`
    pub fn delete_cache_group(&self, manifest_url: &Url) -> Result<bool> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let deleted = conn.execute(
            "DELETE FROM cache_groups WHERE manifest_url = ?1",
            [manifest_url.as_str()],
        )?;
        self.check_for_deleted_resources(conn)?;

        if deleted > 0 {
            tracing::info!(manifest = %manifest_url, "Deleted application cache group");
        }
        Ok(deleted > 0)
    }

    /// Delete every group whose manifest belongs to `origin`. The origin's
    /// quota is kept.
    pub fn delete_caches_for_origin(&self, origin: &str) -> Result<usize> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let deleted = conn.execute("DELETE FROM cache_groups WHERE origin = ?1", [origin])?;
        self.check_for_deleted_resources(conn)?;

        tracing::info!(origin = %origin, groups = deleted, "Deleted application caches for origin");
        Ok(deleted)
    }

    /// Remove every row of every table, quotas included
    pub fn empty(&self) -> Result<()> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(
            r#"
            DELETE FROM origins;
            DELETE FROM cache_groups;
            DELETE FROM caches;
            DELETE FROM cache_allows_all_network_requests;
            DELETE FROM cache_entries;
            DELETE FROM cache_whitelist_urls;
            DELETE FROM fallback_urls;
            DELETE FROM cache_resources;
            DELETE FROM cache_resource_data;
        "#,
        )?;
        tx.commit()?;
        self.check_for_deleted_resources(conn)?;

        tracing::info!("Emptied application cache storage");
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.db.vacuum()?;
        Ok(())
    }

    pub fn delete_all_entries(&self) -> Result<()> {
        self.empty()?;
        self.vacuum()
    }

    // === Size and quota ===

    pub fn maximum_size(&self) -> u64 {
        self.inner.lock().maximum_size
    }

    pub fn set_maximum_size(&self, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.maximum_size = size;
        self.apply_maximum_size(&inner)
    }

    pub fn default_origin_quota(&self) -> u64 {
        self.inner.lock().default_origin_quota
    }

    pub fn set_default_origin_quota(&self, quota: u64) {
        self.inner.lock().default_origin_quota = quota;
    }

    /// How much space must be freed before a cache of `cache_to_save` bytes
    /// fits under the maximum size
    pub fn space_needed(&self, cache_to_save: u64) -> Result<u64> {
        let inner = self.inner.lock();
        self.space_needed_locked(&inner, cache_to_save)
    }

    fn space_needed_locked(&self, inner: &StorageInner, cache_to_save: u64) -> Result<u64> {
        let file_size = match std::fs::metadata(&self.catalog_path) {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(0),
        };
        let current_size = file_size + self.flat_file_area_size(inner.db.connection()?)?;
        let free_space = inner.db.free_space_size()?;

        // Past the maximum, only free pages inside the catalog can be reused
        let available = if inner.maximum_size < current_size {
            free_space
        } else {
            (inner.maximum_size - current_size).saturating_add(free_space)
        };
        Ok(cache_to_save.saturating_sub(available))
    }

    pub fn quota_for_origin(&self, origin: &str) -> Result<u64> {
        let inner = self.inner.lock();
        quota_for_origin(inner.db.connection()?, origin, inner.default_origin_quota)
    }

    pub fn store_updated_quota_for_origin(&self, origin: &str, quota: u64) -> Result<()> {
        let inner = self.inner.lock();
        inner.db.connection()?.execute(
            "INSERT OR REPLACE INTO origins (origin, quota) VALUES (?1, ?2)",
            params![origin, quota as i64],
        )?;

        tracing::info!(origin = %origin, quota, "Updated application cache quota");
        Ok(())
    }

    /// Bytes used by every stored cache of the origin
    pub fn usage_for_origin(&self, origin: &str) -> Result<u64> {
        let inner = self.inner.lock();
        usage_for_origin(inner.db.connection()?, origin, None)
    }

    pub fn remaining_size_for_origin(&self, origin: &str) -> Result<u64> {
        let inner = self.inner.lock();
        let conn = inner.db.connection()?;
        let quota = quota_for_origin(conn, origin, inner.default_origin_quota)?;
        Ok(quota.saturating_sub(usage_for_origin(conn, origin, None)?))
    }

    /// The catalog gets whatever the flat files leave of the maximum size
    fn apply_maximum_size(&self, inner: &StorageInner) -> Result<()> {
        let flat_files = self.flat_file_area_size(inner.db.connection()?)?;
        inner
            .db
            .set_maximum_size(inner.maximum_size.saturating_sub(flat_files))?;
        Ok(())
    }

    fn flat_file_area_size(&self, conn: &Connection) -> Result<u64> {
        let mut stmt =
            conn.prepare("SELECT DISTINCT path FROM cache_resource_data WHERE path IS NOT NULL")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(names
            .iter()
            .filter_map(|name| std::fs::metadata(self.flat_file_path(name)).ok())
            .map(|metadata| metadata.len())
            .sum())
    }

    // === Flat file cleanup ===

    fn flat_file_path(&self, name: &str) -> PathBuf {
        // Only ever a bare file name inside the flat file directory
        let name = Path::new(name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        self.flat_file_directory.join(name)
    }

    /// Remove queued flat files that no remaining resource points at
    fn check_for_deleted_resources(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare("SELECT DISTINCT path FROM deleted_cache_resources")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if names.is_empty() {
            return Ok(());
        }

        for name in &names {
            let referenced: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM cache_resource_data WHERE path = ?1)",
                [name],
                |row| row.get(0),
            )?;
            if referenced {
                continue;
            }

            let path = self.flat_file_path(name);
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed flat file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Failed to remove flat file")
                }
            }
        }

        conn.execute("DELETE FROM deleted_cache_resources", [])?;
        Ok(())
    }
}

fn store_group(
    conn: &Connection,
    group: &mut ApplicationCacheGroup,
    default_origin_quota: u64,
    journal: &mut StorageIdJournal<StorageEntity>,
) -> Result<i64> {
    let origin = group.origin();
    journal.record(StorageEntity::Group, group.storage_id());
    conn.execute(
        "INSERT INTO cache_groups (manifest_host_hash, manifest_url, origin) VALUES (?1, ?2, ?3)",
        params![group.manifest_host_hash(), group.manifest_url().as_str(), origin],
    )?;
    let group_id = conn.last_insert_rowid();
    group.set_storage_id(Some(group_id));

    // Ignored when the origin already has a quota
    conn.execute(
        "INSERT INTO origins (origin, quota) VALUES (?1, ?2)",
        params![origin, default_origin_quota as i64],
    )?;
    Ok(group_id)
}

fn restore_storage_id(group: &mut ApplicationCacheGroup, entity: &StorageEntity, previous: Option<i64>) {
    match entity {
        StorageEntity::Group => group.set_storage_id(previous),
        StorageEntity::Cache => {
            if let Some(cache) = group.newest_cache_mut() {
                cache.set_storage_id(previous);
            }
        }
        StorageEntity::Resource(key) => {
            if let Some(resource) = group
                .newest_cache_mut()
                .and_then(|cache| cache.resource_for_key_mut(key))
            {
                resource.set_storage_id(previous);
            }
        }
    }
}

fn clear_storage_ids(cache: &mut ApplicationCache) {
    cache.set_storage_id(None);
    for (_, resource) in cache.resources_mut() {
        resource.set_storage_id(None);
        resource.set_path(None);
    }
}

/// Fails when storing `cache_size` more bytes for `origin` would pass its
/// quota. Caches of `replacing_group` are not counted since a successful
/// store removes them.
fn check_origin_quota(
    conn: &Connection,
    origin: &str,
    replacing_group: Option<i64>,
    cache_size: u64,
    default_origin_quota: u64,
) -> Result<()> {
    let quota = quota_for_origin(conn, origin, default_origin_quota)?;
    let usage = usage_for_origin(conn, origin, replacing_group)?;

    if cache_size > quota.saturating_sub(usage) {
        return Err(CacheStorageError::OriginQuotaExceeded {
            origin: origin.to_string(),
            space_needed: usage + cache_size,
        });
    }
    Ok(())
}

fn quota_for_origin(conn: &Connection, origin: &str, default_origin_quota: u64) -> Result<u64> {
    let quota: Option<i64> = conn
        .query_row(
            "SELECT quota FROM origins WHERE origin = ?1",
            [origin],
            |row| row.get(0),
        )
        .optional()?;
    Ok(quota.map_or(default_origin_quota, |quota| quota.max(0) as u64))
}

fn usage_for_origin(conn: &Connection, origin: &str, excluding_group: Option<i64>) -> Result<u64> {
    let usage: i64 = conn.query_row(
        "SELECT COALESCE(SUM(c.size), 0)
         FROM cache_groups g
         JOIN caches c ON c.cache_group = g.id
         WHERE g.origin = ?1 AND g.id IS NOT ?2",
        params![origin, excluding_group],
        |row| row.get(0),
    )?;
    Ok(usage.max(0) as u64)
}

fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(threshold: u64) -> (TempDir, ApplicationCacheStorage) {
        let dir = TempDir::new().unwrap();
        let mut config = CacheStorageConfig::new(dir.path());
        config.flat_file_threshold = threshold;
        let storage = ApplicationCacheStorage::open(config).unwrap();
        (dir, storage)
    }

    fn resource(url: &str, size: usize, fill: u8) -> ApplicationCacheResource {
        let url = Url::parse(url).unwrap();
        let response = ResourceResponse::ok(url.clone(), "text/plain");
        ApplicationCacheResource::new(url, response, ResourceType::EXPLICIT, vec![fill; size])
    }

    fn group_with(manifest: &str, resources: Vec<ApplicationCacheResource>) -> ApplicationCacheGroup {
        let mut group = ApplicationCacheGroup::new(Url::parse(manifest).unwrap());
        let mut cache = ApplicationCache::new();
        for resource in resources {
            cache.add_resource(resource);
        }
        group.set_newest_cache(cache);
        group
    }

    #[test]
    fn test_ids_are_journaled_before_rows_are_written() {
        let (_dir, storage) = storage(DEFAULT_FLAT_FILE_THRESHOLD);
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, Catalog::ApplicationCache).unwrap();
        conn.execute_batch(
            "DROP TABLE cache_groups; DROP TABLE caches; DROP TABLE cache_resource_data;",
        )
        .unwrap();
        let mut journal = StorageIdJournal::new();

        let mut group = group_with(
            "https://a.test/app.manifest",
            vec![resource("https://a.test/x", 10, b'x')],
        );
        assert!(store_group(&conn, &mut group, 1024, &mut journal).is_err());
        assert_eq!(journal.len(), 1);

        let cache = group.newest_cache_mut().unwrap();
        cache.set_storage_id(Some(7));
        let mut flat_files = FlatFileWrites::default();
        assert!(storage
            .store_cache(&conn, 1, cache, &mut journal, &mut flat_files)
            .is_err());
        assert_eq!(journal.len(), 2);

        let (key, resource) = cache.resources_mut().next().unwrap();
        resource.set_storage_id(Some(42));
        let key = key.to_string();
        assert!(storage
            .store_resource(&conn, 1, &key, resource, &mut journal, &mut flat_files)
            .is_err());
        assert_eq!(journal.len(), 3);

        // Nothing was written, reverting puts back what was there
        journal.revert(|entity, previous| restore_storage_id(&mut group, entity, previous));
        assert!(group.storage_id().is_none());
        let cache = group.newest_cache().unwrap();
        assert_eq!(cache.storage_id(), Some(7));
        assert!(cache.resources().all(|r| r.storage_id() == Some(42)));
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let (_dir, storage) = storage(DEFAULT_FLAT_FILE_THRESHOLD);
        let mut group = group_with(
            "https://a.test/app.manifest",
            vec![resource("https://a.test/index.html", 10, b'i')],
        );
        let cache = group.newest_cache_mut().unwrap();
        cache.set_online_whitelist(vec![Url::parse("https://a.test/api/").unwrap()]);
        cache.set_allows_all_network_requests(true);
        cache.set_fallback_urls(vec![FallbackEntry {
            namespace: Url::parse("https://a.test/").unwrap(),
            fallback_url: Url::parse("https://a.test/offline.html").unwrap(),
        }]);

        storage.store_newest_cache(&mut group).unwrap();
        assert!(group.storage_id().is_some());

        let loaded = storage
            .load_cache_group(group.manifest_url())
            .unwrap()
            .unwrap();
        let cache = loaded.newest_cache().unwrap();
        assert_eq!(cache.storage_id(), group.newest_cache().unwrap().storage_id());
        assert_eq!(cache.resource_count(), 1);
        assert!(cache.allows_all_network_requests());
        assert_eq!(cache.online_whitelist().len(), 1);
        assert_eq!(cache.fallback_urls().len(), 1);

        let index = cache
            .resource_for_url(&Url::parse("https://a.test/index.html").unwrap())
            .unwrap();
        assert_eq!(index.data(), &[b'i'; 10][..]);
        assert_eq!(index.response().mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_origin_quota_is_checked_before_writing() {
        let (_dir, storage) = storage(DEFAULT_FLAT_FILE_THRESHOLD);
        storage
            .store_updated_quota_for_origin("https://a.test", 1024)
            .unwrap();

        let mut group = group_with(
            "https://a.test/app.manifest",
            vec![resource("https://a.test/big", 4096, b'b')],
        );
        let err = storage.store_newest_cache(&mut group).unwrap_err();
        match err {
            CacheStorageError::OriginQuotaExceeded { space_needed, .. } => {
                assert!(space_needed > 4096)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(group.storage_id().is_none());
        assert!(storage.manifest_urls().unwrap().is_empty());
    }

    #[test]
    fn test_replacing_newest_cache_drops_the_old_one() {
        let (_dir, storage) = storage(DEFAULT_FLAT_FILE_THRESHOLD);
        let manifest = "https://a.test/app.manifest";

        let mut group = group_with(manifest, vec![resource("https://a.test/v1", 100, b'1')]);
        storage.store_newest_cache(&mut group).unwrap();
        let first_usage = storage.usage_for_origin("https://a.test").unwrap();

        let mut next = ApplicationCache::new();
        next.add_resource(resource("https://a.test/v2", 100, b'2'));
        group.set_newest_cache(next);
        storage.store_newest_cache(&mut group).unwrap();

        assert_eq!(storage.usage_for_origin("https://a.test").unwrap(), first_usage);
        let loaded = storage
            .load_cache_group(&Url::parse(manifest).unwrap())
            .unwrap()
            .unwrap();
        let cache = loaded.newest_cache().unwrap();
        assert!(cache
            .resource_for_url(&Url::parse("https://a.test/v2").unwrap())
            .is_some());
        assert!(cache
            .resource_for_url(&Url::parse("https://a.test/v1").unwrap())
            .is_none());
    }

    #[test]
    fn test_flat_files_are_shared_and_cleaned_up() {
        let (_dir, storage) = storage(16);
        let mut first = group_with(
            "https://a.test/one.manifest",
            vec![resource("https://a.test/shared", 64, b's')],
        );
        let mut second = group_with(
            "https://a.test/two.manifest",
            vec![resource("https://a.test/shared", 64, b's')],
        );
        storage.store_newest_cache(&mut first).unwrap();
        storage.store_newest_cache(&mut second).unwrap();

        let path = first
            .newest_cache()
            .unwrap()
            .resources()
            .next()
            .unwrap()
            .path()
            .unwrap()
            .to_path_buf();
        assert!(path.starts_with(storage.flat_file_directory()));
        assert!(path.exists());

        assert!(storage.delete_cache_group(first.manifest_url()).unwrap());
        assert!(path.exists(), "still referenced by the second group");

        storage.cache_group_made_obsolete(&mut second).unwrap();
        assert!(second.is_obsolete());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_newest_cache_removes_group() {
        let (_dir, storage) = storage(DEFAULT_FLAT_FILE_THRESHOLD);
        let mut group = group_with(
            "https://a.test/app.manifest",
            vec![resource("https://a.test/a", 10, b'a')],
        );
        storage.store_newest_cache(&mut group).unwrap();

        let mut cache = group.newest_cache().unwrap().clone();
        storage.remove_cache(&mut cache).unwrap();

        assert!(cache.storage_id().is_none());
        assert!(cache.resources().all(|r| r.storage_id().is_none()));
        assert!(storage
            .load_cache_group(group.manifest_url())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_quota_usage_and_origins() {
        let (_dir, storage) = storage(DEFAULT_FLAT_FILE_THRESHOLD);
        assert_eq!(storage.quota_for_origin("https://a.test").unwrap(), 5 * 1024 * 1024);

        let mut a = group_with("https://a.test/m", vec![resource("https://a.test/x", 500, b'x')]);
        let mut b = group_with("https://b.test/m", vec![resource("https://b.test/x", 500, b'x')]);
        storage.store_newest_cache(&mut a).unwrap();
        storage.store_newest_cache(&mut b).unwrap();

        let size = a.newest_cache().unwrap().estimated_size_in_storage();
        assert_eq!(storage.usage_for_origin("https://a.test").unwrap(), size);
        assert_eq!(
            storage.remaining_size_for_origin("https://a.test").unwrap(),
            5 * 1024 * 1024 - size
        );
        assert_eq!(
            storage.origins_with_cache().unwrap(),
            vec!["https://a.test".to_string(), "https://b.test".to_string()]
        );

        assert_eq!(storage.delete_caches_for_origin("https://a.test").unwrap(), 1);
        assert_eq!(storage.usage_for_origin("https://a.test").unwrap(), 0);
        assert_eq!(storage.manifest_urls().unwrap().len(), 1);

        storage.delete_all_entries().unwrap();
        assert!(storage.origins_with_cache().unwrap().is_empty());
    }

    #[test]
    fn test_store_updated_type() {
        let (_dir, storage) = storage(DEFAULT_FLAT_FILE_THRESHOLD);
        let mut group = group_with("https://a.test/m", vec![resource("https://a.test/x", 10, b'x')]);

        let unstored = group.newest_cache().unwrap().resources().next().unwrap().clone();
        assert!(matches!(
            storage.store_updated_type(&unstored, group.newest_cache().unwrap()),
            Err(CacheStorageError::NotStored(_))
        ));

        storage.store_newest_cache(&mut group).unwrap();
        let cache = group.newest_cache().unwrap();
        let mut resource = cache.resources().next().unwrap().clone();
        resource.add_type(ResourceType::MASTER);
        storage.store_updated_type(&resource, cache).unwrap();

        let loaded = storage.load_cache_group(group.manifest_url()).unwrap().unwrap();
        let stored = loaded.newest_cache().unwrap().resources().next().unwrap().clone();
        assert!(stored.resource_type().contains(ResourceType::MASTER | ResourceType::EXPLICIT));
    }
}
