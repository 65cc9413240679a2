//! Web storage lifecycle
//!
//! `WebStorage` is the one value a host creates: it opens the database
//! tracker and the application cache from a `Config`, hands out script
//! contexts, and closes everything on `shutdown`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

use axiom_appcache::ApplicationCacheStorage;
use axiom_webdb::{DatabaseContext, DatabaseManager, DatabaseTracker, ScriptContext, SecurityOrigin};

use crate::config::Config;
use crate::error::CoreError;
use crate::Result;

/// Bytes an origin keeps in each storage area
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginUsage {
    pub origin: String,
    pub database_usage: u64,
    pub database_quota: u64,
    pub application_cache_usage: u64,
    pub application_cache_quota: u64,
}

pub struct WebStorage {
    config: Config,
    databases: DatabaseManager,
    application_cache: Arc<ApplicationCacheStorage>,
    opened_at: DateTime<Utc>,
    shut_down: AtomicBool,
}

impl WebStorage {
    /// Create the storage directories and open both catalogs
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let tracker = DatabaseTracker::open(config.tracker_config())?;
        let application_cache = match ApplicationCacheStorage::open(config.cache_storage_config()) {
            Ok(storage) => Arc::new(storage),
            Err(err) => {
                tracker.shutdown();
                return Err(err.into());
            }
        };

        tracing::info!(
            databases = %config.database_directory.display(),
            application_cache = %config.application_cache_directory.display(),
            "Web storage opened"
        );

        Ok(Self {
            config,
            databases: DatabaseManager::new(tracker),
            application_cache,
            opened_at: Utc::now(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn databases(&self) -> &DatabaseManager {
        &self.databases
    }

    pub fn tracker(&self) -> &Arc<DatabaseTracker> {
        self.databases.tracker()
    }

    pub fn application_cache(&self) -> &Arc<ApplicationCacheStorage> {
        &self.application_cache
    }

    /// Database access for scripts of `origin` running on `script`
    pub fn create_context(&self, script: ScriptContext, origin: SecurityOrigin) -> Result<DatabaseContext> {
        self.ensure_open()?;
        Ok(self.databases.create_context(script, origin))
    }

    pub fn origin_usage(&self, origin: &SecurityOrigin) -> Result<OriginUsage> {
        self.ensure_open()?;
        let cache_origin = application_cache_origin(origin)?;
        let tracker = self.tracker();

        Ok(OriginUsage {
            origin: origin.to_string(),
            database_usage: tracker.usage_for_origin(origin),
            database_quota: tracker.quota_for_origin(origin),
            application_cache_usage: self.application_cache.usage_for_origin(&cache_origin)?,
            application_cache_quota: self.application_cache.quota_for_origin(&cache_origin)?,
        })
    }

    /// Remove every web database and application cache of `origin`
    pub fn delete_origin_data(&self, origin: &SecurityOrigin) -> Result<()> {
        self.ensure_open()?;
        self.tracker().delete_origin(origin)?;
        self.application_cache
            .delete_caches_for_origin(&application_cache_origin(origin)?)?;

        tracing::info!(origin = %origin, "Deleted web storage for origin");
        Ok(())
    }

    /// Stop all transactions, close every database and both catalogs
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.databases.shutdown();
        self.application_cache.close()?;

        tracing::info!("Web storage shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(CoreError::ShutDown);
        }
        Ok(())
    }
}

impl Drop for WebStorage {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %err, "Web storage shutdown failed");
        }
    }
}

/// Application cache groups are keyed by the serialized manifest origin,
/// which leaves out default ports
fn application_cache_origin(origin: &SecurityOrigin) -> Result<String> {
    let url = Url::parse(&format!("{}://{}:{}/", origin.scheme(), origin.host(), origin.port()))
        .map_err(|e| CoreError::Config(format!("origin {origin} is not a URL origin: {e}")))?;
    Ok(url.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn web_storage() -> (TempDir, WebStorage) {
        let dir = TempDir::new().unwrap();
        let storage = WebStorage::new(Config::new(dir.path().to_path_buf())).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_new_creates_layout() {
        let (dir, storage) = web_storage();
        assert!(dir.path().join("Databases/Databases.db").exists());
        assert!(dir.path().join("ApplicationCache/ApplicationCache.db").exists());
        assert!(!storage.is_shut_down());
    }

    #[test]
    fn test_cache_origin_drops_default_port() {
        let origin = SecurityOrigin::new("https", "example.com", 443);
        assert_eq!(application_cache_origin(&origin).unwrap(), "https://example.com");

        let origin = SecurityOrigin::new("http", "example.com", 8080);
        assert_eq!(application_cache_origin(&origin).unwrap(), "http://example.com:8080");
    }

    #[test]
    fn test_origin_usage_reports_default_quotas() {
        let (_dir, storage) = web_storage();
        let origin = SecurityOrigin::new("https", "example.com", 443);

        let usage = storage.origin_usage(&origin).unwrap();
        assert_eq!(usage.database_usage, 0);
        assert_eq!(usage.database_quota, 5 * 1024 * 1024);
        assert_eq!(usage.application_cache_usage, 0);
        assert_eq!(usage.application_cache_quota, 5 * 1024 * 1024);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_final() {
        let (_dir, storage) = web_storage();
        storage.shutdown().unwrap();
        storage.shutdown().unwrap();

        assert!(storage.tracker().is_shut_down());
        let origin = SecurityOrigin::new("https", "example.com", 443);
        assert!(matches!(storage.origin_usage(&origin), Err(CoreError::ShutDown)));
    }
}
