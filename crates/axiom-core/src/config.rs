//! Web storage configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use axiom_appcache::{CacheStorageConfig, DEFAULT_FLAT_FILE_THRESHOLD};
use axiom_webdb::{TrackerConfig, DEFAULT_ORIGIN_QUOTA};

use crate::error::CoreError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the web database layout (`Databases.db` and origin directories)
    pub database_directory: PathBuf,
    /// Holds `ApplicationCache.db` and the flat file directory
    pub application_cache_directory: PathBuf,
    /// Quota of an origin's web databases until the host raises it
    pub default_origin_quota: u64,
    /// Combined size of every origin's web databases; `None` leaves only
    /// origin quotas
    pub database_total_quota: Option<u64>,
    /// Total size of the application cache; `None` leaves it unbounded
    pub application_cache_max_size: Option<u64>,
    pub application_cache_default_origin_quota: u64,
    /// Resource bodies above this many bytes are kept as flat files
    pub flat_file_threshold: u64,
    /// How long deleting a database waits for its handles to close
    pub close_timeout_ms: u64,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_directory: data_dir.join("Databases"),
            application_cache_directory: data_dir.join("ApplicationCache"),
            default_origin_quota: DEFAULT_ORIGIN_QUOTA,
            database_total_quota: None,
            application_cache_max_size: None,
            application_cache_default_origin_quota: DEFAULT_ORIGIN_QUOTA,
            flat_file_threshold: DEFAULT_FLAT_FILE_THRESHOLD,
            close_timeout_ms: 5_000,
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("AXIOM"))
            .unwrap_or_else(|| PathBuf::from(".axiom"))
    }

    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_directory == self.application_cache_directory {
            return Err(CoreError::Config(
                "database and application cache directories must differ".to_string(),
            ));
        }
        if self
            .database_total_quota
            .is_some_and(|total| total < self.default_origin_quota)
        {
            return Err(CoreError::Config(
                "database_total_quota must not be below default_origin_quota".to_string(),
            ));
        }
        if self.close_timeout_ms == 0 {
            return Err(CoreError::Config(
                "close_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            database_directory: self.database_directory.clone(),
            default_origin_quota: self.default_origin_quota,
            total_quota: self.database_total_quota,
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }

    pub fn cache_storage_config(&self) -> CacheStorageConfig {
        CacheStorageConfig {
            cache_directory: self.application_cache_directory.clone(),
            maximum_size: self.application_cache_max_size.unwrap_or(u64::MAX),
            default_origin_quota: self.application_cache_default_origin_quota,
            flat_file_threshold: self.flat_file_threshold,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

// Simple dirs implementation for common directories
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
