//! Application cache groups

use sha2::{Digest, Sha256};
use url::Url;

use crate::cache::ApplicationCache;

/// All versions of the cache described by one manifest. Only the newest
/// cache is kept in memory; older ones live on in storage until removed.
#[derive(Debug, Clone)]
pub struct ApplicationCacheGroup {
    manifest_url: Url,
    storage_id: Option<i64>,
    newest_cache: Option<ApplicationCache>,
    obsolete: bool,
}

impl ApplicationCacheGroup {
    pub fn new(manifest_url: Url) -> Self {
        Self {
            manifest_url,
            storage_id: None,
            newest_cache: None,
            obsolete: false,
        }
    }

    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    /// Serialized origin of the manifest, e.g. `https://example.com`
    pub fn origin(&self) -> String {
        self.manifest_url.origin().ascii_serialization()
    }

    /// Host hash stored next to the manifest URL for cheap lookups
    pub fn manifest_host_hash(&self) -> i64 {
        host_hash(self.manifest_url.host_str().unwrap_or_default())
    }

    pub fn storage_id(&self) -> Option<i64> {
        self.storage_id
    }

    pub(crate) fn set_storage_id(&mut self, storage_id: Option<i64>) {
        self.storage_id = storage_id;
    }

    pub fn newest_cache(&self) -> Option<&ApplicationCache> {
        self.newest_cache.as_ref()
    }

    pub(crate) fn newest_cache_mut(&mut self) -> Option<&mut ApplicationCache> {
        self.newest_cache.as_mut()
    }

    pub fn set_newest_cache(&mut self, cache: ApplicationCache) {
        self.newest_cache = Some(cache);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    pub(crate) fn mark_obsolete(&mut self) {
        self.obsolete = true;
        self.storage_id = None;
    }
}

pub(crate) fn host_hash(host: &str) -> i64 {
    let digest = Sha256::digest(host.to_ascii_lowercase().as_bytes());
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest[..4]);
    u32::from_be_bytes(bytes) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_and_host_hash() {
        let group = ApplicationCacheGroup::new(Url::parse("https://Example.com/app.manifest").unwrap());
        assert_eq!(group.origin(), "https://example.com");
        assert_eq!(group.manifest_host_hash(), host_hash("example.com"));
        assert!(group.manifest_host_hash() >= 0);
        assert!(group.newest_cache().is_none());
    }
}
