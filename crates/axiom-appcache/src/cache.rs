//! One version of an application cache

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::resource::{ApplicationCacheResource, ResourceType};

/// Requests under `namespace` fall back to `fallback_url` when offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub namespace: Url,
    pub fallback_url: Url,
}

#[derive(Debug, Clone, Default)]
pub struct ApplicationCache {
    storage_id: Option<i64>,
    resources: BTreeMap<String, ApplicationCacheResource>,
    online_whitelist: Vec<Url>,
    allows_all_network_requests: bool,
    fallback_urls: Vec<FallbackEntry>,
}

/// Resources are keyed without their fragment
fn resource_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

impl ApplicationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage_id(&self) -> Option<i64> {
        self.storage_id
    }

    pub(crate) fn set_storage_id(&mut self, storage_id: Option<i64>) {
        self.storage_id = storage_id;
    }

    /// Add a resource. A second resource for the same URL merges its type
    /// into the first one.
    pub fn add_resource(&mut self, resource: ApplicationCacheResource) {
        let key = resource_key(resource.url());
        match self.resources.get_mut(&key) {
            Some(existing) => existing.add_type(resource.resource_type()),
            None => {
                self.resources.insert(key, resource);
            }
        }
    }

    pub fn resource_for_url(&self, url: &Url) -> Option<&ApplicationCacheResource> {
        self.resources.get(&resource_key(url))
    }

    pub(crate) fn resource_for_key_mut(&mut self, key: &str) -> Option<&mut ApplicationCacheResource> {
        self.resources.get_mut(key)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ApplicationCacheResource> {
        self.resources.values()
    }

    pub(crate) fn resources_mut(&mut self) -> impl Iterator<Item = (&String, &mut ApplicationCacheResource)> {
        self.resources.iter_mut()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn manifest_resource(&self) -> Option<&ApplicationCacheResource> {
        self.resources
            .values()
            .find(|resource| resource.resource_type().contains(ResourceType::MANIFEST))
    }

    pub fn online_whitelist(&self) -> &[Url] {
        &self.online_whitelist
    }

    pub fn set_online_whitelist(&mut self, whitelist: Vec<Url>) {
        self.online_whitelist = whitelist;
    }

    pub fn allows_all_network_requests(&self) -> bool {
        self.allows_all_network_requests
    }

    pub fn set_allows_all_network_requests(&mut self, allows: bool) {
        self.allows_all_network_requests = allows;
    }

    pub fn fallback_urls(&self) -> &[FallbackEntry] {
        &self.fallback_urls
    }

    /// Longer namespaces are matched first
    pub fn set_fallback_urls(&mut self, mut fallback_urls: Vec<FallbackEntry>) {
        fallback_urls.sort_by(|a, b| b.namespace.as_str().len().cmp(&a.namespace.as_str().len()));
        self.fallback_urls = fallback_urls;
    }

    pub fn fallback_url_for(&self, url: &Url) -> Option<&Url> {
        self.fallback_urls
            .iter()
            .find(|entry| url.as_str().starts_with(entry.namespace.as_str()))
            .map(|entry| &entry.fallback_url)
    }

    pub fn is_url_in_online_whitelist(&self, url: &Url) -> bool {
        self.online_whitelist
            .iter()
            .any(|prefix| url.as_str().starts_with(prefix.as_str()))
    }

    pub fn estimated_size_in_storage(&self) -> u64 {
        self.resources
            .values()
            .map(ApplicationCacheResource::estimated_size_in_storage)
            .sum()
    }
}
