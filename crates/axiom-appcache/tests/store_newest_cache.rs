use tempfile::TempDir;
use url::Url;

use axiom_appcache::{
    ApplicationCache, ApplicationCacheGroup, ApplicationCacheResource, ApplicationCacheStorage,
    CacheStorageConfig, CacheStorageError, ResourceResponse, ResourceType,
};

const MANIFEST: &str = "https://example.com/app.manifest";

fn config(dir: &TempDir) -> CacheStorageConfig {
    let mut config = CacheStorageConfig::new(dir.path().join("appcache"));
    // Keep every body inside SQLite so the page limit applies to it
    config.flat_file_threshold = 1024 * 1024;
    config
}

fn resource(path: &str, size: usize, fill: u8) -> ApplicationCacheResource {
    let url = Url::parse("https://example.com/").unwrap().join(path).unwrap();
    let response = ResourceResponse::ok(url.clone(), "application/octet-stream");
    ApplicationCacheResource::new(url, response, ResourceType::EXPLICIT, vec![fill; size])
}

fn cache_of(resources: Vec<ApplicationCacheResource>) -> ApplicationCache {
    let mut cache = ApplicationCache::new();
    for resource in resources {
        cache.add_resource(resource);
    }
    cache
}

fn catalog_size(dir: &TempDir) -> u64 {
    std::fs::metadata(dir.path().join("appcache").join("ApplicationCache.db"))
        .unwrap()
        .len()
}

fn assert_previous_cache_intact(storage: &ApplicationCacheStorage, cache_id: i64) {
    let group = storage
        .load_cache_group(&Url::parse(MANIFEST).unwrap())
        .unwrap()
        .unwrap();
    let cache = group.newest_cache().unwrap();
    assert_eq!(cache.storage_id(), Some(cache_id));
    assert_eq!(cache.resource_count(), 3);
    for name in ["v1/a", "v1/b", "v1/c"] {
        let url = Url::parse("https://example.com/").unwrap().join(name).unwrap();
        let resource = cache.resource_for_url(&url).unwrap();
        assert_eq!(resource.data(), &[b'1'; 512][..]);
    }
    for name in ["v2/1-small", "v2/2-small", "v2/3-large"] {
        let url = Url::parse("https://example.com/").unwrap().join(name).unwrap();
        assert!(cache.resource_for_url(&url).is_none());
    }
}

#[test]
fn test_failure_mid_store_keeps_previous_newest_cache() {
    let dir = TempDir::new().unwrap();
    let storage = ApplicationCacheStorage::open(config(&dir)).unwrap();

    let mut group = ApplicationCacheGroup::new(Url::parse(MANIFEST).unwrap());
    group.set_newest_cache(cache_of(vec![
        resource("v1/a", 512, b'1'),
        resource("v1/b", 512, b'1'),
        resource("v1/c", 512, b'1'),
    ]));
    storage.store_newest_cache(&mut group).unwrap();
    let group_id = group.storage_id().unwrap();
    let old_cache_id = group.newest_cache().unwrap().storage_id().unwrap();
    let usage = storage.usage_for_origin("https://example.com").unwrap();

    // Room for the two small resources, not for the third
    storage
        .set_maximum_size(catalog_size(&dir) + 32 * 1024)
        .unwrap();
    group.set_newest_cache(cache_of(vec![
        resource("v2/1-small", 1024, b'2'),
        resource("v2/2-small", 1024, b'2'),
        resource("v2/3-large", 512 * 1024, b'2'),
    ]));

    let err = storage.store_newest_cache(&mut group).unwrap_err();
    match err {
        CacheStorageError::DiskFull { space_needed } => assert!(space_needed > 0),
        other => panic!("expected a full cache, got {other}"),
    }

    // In-memory ids are back to what they were before the store
    assert_eq!(group.storage_id(), Some(group_id));
    let new_cache = group.newest_cache().unwrap();
    assert!(new_cache.storage_id().is_none());
    assert!(new_cache.resources().all(|r| r.storage_id().is_none()));

    assert_previous_cache_intact(&storage, old_cache_id);
    assert_eq!(storage.usage_for_origin("https://example.com").unwrap(), usage);

    // Same picture after a restart
    storage.close().unwrap();
    let storage = ApplicationCacheStorage::open(config(&dir)).unwrap();
    assert_previous_cache_intact(&storage, old_cache_id);
    assert_eq!(storage.manifest_urls().unwrap().len(), 1);

    // With room to spare the same cache goes through
    storage.set_maximum_size(u64::MAX).unwrap();
    storage.store_newest_cache(&mut group).unwrap();
    let stored = storage
        .load_cache_group(&Url::parse(MANIFEST).unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stored.storage_id(), Some(group_id));
    assert_ne!(stored.newest_cache().unwrap().storage_id(), Some(old_cache_id));
    assert_eq!(stored.newest_cache().unwrap().resource_count(), 3);
}

#[test]
fn test_failed_first_store_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let storage = ApplicationCacheStorage::open(config(&dir)).unwrap();
    storage
        .set_maximum_size(catalog_size(&dir) + 16 * 1024)
        .unwrap();

    let mut group = ApplicationCacheGroup::new(Url::parse(MANIFEST).unwrap());
    group.set_newest_cache(cache_of(vec![
        resource("a", 256, b'a'),
        resource("b", 512 * 1024, b'b'),
    ]));

    let err = storage.store_newest_cache(&mut group).unwrap_err();
    assert!(err.is_disk_full());
    assert!(group.storage_id().is_none());
    assert!(storage.manifest_urls().unwrap().is_empty());
    assert!(storage.origins_with_cache().unwrap().is_empty());
}
