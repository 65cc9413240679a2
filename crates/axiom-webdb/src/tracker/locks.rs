//! Ordered tracker locks
//!
//! The registry lock comes first, the quota lock second. The quota map is
//! reachable from a registry guard, or on its own through
//! `TrackerLocks::quotas`; a thread holding the standalone quota guard may
//! not go back for the registry (checked in debug builds).

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Weak;

use axiom_storage::SqliteDatabase;

use crate::backend::DatabaseBackend;
use crate::origin::SecurityOrigin;

pub(crate) type DatabaseKey = (SecurityOrigin, String);

thread_local! {
    static STANDALONE_QUOTA_GUARDS: Cell<usize> = const { Cell::new(0) };
}

/// Catalog connection plus the bookkeeping that must change together with it
pub(crate) struct Registry {
    pub catalog: SqliteDatabase,
    pub open_databases: HashMap<DatabaseKey, Vec<Weak<DatabaseBackend>>>,
    pub being_created: HashMap<DatabaseKey, usize>,
    pub being_deleted: HashSet<DatabaseKey>,
    pub origins_being_deleted: HashSet<SecurityOrigin>,
}

impl Registry {
    pub fn new(catalog: SqliteDatabase) -> Self {
        Self {
            catalog,
            open_databases: HashMap::new(),
            being_created: HashMap::new(),
            being_deleted: HashSet::new(),
            origins_being_deleted: HashSet::new(),
        }
    }

    pub fn is_being_deleted(&self, key: &DatabaseKey) -> bool {
        self.being_deleted.contains(key) || self.origins_being_deleted.contains(&key.0)
    }

    pub fn is_being_created(&self, key: &DatabaseKey) -> bool {
        self.being_created.get(key).copied().unwrap_or(0) > 0
    }
}

/// Quotas and committed usage, in bytes
#[derive(Default)]
pub(crate) struct QuotaMap {
    pub default_quota: u64,
    /// Cap on the combined usage of every origin
    pub total_quota: Option<u64>,
    pub quotas: HashMap<SecurityOrigin, u64>,
    pub usage: HashMap<DatabaseKey, u64>,
}

impl QuotaMap {
    pub fn quota_for(&self, origin: &SecurityOrigin) -> u64 {
        self.quotas
            .get(origin)
            .copied()
            .unwrap_or(self.default_quota)
    }

    pub fn usage_for_origin(&self, origin: &SecurityOrigin) -> u64 {
        self.usage
            .iter()
            .filter(|((o, _), _)| o == origin)
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    pub fn usage_for_database(&self, key: &DatabaseKey) -> u64 {
        self.usage.get(key).copied().unwrap_or(0)
    }

    pub fn total_usage(&self) -> u64 {
        self.usage.values().sum()
    }

    /// Room the origin quota leaves for the database
    fn origin_limit(&self, key: &DatabaseKey) -> u64 {
        let own = self.usage_for_database(key);
        let others = self.usage_for_origin(&key.0).saturating_sub(own);
        self.quota_for(&key.0).saturating_sub(others)
    }

    /// Room the total quota leaves for the database
    fn total_limit(&self, key: &DatabaseKey) -> Option<u64> {
        let everyone_else = self.total_usage().saturating_sub(self.usage_for_database(key));
        self.total_quota
            .map(|total| total.saturating_sub(everyone_else))
    }

    /// Largest size the database may grow to, never less than its own usage
    pub fn max_size_for(&self, key: &DatabaseKey) -> u64 {
        let limit = self.origin_limit(key);
        let limit = self.total_limit(key).map_or(limit, |total| limit.min(total));
        limit.max(self.usage_for_database(key))
    }

    /// The total quota is tighter than the origin's own
    pub fn total_quota_binds(&self, key: &DatabaseKey) -> bool {
        self.total_limit(key)
            .is_some_and(|total| total < self.origin_limit(key))
    }
}

pub(crate) struct TrackerLocks {
    registry: Mutex<Registry>,
    quotas: Mutex<QuotaMap>,
}

impl TrackerLocks {
    pub fn new(registry: Registry, quotas: QuotaMap) -> Self {
        Self {
            registry: Mutex::new(registry),
            quotas: Mutex::new(quotas),
        }
    }

    pub fn registry(&self) -> RegistryGuard<'_> {
        debug_assert_eq!(
            STANDALONE_QUOTA_GUARDS.with(Cell::get),
            0,
            "registry lock requested while holding the quota lock"
        );
        RegistryGuard {
            registry: self.registry.lock(),
            quotas: &self.quotas,
        }
    }

    pub fn quotas(&self) -> QuotaGuard<'_> {
        let guard = self.quotas.lock();
        STANDALONE_QUOTA_GUARDS.with(|count| count.set(count.get() + 1));
        QuotaGuard {
            guard,
            standalone: true,
        }
    }
}

pub(crate) struct RegistryGuard<'a> {
    registry: MutexGuard<'a, Registry>,
    quotas: &'a Mutex<QuotaMap>,
}

impl RegistryGuard<'_> {
    /// Second-level lock, taken in the one allowed order
    pub fn quotas(&self) -> QuotaGuard<'_> {
        QuotaGuard {
            guard: self.quotas.lock(),
            standalone: false,
        }
    }
}

impl Deref for RegistryGuard<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.registry
    }
}

impl DerefMut for RegistryGuard<'_> {
    fn deref_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

pub(crate) struct QuotaGuard<'a> {
    guard: MutexGuard<'a, QuotaMap>,
    standalone: bool,
}

impl Deref for QuotaGuard<'_> {
    type Target = QuotaMap;

    fn deref(&self) -> &QuotaMap {
        &self.guard
    }
}

impl DerefMut for QuotaGuard<'_> {
    fn deref_mut(&mut self) -> &mut QuotaMap {
        &mut self.guard
    }
}

impl Drop for QuotaGuard<'_> {
    fn drop(&mut self) {
        if self.standalone {
            STANDALONE_QUOTA_GUARDS.with(|count| count.set(count.get().saturating_sub(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locks() -> TrackerLocks {
        let catalog = SqliteDatabase::open_in_memory().unwrap();
        let quotas = QuotaMap {
            default_quota: 100,
            ..QuotaMap::default()
        };
        TrackerLocks::new(Registry::new(catalog), quotas)
    }

    #[test]
    fn test_quota_reachable_from_registry() {
        let locks = locks();
        let origin = SecurityOrigin::new("https", "a.test", 443);

        let registry = locks.registry();
        let mut quotas = registry.quotas();
        quotas.quotas.insert(origin.clone(), 500);
        quotas.usage.insert((origin.clone(), "db".into()), 40);
        drop(quotas);
        drop(registry);

        let quotas = locks.quotas();
        assert_eq!(quotas.quota_for(&origin), 500);
        assert_eq!(quotas.usage_for_origin(&origin), 40);
        assert_eq!(
            quotas.quota_for(&SecurityOrigin::new("https", "b.test", 443)),
            100
        );
    }

    #[test]
    fn test_registry_after_standalone_quota_released() {
        let locks = locks();
        {
            let _quotas = locks.quotas();
        }
        // Fine once the standalone guard is gone
        let registry = locks.registry();
        assert!(registry.open_databases.is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "registry lock requested while holding the quota lock")]
    fn test_out_of_order_acquisition_is_caught() {
        let locks = locks();
        let _quotas = locks.quotas();
        let _registry = locks.registry();
    }
}
