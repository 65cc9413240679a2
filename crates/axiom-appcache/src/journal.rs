//! Storage id journal
//!
//! Storing a cache hands out fresh row ids to the group, the cache and each
//! resource. Every assignment is recorded here first, together with the id
//! the entity had before. If the SQLite transaction does not commit, the
//! journal is replayed newest first so each entity ends up with the id it
//! had when the store began.

#[derive(Debug)]
pub struct StorageIdJournal<K> {
    records: Vec<(K, Option<i64>)>,
}

impl<K> StorageIdJournal<K> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Note that `entity` is about to get a new id; `previous` is the one it has now
    pub fn record(&mut self, entity: K, previous: Option<i64>) {
        self.records.push((entity, previous));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The new ids are durable; forget how to undo them
    pub fn commit(&mut self) {
        self.records.clear();
    }

    /// Hand every recorded entity its previous id back, newest record first
    pub fn revert<F>(&mut self, mut restore: F)
    where
        F: FnMut(&K, Option<i64>),
    {
        while let Some((entity, previous)) = self.records.pop() {
            restore(&entity, previous);
        }
    }
}

impl<K> Default for StorageIdJournal<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_revert_restores_every_prior_id() {
        let mut ids: HashMap<&str, Option<i64>> =
            HashMap::from([("group", Some(3)), ("cache", None), ("a", None)]);
        let mut journal = StorageIdJournal::new();

        for (entity, new_id) in [("cache", 10), ("a", 11), ("a", 12), ("group", 13)] {
            journal.record(entity, ids[entity]);
            ids.insert(entity, Some(new_id));
        }
        assert_eq!(journal.len(), 4);

        journal.revert(|entity, previous| {
            ids.insert(*entity, previous);
        });

        assert!(journal.is_empty());
        assert_eq!(ids["group"], Some(3));
        assert_eq!(ids["cache"], None);
        assert_eq!(ids["a"], None);
    }

    #[test]
    fn test_commit_makes_revert_a_no_op() {
        let mut journal = StorageIdJournal::new();
        journal.record("cache", None);
        journal.commit();

        let mut calls = 0;
        journal.revert(|_, _| calls += 1);
        assert_eq!(calls, 0);
    }
}
