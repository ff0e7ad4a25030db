use std::sync::Arc;

use conduit_core::{SourceDescriptor, SourceId};
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{error, warn};

use crate::error::StoreError;
use crate::store::SourceStore;

/// In-memory table of source descriptors with write-through persistence.
///
/// The table is authoritative while the process runs. Every mutation is
/// written to the store under the entry lock so writes for one source reach
/// the store in the order they were applied.
pub struct SourceTable {
    sources: DashMap<SourceId, SourceDescriptor>,
    store: Arc<dyn SourceStore>,
}

impl SourceTable {
    /// Load every persisted descriptor from `store`.
    pub fn load(store: Arc<dyn SourceStore>) -> Result<Self, StoreError> {
        let sources = DashMap::new();
        for d in store.list()? {
            sources.insert(d.id.clone(), d);
        }
        Ok(Self { sources, store })
    }

    pub fn get(&self, id: &SourceId) -> Option<SourceDescriptor> {
        self.sources.get(id).map(|d| d.clone())
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        self.sources.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<_> = self.sources.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<SourceDescriptor> {
        self.sources.iter().map(|e| e.value().clone()).collect()
    }

    /// Insert or replace a descriptor. The store write must succeed.
    pub fn insert(&self, descriptor: SourceDescriptor) -> Result<(), StoreError> {
        match self.sources.entry(descriptor.id.clone()) {
            Entry::Occupied(mut slot) => {
                self.store.save(&descriptor)?;
                slot.insert(descriptor);
            }
            Entry::Vacant(slot) => {
                self.store.save(&descriptor)?;
                slot.insert(descriptor);
            }
        }
        Ok(())
    }

    /// Apply `f` to the descriptor for `id` and persist the result.
    ///
    /// The in-memory change always sticks; a failed store write is logged and
    /// retried implicitly by the next mutation of the same source.
    pub fn update<F>(&self, id: &SourceId, f: F) -> Option<SourceDescriptor>
    where
        F: FnOnce(&mut SourceDescriptor),
    {
        let mut entry = self.sources.get_mut(id)?;
        f(entry.value_mut());
        if let Err(e) = self.store.save(entry.value()) {
            error!(source_id = %id, error = %e, "failed to persist source update");
        }
        Some(entry.value().clone())
    }

    /// Remove a descriptor from the table and the store.
    pub fn remove(&self, id: &SourceId) -> Result<Option<SourceDescriptor>, StoreError> {
        let removed = self.sources.remove(id).map(|(_, d)| d);
        if removed.is_some() && !self.store.delete(id)? {
            warn!(source_id = %id, "source was not present in the store");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySourceStore;
    use conduit_core::{SourceKind, SourceStatus};

    struct FailingStore;

    impl SourceStore for FailingStore {
        fn load(&self, _id: &SourceId) -> Result<Option<SourceDescriptor>, StoreError> {
            Ok(None)
        }
        fn save(&self, d: &SourceDescriptor) -> Result<(), StoreError> {
            Err(StoreError::Corrupt {
                id: d.id.to_string(),
                reason: "disk full".into(),
            })
        }
        fn list(&self) -> Result<Vec<SourceDescriptor>, StoreError> {
            Ok(vec![])
        }
        fn delete(&self, _id: &SourceId) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    fn descriptor(id: &str) -> SourceDescriptor {
        SourceDescriptor::new(id, SourceKind::Payments, "*/5 * * * *", "")
    }

    #[test]
    fn update_writes_through() {
        let store = Arc::new(MemorySourceStore::new());
        let table = SourceTable::load(store.clone()).unwrap();
        table.insert(descriptor("pay-1")).unwrap();

        let updated = table
            .update(&SourceId::from("pay-1"), |d| d.status = SourceStatus::Syncing)
            .unwrap();
        assert_eq!(updated.status, SourceStatus::Syncing);
        let persisted = store.load(&SourceId::from("pay-1")).unwrap().unwrap();
        assert_eq!(persisted.status, SourceStatus::Syncing);
    }

    #[test]
    fn update_of_unknown_source_is_none() {
        let table = SourceTable::load(Arc::new(MemorySourceStore::new())).unwrap();
        assert!(table.update(&SourceId::from("nope"), |_| {}).is_none());
    }

    #[test]
    fn failed_insert_does_not_create_the_source() {
        let table = SourceTable::load(Arc::new(FailingStore)).unwrap();
        assert!(table.insert(descriptor("pay-1")).is_err());
        assert!(table.get(&SourceId::from("pay-1")).is_none());
        assert!(table.is_empty());
    }
}
