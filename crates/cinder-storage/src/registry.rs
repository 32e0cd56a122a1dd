//! Storage contract: types, metadata, and the registry.
//!
//! Per-record operations stay monomorphic: callers hold a concrete
//! `Arc<ArrayStorage>` or `Arc<SequentialStorage>` and the registry
//! dispatches on the [`StorageType`] tag where a uniform entry point is
//! needed (the snapshot pipeline, partitioning). No trait objects sit on
//! record paths.

use crate::array::ArrayStorage;
use crate::sequential::SequentialStorage;
use cinder_core::error::{ErrorCode, ErrorStack, StackResult};
use cinder_core::traits::SnapshotPageSource;
use cinder_core::{PagePools, StorageId};
use cinder_xct::{MovedRecordResolver, RecordAddress};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Storage families shipped with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    /// Fixed universe of fixed-size records.
    Array,
    /// Append-only record log.
    Sequential,
}

/// Descriptive metadata; persisted in snapshot manifests so a restarted
/// engine can rebuild its storages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Dense nonzero id.
    pub id: StorageId,
    /// Unique name.
    pub name: String,
    /// Family tag.
    pub storage_type: StorageType,
    /// Payload bytes per record (array only; 0 otherwise).
    pub payload_size: u16,
    /// Record universe size (array only; 0 otherwise).
    pub record_count: u64,
}

/// A registered storage.
#[derive(Debug, Clone)]
pub enum StorageRef {
    /// An array storage.
    Array(Arc<ArrayStorage>),
    /// A sequential storage.
    Sequential(Arc<SequentialStorage>),
}

impl StorageRef {
    /// The family tag.
    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageRef::Array(_) => StorageType::Array,
            StorageRef::Sequential(_) => StorageType::Sequential,
        }
    }

    /// Metadata snapshot for manifests.
    pub fn metadata(&self) -> StorageMetadata {
        match self {
            StorageRef::Array(a) => StorageMetadata {
                id: a.id(),
                name: a.name().to_string(),
                storage_type: StorageType::Array,
                payload_size: a.payload_size(),
                record_count: a.record_count(),
            },
            StorageRef::Sequential(s) => StorageMetadata {
                id: s.id(),
                name: s.name().to_string(),
                storage_type: StorageType::Sequential,
                payload_size: 0,
                record_count: 0,
            },
        }
    }
}

/// All storages of one engine, by id and by name.
pub struct StorageRegistry {
    by_id: DashMap<StorageId, StorageRef>,
    by_name: DashMap<String, StorageId>,
    next_id: AtomicU32,
    pools: PagePools,
    snapshot_source: Arc<dyn SnapshotPageSource>,
}

impl StorageRegistry {
    /// Empty registry.
    pub fn new(pools: PagePools, snapshot_source: Arc<dyn SnapshotPageSource>) -> StorageRegistry {
        StorageRegistry {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            next_id: AtomicU32::new(1),
            pools,
            snapshot_source,
        }
    }

    /// Number of NUMA nodes; one snapshot partition per node.
    pub fn node_count(&self) -> usize {
        self.pools.node_count()
    }

    fn claim_name(&self, name: &str, id: StorageId) -> StackResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.by_name.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ErrorStack::new(
                ErrorCode::DuplicateStorageName,
                format!("storage '{}' already exists", name),
            )),
            Entry::Vacant(v) => {
                v.insert(id);
                Ok(())
            }
        }
    }

    /// Create an array storage.
    pub fn create_array(
        &self,
        name: &str,
        payload_size: u16,
        record_count: u64,
    ) -> StackResult<Arc<ArrayStorage>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.claim_name(name, id)?;
        match ArrayStorage::create(
            id,
            name,
            payload_size,
            record_count,
            self.pools.clone(),
            Arc::clone(&self.snapshot_source),
        ) {
            Ok(storage) => {
                self.by_id.insert(id, StorageRef::Array(Arc::clone(&storage)));
                Ok(storage)
            }
            Err(e) => {
                self.by_name.remove(name);
                Err(e)
            }
        }
    }

    /// Create a sequential storage.
    pub fn create_sequential(&self, name: &str) -> StackResult<Arc<SequentialStorage>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.claim_name(name, id)?;
        let storage = SequentialStorage::create(
            id,
            name,
            self.pools.clone(),
            Arc::clone(&self.snapshot_source),
        )?;
        self.by_id
            .insert(id, StorageRef::Sequential(Arc::clone(&storage)));
        Ok(storage)
    }

    /// Rebuild one storage from manifest metadata and its snapshot root.
    pub fn load_storage(
        &self,
        metadata: &StorageMetadata,
        root_snapshot: cinder_core::SnapshotPagePointer,
        valid_until: cinder_core::Epoch,
    ) -> StackResult<StorageRef> {
        self.claim_name(&metadata.name, metadata.id)?;
        let storage = match metadata.storage_type {
            StorageType::Array => StorageRef::Array(ArrayStorage::load(
                metadata.id,
                &metadata.name,
                metadata.payload_size,
                metadata.record_count,
                root_snapshot,
                self.pools.clone(),
                Arc::clone(&self.snapshot_source),
            )?),
            StorageType::Sequential => StorageRef::Sequential(SequentialStorage::load(
                metadata.id,
                &metadata.name,
                root_snapshot,
                valid_until,
                self.pools.clone(),
                Arc::clone(&self.snapshot_source),
            )?),
        };
        self.by_id.insert(metadata.id, storage.clone());
        // Ids from manifests must stay unique against future creates.
        self.next_id.fetch_max(metadata.id + 1, Ordering::SeqCst);
        Ok(storage)
    }

    /// Look up by id.
    pub fn get(&self, id: StorageId) -> Option<StorageRef> {
        self.by_id.get(&id).map(|entry| entry.clone())
    }

    /// Look up by name.
    pub fn get_by_name(&self, name: &str) -> Option<StorageRef> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    /// The array storage behind `name`, or a structural error.
    pub fn array(&self, name: &str) -> StackResult<Arc<ArrayStorage>> {
        match self.get_by_name(name) {
            Some(StorageRef::Array(a)) => Ok(a),
            _ => Err(ErrorStack::new(
                ErrorCode::StorageNotFound,
                format!("no array storage named '{}'", name),
            )),
        }
    }

    /// The sequential storage behind `name`, or a structural error.
    pub fn sequential(&self, name: &str) -> StackResult<Arc<SequentialStorage>> {
        match self.get_by_name(name) {
            Some(StorageRef::Sequential(s)) => Ok(s),
            _ => Err(ErrorStack::new(
                ErrorCode::StorageNotFound,
                format!("no sequential storage named '{}'", name),
            )),
        }
    }

    /// Every registered storage, id-ordered (snapshot cycles want a
    /// deterministic walk).
    pub fn all(&self) -> Vec<StorageRef> {
        let mut storages: Vec<(StorageId, StorageRef)> = self
            .by_id
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        storages.sort_by_key(|(id, _)| *id);
        storages.into_iter().map(|(_, s)| s).collect()
    }

    /// The partition (NUMA node) a redo record belongs to, by storage
    /// family: array records partition by leaf, sequential records stay on
    /// the appending thread's node (encoded by the mapper).
    pub fn partition_of_array_record(&self, storage: &ArrayStorage, record: u64) -> u8 {
        let leaf = record / storage.records_per_leaf();
        (leaf % self.node_count() as u64) as u8
    }
}

impl MovedRecordResolver for StorageRegistry {
    fn track_moved(
        &self,
        _storage_id: StorageId,
        owner: RecordAddress,
    ) -> Option<RecordAddress> {
        // Array and sequential records never migrate, so a set moved bit
        // can only mean the address is still current.
        Some(owner)
    }
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("storages", &self.by_id.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::error::CodeResult;
    use cinder_core::page::Page;

    struct NoSnapshots;
    impl SnapshotPageSource for NoSnapshots {
        fn read_page(
            &self,
            _pointer: cinder_core::SnapshotPagePointer,
        ) -> CodeResult<Arc<Page>> {
            Err(ErrorCode::SnapshotIo)
        }
    }

    fn test_registry() -> StorageRegistry {
        StorageRegistry::new(PagePools::new(1, 256), Arc::new(NoSnapshots))
    }

    #[test]
    fn create_and_lookup_by_both_keys() {
        let registry = test_registry();
        let array = registry.create_array("branches", 16, 8).unwrap();
        let seq = registry.create_sequential("journal").unwrap();
        assert_ne!(array.id(), seq.id());

        assert!(matches!(
            registry.get(array.id()),
            Some(StorageRef::Array(_))
        ));
        assert!(registry.array("branches").is_ok());
        assert!(registry.sequential("journal").is_ok());
        assert_eq!(
            registry.array("journal").unwrap_err().code,
            ErrorCode::StorageNotFound
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = test_registry();
        registry.create_array("dup", 16, 8).unwrap();
        let err = registry.create_array("dup", 16, 8).unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateStorageName);
    }

    #[test]
    fn metadata_describes_the_storage() {
        let registry = test_registry();
        let array = registry.create_array("accounts", 24, 32).unwrap();
        let meta = registry.get(array.id()).unwrap().metadata();
        assert_eq!(meta.name, "accounts");
        assert_eq!(meta.storage_type, StorageType::Array);
        assert_eq!(meta.payload_size, 24);
        assert_eq!(meta.record_count, 32);
    }
}
