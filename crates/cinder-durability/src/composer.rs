//! Composers: storage-specific construction of new snapshot pages.
//!
//! A composer consumes one partition's sorted redo tuples plus the
//! previous snapshot and emits new snapshot pages through a
//! [`SnapshotWriter`]. `compose` returns a root-info describing the
//! subtree it built; once every partition has composed,
//! `construct_root` merges the root-infos into the storage's new root
//! page. Dispatch is a `match` on the storage family, with no virtual calls.
//!
//! The contract is semantic-store preservation: for every (storage, key),
//! the post-snapshot state equals the pre-snapshot state with the sorted
//! redo sequence applied in transaction-id order.
//!
//! `drop_volatiles` runs inside the install pause: it walks the volatile
//! tree and returns every page whose newest record is at or before the
//! snapshot frontier, batching frees through [`PagePoolOffsetChunk`]s.

use crate::mapper::RedoTuple;
use crate::snapshot_file::SnapshotWriter;
use cinder_core::epoch::Epoch;
use cinder_core::error::{ErrorCode, ErrorStack, StackResult};
use cinder_core::log::{ArrayOverwriteRedo, RedoKind};
use cinder_core::memory::{PagePoolOffsetChunk, PagePools};
use cinder_core::page::{Page, SnapshotPagePointer, VolatilePagePointer};
use cinder_core::traits::SnapshotPageSource;
use cinder_storage::{ArrayStorage, SequentialStorage, StorageRef};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What one partition's compose produced.
#[derive(Debug, Clone)]
pub enum RootInfo {
    /// New leaf pages, `(leaf index, pointer)`.
    ArrayLeaves(Vec<(u64, SnapshotPagePointer)>),
    /// Head of the partition's new record chain, if any records arrived.
    SequentialHead(Option<SnapshotPagePointer>),
}

/// Outcome of a volatile-drop walk.
#[derive(Debug, Clone, Copy)]
pub struct DropResult {
    /// Largest epoch observed in kept pages (at most the frontier when
    /// everything was dropped).
    pub max_observed: Epoch,
    /// Whether every volatile page below the root went back to the pool.
    pub dropped_all: bool,
    /// Pages returned to the pool.
    pub dropped_count: u64,
}

impl DropResult {
    fn all_dropped() -> DropResult {
        DropResult {
            max_observed: Epoch::INVALID,
            dropped_all: true,
            dropped_count: 0,
        }
    }
}

/// Batched page frees across nodes.
pub struct DropChunks {
    pools: PagePools,
    chunks: Vec<PagePoolOffsetChunk>,
}

impl DropChunks {
    /// One chunk per node.
    pub fn new(pools: PagePools) -> DropChunks {
        let chunks = (0..pools.node_count())
            .map(|node| PagePoolOffsetChunk::new(node as u8))
            .collect();
        DropChunks { pools, chunks }
    }

    /// Queue one page; flushes its node's chunk when full.
    pub fn drop_page(&mut self, pointer: VolatilePagePointer) {
        let node = pointer.node() as usize;
        if self.chunks[node].push(pointer.offset()) {
            self.pools.pool(pointer.node()).release_chunk(&mut self.chunks[node]);
        }
    }

    /// Return everything still queued.
    pub fn flush(&mut self) {
        for chunk in &mut self.chunks {
            if !chunk.is_empty() {
                self.pools.pool(chunk.node()).release_chunk(chunk);
            }
        }
    }
}

/// Compose one partition of one storage.
pub fn compose(
    storage: &StorageRef,
    partition: u8,
    node_count: usize,
    tuples: &[RedoTuple],
    writer: &mut SnapshotWriter,
    source: &Arc<dyn SnapshotPageSource>,
) -> StackResult<RootInfo> {
    match storage {
        StorageRef::Array(array) => {
            compose_array(array, partition, node_count, tuples, writer, source)
        }
        StorageRef::Sequential(seq) => compose_sequential(seq, tuples, writer),
    }
}

fn compose_array(
    array: &Arc<ArrayStorage>,
    partition: u8,
    node_count: usize,
    tuples: &[RedoTuple],
    writer: &mut SnapshotWriter,
    source: &Arc<dyn SnapshotPageSource>,
) -> StackResult<RootInfo> {
    // Previous snapshot leaves, if a snapshot exists.
    let previous_root = array.root_pointer().snapshot_pointer();
    let previous_root_page = if previous_root.is_null() {
        None
    } else {
        Some(source.read_page(previous_root).map_err(|code| {
            ErrorStack::new(code, format!("reading previous root of '{}'", array.name()))
        })?)
    };

    // Group this partition's tuples by leaf. The mapper already routed
    // only this partition's leaves here.
    let mut by_leaf: HashMap<u64, Vec<&RedoTuple>> = HashMap::new();
    for tuple in tuples {
        debug_assert_eq!(tuple.kind, RedoKind::ArrayOverwrite);
        by_leaf
            .entry(tuple.key / array.records_per_leaf())
            .or_default()
            .push(tuple);
    }

    let buffer = Page::new();
    let mut leaves = Vec::new();
    for leaf in (0..array.leaf_count()).filter(|l| (l % node_count as u64) == partition as u64) {
        buffer.init(array.id(), leaf);
        if let Some(previous_root_page) = &previous_root_page {
            let previous_leaf = array
                .leaf_pointer(previous_root_page, leaf)
                .snapshot_pointer();
            if !previous_leaf.is_null() {
                let old = source.read_page(previous_leaf).map_err(|code| {
                    ErrorStack::new(
                        code,
                        format!("reading previous leaf {} of '{}'", leaf, array.name()),
                    )
                })?;
                // Safety: `buffer` is exclusively ours; `old` is immutable.
                unsafe {
                    buffer.data_mut().copy_from_slice(old.data());
                }
            }
        }
        if let Some(leaf_tuples) = by_leaf.get(&leaf) {
            for tuple in leaf_tuples {
                let redo = ArrayOverwriteRedo::decode(&tuple.payload).ok_or_else(|| {
                    ErrorStack::new(ErrorCode::Corrupt, "malformed array redo in sorted run")
                })?;
                let sub = tuple.key % array.records_per_leaf();
                let (owner, payload) = array.slot(&buffer, sub);
                owner.store_id(tuple.xct_id);
                // Safety: exclusive buffer; the storage validated the
                // range when the record was built.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        redo.bytes.as_ptr(),
                        payload.add(redo.payload_offset as usize),
                        redo.bytes.len(),
                    );
                }
            }
        }
        let pointer = writer.write_page(&buffer)?;
        leaves.push((leaf, pointer));
    }
    debug!(
        storage = array.id(),
        partition,
        leaves = leaves.len(),
        tuples = tuples.len(),
        "array partition composed"
    );
    Ok(RootInfo::ArrayLeaves(leaves))
}

fn compose_sequential(
    seq: &Arc<SequentialStorage>,
    tuples: &[RedoTuple],
    writer: &mut SnapshotWriter,
) -> StackResult<RootInfo> {
    if tuples.is_empty() {
        return Ok(RootInfo::SequentialHead(None));
    }
    // Build the chain in memory first: pages are written tail-first so
    // each page's next pointer is known before the page goes out.
    let mut pages: Vec<Box<Page>> = Vec::new();
    for tuple in tuples {
        debug_assert_eq!(tuple.kind, RedoKind::SequentialAppend);
        let appended = pages
            .last()
            .map(|page| SequentialStorage::compose_append(page, tuple.xct_id, &tuple.payload))
            .unwrap_or(false);
        if !appended {
            let page = Box::new(Page::new());
            SequentialStorage::init_compose_page(&page, seq.id(), pages.len() as u64);
            if !SequentialStorage::compose_append(&page, tuple.xct_id, &tuple.payload) {
                return Err(ErrorStack::new(
                    ErrorCode::Corrupt,
                    "sequential record larger than a page in sorted run",
                ));
            }
            pages.push(page);
        }
    }
    let mut next = SnapshotPagePointer::NULL;
    for page in pages.iter().rev() {
        if !next.is_null() {
            SequentialStorage::next_pointer(page).store_snapshot(next);
        }
        next = writer.write_page(page)?;
    }
    Ok(RootInfo::SequentialHead(Some(next)))
}

/// Merge every partition's root-info into the storage's new root page.
pub fn construct_root(
    storage: &StorageRef,
    root_infos: &[RootInfo],
    writer: &mut SnapshotWriter,
    source: &Arc<dyn SnapshotPageSource>,
) -> StackResult<SnapshotPagePointer> {
    match storage {
        StorageRef::Array(array) => {
            let root_page = Page::new();
            root_page.init(array.id(), cinder_storage::ROOT_PAGE_ID);
            let mut covered = 0u64;
            for info in root_infos {
                let RootInfo::ArrayLeaves(leaves) = info else {
                    return Err(ErrorStack::new(
                        ErrorCode::SnapshotCycleFailed,
                        "mixed root-info kinds for one storage",
                    ));
                };
                for (leaf, pointer) in leaves {
                    array.leaf_pointer(&root_page, *leaf).store_snapshot(*pointer);
                    covered += 1;
                }
            }
            if covered != array.leaf_count() {
                return Err(ErrorStack::new(
                    ErrorCode::SnapshotCycleFailed,
                    format!(
                        "array '{}' root covers {} of {} leaves",
                        array.name(),
                        covered,
                        array.leaf_count()
                    ),
                ));
            }
            writer.write_page(&root_page)
        }
        StorageRef::Sequential(seq) => {
            // Old chains are carried by reference into the new root; their
            // pages stay in the older snapshot files.
            let mut heads: Vec<SnapshotPagePointer> = Vec::new();
            let old_root = seq.root_pointer().snapshot_pointer();
            if !old_root.is_null() {
                let old_page = source.read_page(old_root).map_err(|code| {
                    ErrorStack::new(code, format!("reading previous root of '{}'", seq.name()))
                })?;
                heads.extend(SequentialStorage::parse_root(&old_page));
            }
            for info in root_infos {
                let RootInfo::SequentialHead(head) = info else {
                    return Err(ErrorStack::new(
                        ErrorCode::SnapshotCycleFailed,
                        "mixed root-info kinds for one storage",
                    ));
                };
                if let Some(head) = head {
                    heads.push(*head);
                }
            }
            let root_page = Page::new();
            root_page.init(seq.id(), 0);
            SequentialStorage::write_root_entries(&root_page, &heads);
            writer.write_page(&root_page)
        }
    }
}

/// Install the new snapshot pointers for one storage. Runs inside the
/// pause; the installer is the sole mutator of snapshot pointers.
pub fn install_pointers(
    storage: &StorageRef,
    new_root: SnapshotPagePointer,
    root_infos: &[RootInfo],
    valid_until: Epoch,
) {
    match storage {
        StorageRef::Array(array) => {
            if let Some(root_page) = array.volatile_root_page() {
                for info in root_infos {
                    if let RootInfo::ArrayLeaves(leaves) = info {
                        for (leaf, pointer) in leaves {
                            array.leaf_pointer(root_page, *leaf).store_snapshot(*pointer);
                        }
                    }
                }
            }
            array.root_pointer().store_snapshot(new_root);
        }
        StorageRef::Sequential(seq) => {
            seq.install_snapshot(new_root, valid_until);
        }
    }
}

/// Drop volatile pages fully covered by the frontier. Runs inside the
/// pause.
pub fn drop_volatiles(
    storage: &StorageRef,
    valid_until: Epoch,
    chunks: &mut DropChunks,
) -> DropResult {
    match storage {
        StorageRef::Array(array) => {
            let Some(root_page) = array.volatile_root_page() else {
                return DropResult::all_dropped();
            };
            let mut result = DropResult::all_dropped();
            for leaf in 0..array.leaf_count() {
                let dual = array.leaf_pointer(root_page, leaf);
                let vp = dual.volatile_pointer();
                if vp.is_null() {
                    continue;
                }
                let page = chunks.pools.resolve(vp);
                let newest = array.leaf_max_epoch(page);
                if !newest.is_valid() || newest.before_or_equal(valid_until) {
                    dual.store_volatile(VolatilePagePointer::NULL);
                    chunks.drop_page(vp);
                    result.dropped_count += 1;
                    result.max_observed.store_max(newest);
                } else {
                    result.dropped_all = false;
                    result.max_observed.store_max(newest);
                }
            }
            result
        }
        StorageRef::Sequential(seq) => {
            let (dropped, max_observed, dropped_all) = seq.drop_volatiles(valid_until);
            DropResult {
                max_observed,
                dropped_all,
                dropped_count: dropped,
            }
        }
    }
}

/// Release the root volatile page too. Only valid when every partition
/// reported `dropped_all`; runs inside the pause.
pub fn drop_root_volatile(storage: &StorageRef, chunks: &mut DropChunks) -> u64 {
    match storage {
        StorageRef::Array(array) => {
            let vp = array.root_pointer().volatile_pointer();
            if vp.is_null() {
                return 0;
            }
            array
                .root_pointer()
                .store_volatile(VolatilePagePointer::NULL);
            chunks.drop_page(vp);
            1
        }
        // Sequential chains have no root volatile page.
        StorageRef::Sequential(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::RedoTuple;
    use crate::snapshot_file::SnapshotPageCache;
    use cinder_core::xct_id::XctId;
    use cinder_core::SnapshotOptions;
    use cinder_storage::{ArrayStorage, SequentialStorage};

    fn test_options(dir: &std::path::Path) -> SnapshotOptions {
        SnapshotOptions {
            folder_path_pattern: dir
                .join("snapshots/node_$NODE$")
                .to_string_lossy()
                .into_owned(),
            ..SnapshotOptions::for_testing()
        }
    }

    /// An `ArrayOverwrite` redo payload placing `bytes` at offset 0.
    fn overwrite_payload(record: u64, bytes: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 12 + bytes.len()];
        p[0..8].copy_from_slice(&record.to_le_bytes());
        p[8..10].copy_from_slice(&0u16.to_le_bytes());
        p[10..12].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        p[12..].copy_from_slice(bytes);
        p
    }

    fn overwrite_tuple(storage: u32, record: u64, epoch: u32, ordinal: u32, value: i64) -> RedoTuple {
        RedoTuple {
            storage_id: storage,
            key: record,
            xct_id: XctId::new(Epoch::from_raw(epoch), ordinal),
            kind: RedoKind::ArrayOverwrite,
            payload: overwrite_payload(record, &value.to_le_bytes()),
        }
    }

    fn append_tuple(storage: u32, epoch: u32, ordinal: u32, bytes: &[u8]) -> RedoTuple {
        RedoTuple {
            storage_id: storage,
            key: 0,
            xct_id: XctId::new(Epoch::from_raw(epoch), ordinal),
            kind: RedoKind::SequentialAppend,
            payload: bytes.to_vec(),
        }
    }

    fn read_slot_i64(array: &ArrayStorage, page: &Page, sub: u64) -> (XctId, i64) {
        let (owner, payload) = array.slot(page, sub);
        let mut bytes = [0u8; 8];
        // Safety: the page is an immutable snapshot image.
        unsafe {
            std::ptr::copy_nonoverlapping(payload, bytes.as_mut_ptr(), 8);
        }
        (owner.load_id(), i64::from_le_bytes(bytes))
    }

    #[test]
    fn array_compose_applies_the_sequence_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let pools = PagePools::new(1, 64);
        let source: Arc<dyn SnapshotPageSource> =
            Arc::new(SnapshotPageCache::new(options.clone()));
        let array =
            ArrayStorage::create(1, "accounts", 16, 8, pools.clone(), Arc::clone(&source))
                .unwrap();
        let storage = StorageRef::Array(Arc::clone(&array));

        // Two writers hit record 3; the later transaction must survive.
        let tuples = vec![
            overwrite_tuple(1, 3, 3, 1, 7),
            overwrite_tuple(1, 3, 3, 2, 9),
            overwrite_tuple(1, 5, 4, 1, 11),
        ];
        let mut writer = SnapshotWriter::create(&options, 1, 0).unwrap();
        let info = compose(&storage, 0, 1, &tuples, &mut writer, &source).unwrap();
        let RootInfo::ArrayLeaves(leaves) = &info else {
            panic!("array compose must yield leaves");
        };
        assert_eq!(leaves.len(), 1);
        writer.finish().unwrap();

        let page = source.read_page(leaves[0].1).unwrap();
        let (id3, value3) = read_slot_i64(&array, &page, 3);
        assert_eq!(id3, XctId::new(Epoch::from_raw(3), 2));
        assert_eq!(value3, 9);
        let (id5, value5) = read_slot_i64(&array, &page, 5);
        assert_eq!(id5, XctId::new(Epoch::from_raw(4), 1));
        assert_eq!(value5, 11);
        // Untouched records come out as never-written zeros.
        let (id0, value0) = read_slot_i64(&array, &page, 0);
        assert_eq!(id0, XctId::NULL);
        assert_eq!(value0, 0);
    }

    #[test]
    fn sequential_compose_keeps_the_full_history_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let pools = PagePools::new(1, 64);
        let source: Arc<dyn SnapshotPageSource> =
            Arc::new(SnapshotPageCache::new(options.clone()));
        let seq = SequentialStorage::create(2, "journal", pools, Arc::clone(&source)).unwrap();
        let storage = StorageRef::Sequential(Arc::clone(&seq));

        let tuples = vec![
            append_tuple(2, 3, 1, b"first"),
            append_tuple(2, 3, 2, b"second"),
            append_tuple(2, 4, 1, b"third"),
        ];
        let mut writer = SnapshotWriter::create(&options, 1, 0).unwrap();
        let info = compose(&storage, 0, 1, &tuples, &mut writer, &source).unwrap();
        let RootInfo::SequentialHead(Some(head)) = info else {
            panic!("records arrived, a chain head must exist");
        };
        writer.finish().unwrap();

        let page = source.read_page(head).unwrap();
        // Safety: snapshot pages are immutable.
        let slots: Vec<(XctId, Vec<u8>)> =
            SequentialStorage::parse_slots(unsafe { page.data() })
                .map(|(id, bytes)| (id, bytes.to_vec()))
                .collect();
        assert_eq!(
            slots,
            vec![
                (XctId::new(Epoch::from_raw(3), 1), b"first".to_vec()),
                (XctId::new(Epoch::from_raw(3), 2), b"second".to_vec()),
                (XctId::new(Epoch::from_raw(4), 1), b"third".to_vec()),
            ]
        );

        // No records, no chain.
        let mut writer = SnapshotWriter::create(&options, 2, 0).unwrap();
        let info = compose(&storage, 0, 1, &[], &mut writer, &source).unwrap();
        assert!(matches!(info, RootInfo::SequentialHead(None)));
        writer.finish().unwrap();
    }

    #[test]
    fn construct_root_requires_full_leaf_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let pools = PagePools::new(1, 64);
        let source: Arc<dyn SnapshotPageSource> =
            Arc::new(SnapshotPageCache::new(options.clone()));
        // 200 records at 16-byte payloads span two leaves.
        let array =
            ArrayStorage::create(1, "wide", 16, 200, pools.clone(), Arc::clone(&source))
                .unwrap();
        assert_eq!(array.leaf_count(), 2);
        let storage = StorageRef::Array(Arc::clone(&array));

        let mut writer = SnapshotWriter::create(&options, 1, 0).unwrap();
        let info = compose(&storage, 0, 1, &[], &mut writer, &source).unwrap();
        let leaves = match &info {
            RootInfo::ArrayLeaves(leaves) => leaves.clone(),
            _ => panic!("array compose must yield leaves"),
        };
        assert_eq!(leaves.len(), 2);

        // A root-info missing a leaf is a failed cycle, not a root.
        let partial = RootInfo::ArrayLeaves(vec![leaves[0]]);
        let err = construct_root(&storage, &[partial], &mut writer, &source).unwrap_err();
        assert_eq!(err.code, ErrorCode::SnapshotCycleFailed);

        let root = construct_root(&storage, &[info], &mut writer, &source).unwrap();
        writer.finish().unwrap();
        let root_page = source.read_page(root).unwrap();
        for (leaf, pointer) in &leaves {
            assert_eq!(
                array.leaf_pointer(&root_page, *leaf).snapshot_pointer(),
                *pointer
            );
        }
    }

    #[test]
    fn drop_volatiles_drops_cold_leaves_and_keeps_hot_ones() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let pools = PagePools::new(1, 64);
        let source: Arc<dyn SnapshotPageSource> =
            Arc::new(SnapshotPageCache::new(options.clone()));
        let array =
            ArrayStorage::create(1, "wide", 16, 200, pools.clone(), Arc::clone(&source))
                .unwrap();
        let storage = StorageRef::Array(Arc::clone(&array));

        // Leaf 0 saw its last commit at epoch 5, leaf 1 at epoch 9.
        let root_page = array.volatile_root_page().unwrap();
        let leaf0 = pools.resolve(array.leaf_pointer(root_page, 0).volatile_pointer());
        array.slot(leaf0, 0).0.store_id(XctId::new(Epoch::from_raw(5), 1));
        let leaf1 = pools.resolve(array.leaf_pointer(root_page, 1).volatile_pointer());
        array.slot(leaf1, 0).0.store_id(XctId::new(Epoch::from_raw(9), 1));

        let free_before = pools.pool(0).free_count();
        let mut chunks = DropChunks::new(pools.clone());
        let result = drop_volatiles(&storage, Epoch::from_raw(5), &mut chunks);
        chunks.flush();

        assert_eq!(result.dropped_count, 1);
        assert!(!result.dropped_all);
        assert_eq!(result.max_observed, Epoch::from_raw(9));
        assert!(array.leaf_pointer(root_page, 0).volatile_pointer().is_null());
        assert!(!array.leaf_pointer(root_page, 1).volatile_pointer().is_null());
        // The hot leaf and the root stay; only the cold leaf came back.
        assert_eq!(pools.pool(0).free_count(), free_before + 1);
        assert!(!array.root_pointer().volatile_pointer().is_null());
    }

    #[test]
    fn a_fully_dropped_tree_releases_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let pools = PagePools::new(1, 64);
        let source: Arc<dyn SnapshotPageSource> =
            Arc::new(SnapshotPageCache::new(options.clone()));
        let array =
            ArrayStorage::create(1, "small", 16, 8, pools.clone(), Arc::clone(&source))
                .unwrap();
        let storage = StorageRef::Array(Arc::clone(&array));

        let root_page = array.volatile_root_page().unwrap();
        let leaf = pools.resolve(array.leaf_pointer(root_page, 0).volatile_pointer());
        array.slot(leaf, 0).0.store_id(XctId::new(Epoch::from_raw(5), 1));

        let mut chunks = DropChunks::new(pools.clone());
        let result = drop_volatiles(&storage, Epoch::from_raw(5), &mut chunks);
        assert_eq!(result.dropped_count, 1);
        assert!(result.dropped_all);
        assert_eq!(result.max_observed, Epoch::from_raw(5));

        assert_eq!(drop_root_volatile(&storage, &mut chunks), 1);
        chunks.flush();
        assert!(array.root_pointer().volatile_pointer().is_null());
        // Every frame is home again.
        assert_eq!(pools.pool(0).free_count(), pools.pool(0).capacity());
    }

    #[test]
    fn sequential_drop_honors_the_frontier() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let pools = PagePools::new(1, 64);
        let source: Arc<dyn SnapshotPageSource> =
            Arc::new(SnapshotPageCache::new(options.clone()));
        let seq =
            SequentialStorage::create(2, "journal", pools.clone(), Arc::clone(&source)).unwrap();
        let storage = StorageRef::Sequential(Arc::clone(&seq));

        let mut chunks = DropChunks::new(pools);
        let result = drop_volatiles(&storage, Epoch::from_raw(5), &mut chunks);
        chunks.flush();
        // Nothing volatile yet, so the frontier is trivially covered.
        assert!(result.dropped_all);
        assert_eq!(result.dropped_count, 0);
        assert_eq!(drop_root_volatile(&storage, &mut chunks), 0);
    }
}
