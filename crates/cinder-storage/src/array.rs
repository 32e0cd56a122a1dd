//! Array storage: a fixed universe of fixed-size records.
//!
//! Layout is a two-level page tree. The root page's data region is an
//! array of [`DualPagePointer`]s, one per leaf; each leaf packs records at
//! a fixed stride of `{RwLockableXctId, payload}` slots. Record ordinals
//! map to `(leaf, slot)` by division, so every operation is O(1).
//!
//! Reads follow the dual-pointer rule: a present volatile leaf wins; a
//! null volatile side records a pointer observation (a concurrent install
//! must abort us) and falls through to the immutable snapshot leaf.
//! Writes always land on a volatile leaf, copy-on-writing it back from the
//! snapshot after a drop. All payload mutation is deferred to commit
//! publish; operations here only build redo records and observations.

use crate::primitive::Primitive;
use cinder_core::error::{CodeResult, ErrorCode, ErrorStack, StackResult};
use cinder_core::log::ArrayOverwriteRedo;
use cinder_core::page::{DualPagePointer, Page, VolatilePagePointer, PAGE_DATA_SIZE};
use cinder_core::traits::SnapshotPageSource;
use cinder_core::xct_id::RwLockableXctId;
use cinder_core::{Epoch, PagePools, StorageId};
use cinder_xct::{RecordAddress, Xct};
use std::sync::Arc;

/// Bytes of the owner version word in front of each record payload.
pub const RECORD_OWNER_SIZE: usize = std::mem::size_of::<RwLockableXctId>();
/// Dual pointers per root page; the array's leaf fan-out.
pub const ROOT_FANOUT: u64 = (PAGE_DATA_SIZE / std::mem::size_of::<DualPagePointer>()) as u64;
/// `page_id` of the root page (leaves use their leaf index).
pub const ROOT_PAGE_ID: u64 = u64::MAX;

/// A leaf page reached through either side of a dual pointer.
enum LeafRef<'a> {
    Volatile(&'a Page),
    Snapshot(Arc<Page>),
}

/// Fixed-size-record storage.
pub struct ArrayStorage {
    id: StorageId,
    name: String,
    payload_size: u16,
    record_count: u64,
    stride: usize,
    records_per_leaf: u64,
    leaf_count: u64,
    root: DualPagePointer,
    pools: PagePools,
    snapshot_source: Arc<dyn SnapshotPageSource>,
}

impl ArrayStorage {
    /// Record stride for a payload size: owner word plus the payload
    /// rounded up so every owner word stays 16-aligned.
    pub fn stride_for(payload_size: u16) -> usize {
        RECORD_OWNER_SIZE + ((payload_size as usize + 15) & !15)
    }

    /// Records that fit in one leaf for a payload size.
    pub fn records_per_leaf_for(payload_size: u16) -> u64 {
        (PAGE_DATA_SIZE / Self::stride_for(payload_size)) as u64
    }

    /// Create a storage with every volatile page preallocated and zeroed:
    /// all records exist from the start with zero payloads and null owner
    /// ids.
    pub fn create(
        id: StorageId,
        name: &str,
        payload_size: u16,
        record_count: u64,
        pools: PagePools,
        snapshot_source: Arc<dyn SnapshotPageSource>,
    ) -> StackResult<Arc<ArrayStorage>> {
        let storage = Self::layout(
            id,
            name,
            payload_size,
            record_count,
            pools,
            snapshot_source,
        )?;

        let root_vp = storage.pools.allocate(0).map_err(|code| {
            ErrorStack::new(code, format!("allocating root page of array '{}'", name))
        })?;
        let root_page = storage.pools.resolve(root_vp);
        root_page.init(id, ROOT_PAGE_ID);

        let node_count = storage.pools.node_count() as u64;
        for leaf in 0..storage.leaf_count {
            let node = (leaf % node_count) as u8;
            let leaf_vp = match storage.pools.allocate(node) {
                Ok(vp) => vp,
                Err(code) => {
                    storage.release_subtree(root_page, root_vp);
                    return Err(ErrorStack::new(
                        code,
                        format!("allocating leaf {} of array '{}'", leaf, name),
                    ));
                }
            };
            storage.pools.resolve(leaf_vp).init(id, leaf);
            storage.leaf_pointer(root_page, leaf).store_volatile(leaf_vp);
        }
        storage.root.store_volatile(root_vp);
        tracing::debug!(
            storage = id,
            name,
            record_count,
            leaves = storage.leaf_count,
            "created array storage"
        );
        Ok(storage)
    }

    /// Rebuild a storage handle from a snapshot root after restart. The
    /// volatile tree starts empty; writes copy leaves back on demand.
    pub fn load(
        id: StorageId,
        name: &str,
        payload_size: u16,
        record_count: u64,
        root_snapshot: cinder_core::SnapshotPagePointer,
        pools: PagePools,
        snapshot_source: Arc<dyn SnapshotPageSource>,
    ) -> StackResult<Arc<ArrayStorage>> {
        let storage = Self::layout(
            id,
            name,
            payload_size,
            record_count,
            pools,
            snapshot_source,
        )?;
        storage.root.store_snapshot(root_snapshot);
        Ok(storage)
    }

    fn layout(
        id: StorageId,
        name: &str,
        payload_size: u16,
        record_count: u64,
        pools: PagePools,
        snapshot_source: Arc<dyn SnapshotPageSource>,
    ) -> StackResult<Arc<ArrayStorage>> {
        if record_count == 0 {
            return Err(ErrorStack::new(
                ErrorCode::InvalidRecord,
                "array storages cannot be empty",
            ));
        }
        let stride = Self::stride_for(payload_size);
        let records_per_leaf = (PAGE_DATA_SIZE / stride) as u64;
        if records_per_leaf == 0 {
            return Err(ErrorStack::new(
                ErrorCode::CapacityExceeded,
                format!("payload size {} does not fit a page", payload_size),
            ));
        }
        let leaf_count = record_count.div_ceil(records_per_leaf);
        if leaf_count > ROOT_FANOUT {
            return Err(ErrorStack::new(
                ErrorCode::CapacityExceeded,
                format!(
                    "array '{}' needs {} leaves, root holds {}",
                    name, leaf_count, ROOT_FANOUT
                ),
            ));
        }
        Ok(Arc::new(ArrayStorage {
            id,
            name: name.to_string(),
            payload_size,
            record_count,
            stride,
            records_per_leaf,
            leaf_count,
            root: DualPagePointer::new(),
            pools,
            snapshot_source,
        }))
    }

    fn release_subtree(&self, root_page: &Page, root_vp: VolatilePagePointer) {
        for leaf in 0..self.leaf_count {
            let vp = self.leaf_pointer(root_page, leaf).volatile_pointer();
            if !vp.is_null() {
                self.pools.release(vp);
            }
        }
        self.pools.release(root_vp);
    }

    // === Introspection (used by the snapshot pipeline as well) ===

    /// Storage id.
    pub fn id(&self) -> StorageId {
        self.id
    }

    /// Storage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload bytes per record.
    pub fn payload_size(&self) -> u16 {
        self.payload_size
    }

    /// Number of records.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Slot stride within leaves.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Records per leaf page.
    pub fn records_per_leaf(&self) -> u64 {
        self.records_per_leaf
    }

    /// Leaf pages backing this storage.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// The root dual pointer.
    pub fn root_pointer(&self) -> &DualPagePointer {
        &self.root
    }

    /// The volatile root page, if one is installed.
    pub fn volatile_root_page(&self) -> Option<&Page> {
        let vp = self.root.volatile_pointer();
        if vp.is_null() {
            None
        } else {
            Some(self.pools.resolve(vp))
        }
    }

    /// The dual pointer of `leaf` inside a root page (volatile or
    /// snapshot; both share the layout).
    pub fn leaf_pointer<'a>(&self, root_page: &'a Page, leaf: u64) -> &'a DualPagePointer {
        debug_assert!(leaf < ROOT_FANOUT);
        // Safety: the root page data region is an array of DualPagePointer
        // (repr(C), 16-byte entries) and the region is 8-aligned.
        unsafe {
            &*(root_page
                .data_ptr()
                .add(leaf as usize * std::mem::size_of::<DualPagePointer>())
                as *const DualPagePointer)
        }
    }

    /// Owner word and payload pointer of a slot in a leaf page.
    pub fn slot<'a>(&self, leaf_page: &'a Page, sub: u64) -> (&'a RwLockableXctId, *mut u8) {
        debug_assert!(sub < self.records_per_leaf);
        let offset = sub as usize * self.stride;
        // Safety: slots are 16-aligned (stride is a multiple of 16, data
        // region is 16-aligned) and the owner word is an atomic struct.
        unsafe {
            let base = leaf_page.data_ptr().add(offset);
            (
                &*(base as *const RwLockableXctId),
                base.add(RECORD_OWNER_SIZE),
            )
        }
    }

    /// Largest committed epoch among a leaf's records; invalid when the
    /// leaf was never written. Used by the volatile-drop walk.
    pub fn leaf_max_epoch(&self, leaf_page: &Page) -> Epoch {
        let mut max = Epoch::INVALID;
        for sub in 0..self.records_per_leaf {
            let (owner, _) = self.slot(leaf_page, sub);
            max.store_max(owner.load_id().epoch());
        }
        max
    }

    fn locate(&self, record: u64) -> (u64, u64) {
        (
            record / self.records_per_leaf,
            record % self.records_per_leaf,
        )
    }

    fn check_range(&self, record: u64, payload_offset: u16, len: usize) -> CodeResult<()> {
        if record >= self.record_count {
            return Err(ErrorCode::InvalidRecord);
        }
        if payload_offset as usize + len > self.payload_size as usize {
            return Err(ErrorCode::InvalidPayloadRange);
        }
        Ok(())
    }

    // === Reads ===

    /// Read the whole payload of one record.
    pub fn get(&self, xct: &mut Xct, record: u64, out: &mut [u8]) -> CodeResult<()> {
        self.get_part(xct, record, out, 0)
    }

    /// Read `out.len()` bytes starting at `payload_offset`.
    pub fn get_part(
        &self,
        xct: &mut Xct,
        record: u64,
        out: &mut [u8],
        payload_offset: u16,
    ) -> CodeResult<()> {
        self.check_range(record, payload_offset, out.len())?;
        let (leaf, sub) = self.locate(record);
        match self.resolve_leaf_for_read(xct, leaf)? {
            LeafRef::Volatile(page) => {
                let (owner, payload) = self.slot(page, sub);
                let mut observed = owner.load_id();
                while observed.is_being_written() {
                    std::hint::spin_loop();
                    observed = owner.load_id();
                }
                // Observe-then-read: the observation is in the read set
                // before any payload byte moves, so a racing writer makes
                // the commit fail rather than go unnoticed.
                xct.add_to_read_set(self.id, observed, RecordAddress::new(owner))?;
                // Safety: in-range copy; a torn read against a concurrent
                // publisher is caught by commit verification.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload.add(payload_offset as usize),
                        out.as_mut_ptr(),
                        out.len(),
                    );
                }
                Ok(())
            }
            LeafRef::Snapshot(page) => {
                let (_, payload) = self.slot(&page, sub);
                // Snapshot pages are immutable; nothing to track.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload.add(payload_offset as usize),
                        out.as_mut_ptr(),
                        out.len(),
                    );
                }
                Ok(())
            }
        }
    }

    /// Typed read at a payload offset.
    pub fn get_primitive<T: Primitive>(
        &self,
        xct: &mut Xct,
        record: u64,
        payload_offset: u16,
    ) -> CodeResult<T> {
        debug_assert!(T::SIZE <= 8);
        let mut buf = [0u8; 8];
        self.get_part(xct, record, &mut buf[..T::SIZE], payload_offset)?;
        Ok(T::read_le(&buf[..T::SIZE]))
    }

    // === Writes ===

    /// Overwrite the whole payload.
    pub fn overwrite(&self, xct: &mut Xct, record: u64, data: &[u8]) -> CodeResult<()> {
        self.overwrite_part(xct, record, data, 0)
    }

    /// Overwrite `data.len()` bytes at `payload_offset`. Blind: no read
    /// observation is taken, matching overwrite's contract.
    pub fn overwrite_part(
        &self,
        xct: &mut Xct,
        record: u64,
        data: &[u8],
        payload_offset: u16,
    ) -> CodeResult<()> {
        self.check_range(record, payload_offset, data.len())?;
        let (leaf, sub) = self.locate(record);
        let page = self.resolve_leaf_for_write(xct, leaf)?;
        let (owner, payload) = self.slot(page, sub);

        let redo = ArrayOverwriteRedo {
            record,
            payload_offset,
            bytes: data,
        };
        let log_len = redo.record_len();
        let log_offset = xct.acquire_local_work_memory(log_len)?;
        redo.encode_record(self.id, xct.work_bytes_mut(log_offset, log_len));
        xct.add_to_write_set(
            self.id,
            RecordAddress::new(owner),
            payload,
            log_offset,
            log_len,
        )?;
        Ok(())
    }

    /// Typed overwrite at a payload offset.
    pub fn overwrite_primitive<T: Primitive>(
        &self,
        xct: &mut Xct,
        record: u64,
        value: T,
        payload_offset: u16,
    ) -> CodeResult<()> {
        debug_assert!(T::SIZE <= 8);
        let mut buf = [0u8; 8];
        value.write_le(&mut buf[..T::SIZE]);
        self.overwrite_part(xct, record, &buf[..T::SIZE], payload_offset)
    }

    /// Read-add-write one primitive, returning the new value. The read
    /// and the write are cross-linked so verification knows the record is
    /// locked by this very transaction.
    pub fn increment<T: Primitive>(
        &self,
        xct: &mut Xct,
        record: u64,
        addend: T,
        payload_offset: u16,
    ) -> CodeResult<T> {
        debug_assert!(T::SIZE <= 8);
        self.check_range(record, payload_offset, T::SIZE)?;
        let (leaf, sub) = self.locate(record);
        let page = self.resolve_leaf_for_write(xct, leaf)?;
        let (owner, payload) = self.slot(page, sub);

        let mut observed = owner.load_id();
        while observed.is_being_written() {
            std::hint::spin_loop();
            observed = owner.load_id();
        }
        let read_index = xct.add_to_read_set(self.id, observed, RecordAddress::new(owner))?;

        let mut current = [0u8; 8];
        // Safety: in-range copy; torn reads abort at verification.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.add(payload_offset as usize),
                current.as_mut_ptr(),
                T::SIZE,
            );
        }
        let new_value = T::read_le(&current[..T::SIZE]).add(addend);
        let mut new_bytes = [0u8; 8];
        new_value.write_le(&mut new_bytes[..T::SIZE]);

        let redo = ArrayOverwriteRedo {
            record,
            payload_offset,
            bytes: &new_bytes[..T::SIZE],
        };
        let log_len = redo.record_len();
        let log_offset = xct.acquire_local_work_memory(log_len)?;
        redo.encode_record(self.id, xct.work_bytes_mut(log_offset, log_len));
        let write_index = xct.add_to_write_set(
            self.id,
            RecordAddress::new(owner),
            payload,
            log_offset,
            log_len,
        )?;
        xct.link_read_write(read_index, write_index);
        Ok(new_value)
    }

    // === Pointer resolution ===

    fn resolve_leaf_for_read(&self, xct: &mut Xct, leaf: u64) -> CodeResult<LeafRef<'_>> {
        let root_vp = self.root.volatile_pointer();
        if root_vp.is_null() {
            // The whole tree is under-snapshot; one observation on the
            // root pointer covers the descent.
            xct.add_to_pointer_set(&self.root, VolatilePagePointer::NULL)?;
            let root_sp = self.root.snapshot_pointer();
            debug_assert!(!root_sp.is_null());
            let root_page = self.snapshot_source.read_page(root_sp)?;
            let leaf_sp = self.leaf_pointer(&root_page, leaf).snapshot_pointer();
            debug_assert!(!leaf_sp.is_null());
            return Ok(LeafRef::Snapshot(self.snapshot_source.read_page(leaf_sp)?));
        }
        let root_page = self.pools.resolve(root_vp);
        let leaf_dual = self.leaf_pointer(root_page, leaf);
        let leaf_vp = leaf_dual.volatile_pointer();
        if !leaf_vp.is_null() {
            return Ok(LeafRef::Volatile(self.pools.resolve(leaf_vp)));
        }
        // Null volatile side: a concurrent writer may install one; the
        // observation makes that a verification failure instead of a
        // missed update.
        xct.add_to_pointer_set(leaf_dual, VolatilePagePointer::NULL)?;
        let leaf_sp = leaf_dual.snapshot_pointer();
        debug_assert!(!leaf_sp.is_null());
        Ok(LeafRef::Snapshot(self.snapshot_source.read_page(leaf_sp)?))
    }

    fn resolve_leaf_for_write(&self, xct: &mut Xct, leaf: u64) -> CodeResult<&Page> {
        let root_page = self.resolve_root_for_write(xct)?;
        let leaf_dual = self.leaf_pointer(root_page, leaf);
        let leaf_vp = leaf_dual.volatile_pointer();
        if !leaf_vp.is_null() {
            return Ok(self.pools.resolve(leaf_vp));
        }

        // Copy-on-write reinstall from the snapshot leaf.
        let leaf_sp = leaf_dual.snapshot_pointer();
        let snapshot_page = if leaf_sp.is_null() {
            None
        } else {
            Some(self.snapshot_source.read_page(leaf_sp)?)
        };
        let node = (leaf % self.pools.node_count() as u64) as u8;
        let new_vp = self.pools.allocate(node)?;
        let new_page = self.pools.resolve(new_vp);
        new_page.init(self.id, leaf);
        if let Some(snapshot_page) = snapshot_page {
            // Safety: the new page is unreachable until the install below;
            // snapshot pages are immutable. Owner ids (and their epochs)
            // carry over; snapshot lock words are zero.
            unsafe {
                new_page
                    .data_mut()
                    .copy_from_slice(snapshot_page.data().as_slice());
            }
        }
        match leaf_dual.try_install_volatile(new_vp) {
            Ok(()) => {
                // Our own earlier null observation must not abort us.
                xct.overwrite_to_pointer_set(leaf_dual, new_vp);
                Ok(self.pools.resolve(new_vp))
            }
            Err(winner) => {
                self.pools.release(new_vp);
                xct.overwrite_to_pointer_set(leaf_dual, winner);
                Ok(self.pools.resolve(winner))
            }
        }
    }

    fn resolve_root_for_write(&self, xct: &mut Xct) -> CodeResult<&Page> {
        let root_vp = self.root.volatile_pointer();
        if !root_vp.is_null() {
            return Ok(self.pools.resolve(root_vp));
        }
        let root_sp = self.root.snapshot_pointer();
        debug_assert!(!root_sp.is_null(), "array root lost both homes");
        let snapshot_root = self.snapshot_source.read_page(root_sp)?;
        let new_vp = self.pools.allocate(0)?;
        let new_page = self.pools.resolve(new_vp);
        new_page.init(self.id, ROOT_PAGE_ID);
        // Carry the snapshot side of every leaf pointer; volatile sides
        // start null and are copy-on-write installed per leaf.
        for leaf in 0..self.leaf_count {
            let sp = self.leaf_pointer(&snapshot_root, leaf).snapshot_pointer();
            self.leaf_pointer(new_page, leaf).store_snapshot(sp);
        }
        match self.root.try_install_volatile(new_vp) {
            Ok(()) => {
                xct.overwrite_to_pointer_set(&self.root, new_vp);
                Ok(self.pools.resolve(new_vp))
            }
            Err(winner) => {
                self.pools.release(new_vp);
                xct.overwrite_to_pointer_set(&self.root, winner);
                Ok(self.pools.resolve(winner))
            }
        }
    }
}

impl std::fmt::Debug for ArrayStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStorage")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("payload_size", &self.payload_size)
            .field("record_count", &self.record_count)
            .field("leaf_count", &self.leaf_count)
            .finish()
    }
}
