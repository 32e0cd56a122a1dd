//! Sequential storage: append-only records, visited in bulk.
//!
//! Appends bypass read verification entirely: the record slot is reserved
//! in the appending thread's own volatile page chain at operation time
//! with a **null owner id** (invisible), and commit publish stamps the
//! real id through the lock-free write set. An aborted reservation simply
//! stays null; the space comes back when the chain is dropped after the
//! next snapshot.
//!
//! # Volatile page layout (data region)
//!
//! ```text
//! ┌──────────────────┬──────────┬───────┬──────────────────────────────┐
//! │ next (Dual, 16)  │ used (2) │ pad   │ slots from offset 32         │
//! └──────────────────┴──────────┴───────┴──────────────────────────────┘
//! slot: ┌────────────────┬─────────┬───────┬─────────────┬────────────┐
//!       │ owner (16)     │ len (4) │ pad 4 │ payload     │ pad to 16  │
//!       └────────────────┴─────────┴───────┴─────────────┴────────────┘
//! ```
//!
//! Snapshot pages share the slot layout; the snapshot root page lists the
//! head page of every composed chain. A scanner reads the snapshot side
//! first, then the volatile chains with records filtered to epochs newer
//! than the snapshot's `valid_until`, so nothing is double-counted.

use cinder_core::error::{CodeResult, ErrorCode, StackResult};
use cinder_core::log::{RedoHeader, RedoKind, RECORD_HEADER_SIZE};
use cinder_core::page::{DualPagePointer, Page, SnapshotPagePointer, VolatilePagePointer, PAGE_DATA_SIZE};
use cinder_core::traits::SnapshotPageSource;
use cinder_core::xct_id::{RwLockableXctId, XctId};
use cinder_core::{AtomicEpoch, Epoch, PagePools, StorageId, ThreadId};
use cinder_xct::{RecordAddress, Xct};
use dashmap::DashMap;
use std::sync::Arc;

/// Offset of the `next` dual pointer within the data region.
const NEXT_OFFSET: usize = 0;
/// Offset of the `used` watermark.
const USED_OFFSET: usize = 16;
/// First slot offset.
const DATA_START: usize = 32;
/// Per-slot header: owner word + length + padding.
const SLOT_HEADER: usize = 24;
/// Largest appendable record payload.
pub const MAX_SEQ_PAYLOAD: usize = PAGE_DATA_SIZE - DATA_START - SLOT_HEADER;

fn slot_total(len: usize) -> usize {
    (SLOT_HEADER + len + 15) & !15
}

/// One thread's volatile chain.
#[derive(Debug, Clone, Copy, Default)]
struct SeqChain {
    node: u8,
    head: VolatilePagePointer,
    tail: VolatilePagePointer,
}

/// Append-only storage.
pub struct SequentialStorage {
    id: StorageId,
    name: String,
    chains: DashMap<ThreadId, SeqChain>,
    root: DualPagePointer,
    snapshot_valid_until: AtomicEpoch,
    pools: PagePools,
    snapshot_source: Arc<dyn SnapshotPageSource>,
}

impl SequentialStorage {
    /// Create an empty storage.
    pub fn create(
        id: StorageId,
        name: &str,
        pools: PagePools,
        snapshot_source: Arc<dyn SnapshotPageSource>,
    ) -> StackResult<Arc<SequentialStorage>> {
        tracing::debug!(storage = id, name, "created sequential storage");
        Ok(Arc::new(SequentialStorage {
            id,
            name: name.to_string(),
            chains: DashMap::new(),
            root: DualPagePointer::new(),
            snapshot_valid_until: AtomicEpoch::new(Epoch::INVALID),
            pools,
            snapshot_source,
        }))
    }

    /// Rebuild from a snapshot root after restart.
    pub fn load(
        id: StorageId,
        name: &str,
        root_snapshot: SnapshotPagePointer,
        valid_until: Epoch,
        pools: PagePools,
        snapshot_source: Arc<dyn SnapshotPageSource>,
    ) -> StackResult<Arc<SequentialStorage>> {
        let storage = Self::create(id, name, pools, snapshot_source)?;
        storage.root.store_snapshot(root_snapshot);
        storage.snapshot_valid_until.store(valid_until);
        Ok(storage)
    }

    /// Storage id.
    pub fn id(&self) -> StorageId {
        self.id
    }

    /// Storage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root dual pointer (snapshot side only; volatile state is the
    /// per-thread chain map).
    pub fn root_pointer(&self) -> &DualPagePointer {
        &self.root
    }

    /// Epoch up to which the snapshot side is complete.
    pub fn snapshot_valid_until(&self) -> Epoch {
        self.snapshot_valid_until.load()
    }

    /// Swing the snapshot side. Called by the installer inside the pause.
    pub fn install_snapshot(&self, root: SnapshotPagePointer, valid_until: Epoch) {
        self.root.store_snapshot(root);
        self.snapshot_valid_until.store(valid_until);
    }

    // === Appends ===

    /// Reserve a slot in this thread's chain and register the lock-free
    /// write. `node` is the calling thread's NUMA node.
    pub fn append(&self, xct: &mut Xct, node: u8, bytes: &[u8]) -> CodeResult<()> {
        if bytes.len() > MAX_SEQ_PAYLOAD {
            return Err(ErrorCode::InvalidPayloadRange);
        }
        // Build the redo record first; reservation only happens when the
        // transaction can actually track it.
        let log_len = RECORD_HEADER_SIZE + bytes.len();
        let log_offset = xct.acquire_local_work_memory(log_len)?;
        {
            let out = xct.work_bytes_mut(log_offset, log_len);
            RedoHeader {
                length: log_len as u16,
                kind: RedoKind::SequentialAppend,
                storage_id: self.id,
                xct_id: XctId::NULL,
            }
            .encode_into(out);
            out[RECORD_HEADER_SIZE..].copy_from_slice(bytes);
        }

        let thread = xct.thread_id();
        let owner = {
            let mut chain = self.chains.entry(thread).or_insert_with(|| SeqChain {
                node,
                ..Default::default()
            });
            let tail_page = self.tail_with_space(&mut chain, slot_total(bytes.len()))?;
            Self::reserve_slot(tail_page, bytes)
        };
        xct.add_to_lock_free_write_set(self.id, owner, log_offset, log_len)
    }

    /// Ensure the chain's tail page has `needed` free bytes, growing the
    /// chain if not.
    fn tail_with_space(&self, chain: &mut SeqChain, needed: usize) -> CodeResult<&Page> {
        if !chain.tail.is_null() {
            let page = self.pools.resolve(chain.tail);
            if PAGE_DATA_SIZE - Self::used_of(page) >= needed {
                return Ok(page);
            }
        }
        let vp = self.pools.allocate(chain.node)?;
        let page = self.pools.resolve(vp);
        page.init(self.id, 0);
        Self::set_used(page, DATA_START as u16);
        if chain.tail.is_null() {
            chain.head = vp;
        } else {
            let old_tail = self.pools.resolve(chain.tail);
            Self::next_pointer(old_tail).store_volatile(vp);
        }
        chain.tail = vp;
        Ok(page)
    }

    /// Write one slot with a null owner id under the page version lock.
    fn reserve_slot(page: &Page, bytes: &[u8]) -> RecordAddress {
        let version = page.version();
        version.lock();
        let used = Self::used_of(page);
        debug_assert!(used + slot_total(bytes.len()) <= PAGE_DATA_SIZE);
        // Safety: the version lock serializes all slot writes on this
        // page, and `used` always points past fully written slots.
        let owner = unsafe {
            let base = page.data_ptr().add(used);
            std::ptr::write_bytes(base, 0, SLOT_HEADER);
            (base.add(16) as *mut u32).write_unaligned(bytes.len() as u32);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(SLOT_HEADER), bytes.len());
            &*(base as *const RwLockableXctId)
        };
        Self::set_used(page, (used + slot_total(bytes.len())) as u16);
        version.unlock(true);
        RecordAddress::new(owner)
    }

    // === Scans ===

    /// Visit every committed record: the snapshot side first, then the
    /// volatile chains filtered to epochs past the snapshot frontier.
    ///
    /// Volatile pages are copied out under a version-stable read and the
    /// observation lands in the page-version set, so a racing append
    /// aborts a serializable scanner at commit.
    pub fn scan(
        &self,
        xct: &mut Xct,
        visitor: &mut dyn FnMut(XctId, &[u8]),
    ) -> CodeResult<()> {
        let root_sp = self.root.snapshot_pointer();
        if !root_sp.is_null() {
            let root_page = self.snapshot_source.read_page(root_sp)?;
            for head in Self::parse_root(&root_page) {
                let mut next = head;
                while !next.is_null() {
                    let page = self.snapshot_source.read_page(next)?;
                    // Safety: snapshot pages are immutable.
                    let data = unsafe { page.data() };
                    for (id, payload) in Self::parse_slots(data) {
                        visitor(id, payload);
                    }
                    next = Self::next_in_copy(data).1;
                }
            }
        }

        let frontier = self.snapshot_valid_until.load();
        let heads: Vec<VolatilePagePointer> =
            self.chains.iter().map(|entry| entry.head).collect();
        for head in heads {
            let mut next = head;
            while !next.is_null() {
                let page = self.pools.resolve(next);
                let (copy, status) = Self::stable_copy(page);
                xct.add_to_page_version_set(page.version(), status)?;
                for (id, payload) in Self::parse_slots(&copy[..]) {
                    if !id.is_valid() {
                        // Reserved but never published (in-flight or
                        // aborted append).
                        continue;
                    }
                    if frontier.is_valid() && id.epoch().before_or_equal(frontier) {
                        // Already visited through the snapshot side.
                        continue;
                    }
                    visitor(id, payload);
                }
                next = Self::next_in_copy(&copy[..]).0;
            }
        }
        Ok(())
    }

    /// Copy a volatile page's data region with before/after version
    /// checks, so the copy is internally consistent.
    fn stable_copy(page: &Page) -> (Box<[u8; PAGE_DATA_SIZE]>, cinder_core::PageVersionStatus) {
        let version = page.version();
        loop {
            let before = version.observe();
            // Safety: the copy is re-validated against the version below.
            let copy: Box<[u8; PAGE_DATA_SIZE]> = Box::new(unsafe { *page.data() });
            match version.try_observe() {
                Some(after) if after == before => return (copy, before),
                _ => std::hint::spin_loop(),
            }
        }
    }

    /// `(volatile, snapshot)` next pointers parsed from a data copy.
    fn next_in_copy(data: &[u8]) -> (VolatilePagePointer, SnapshotPagePointer) {
        let volatile = u64::from_le_bytes(data[NEXT_OFFSET..NEXT_OFFSET + 8].try_into().unwrap());
        let snapshot =
            u64::from_le_bytes(data[NEXT_OFFSET + 8..NEXT_OFFSET + 16].try_into().unwrap());
        (
            VolatilePagePointer::from_raw(volatile),
            SnapshotPagePointer::from_raw(snapshot),
        )
    }

    /// Parse `(owner id, payload)` slots out of a page data region.
    pub fn parse_slots(data: &[u8]) -> SlotIter<'_> {
        let used = u16::from_le_bytes(data[USED_OFFSET..USED_OFFSET + 2].try_into().unwrap())
            as usize;
        SlotIter {
            data,
            pos: DATA_START,
            used: used.clamp(DATA_START, PAGE_DATA_SIZE),
        }
    }

    /// The `next` dual pointer embedded in a live page.
    pub fn next_pointer(page: &Page) -> &DualPagePointer {
        // Safety: offset 0 of the data region is 16-aligned and holds a
        // repr(C) DualPagePointer by layout.
        unsafe { &*(page.data_ptr().add(NEXT_OFFSET) as *const DualPagePointer) }
    }

    /// Append a fully formed record into a snapshot page under
    /// construction. Returns false when the page is full. Composer-only:
    /// the page is exclusively owned.
    pub fn compose_append(page: &Page, id: XctId, bytes: &[u8]) -> bool {
        let used = Self::used_of(page);
        if PAGE_DATA_SIZE - used < slot_total(bytes.len()) {
            return false;
        }
        // Safety: exclusive page under construction.
        unsafe {
            let base = page.data_ptr().add(used);
            std::ptr::write_bytes(base, 0, SLOT_HEADER);
            (base as *mut u64).write(id.raw());
            (base.add(16) as *mut u32).write_unaligned(bytes.len() as u32);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(SLOT_HEADER), bytes.len());
        }
        Self::set_used(page, (used + slot_total(bytes.len())) as u16);
        true
    }

    /// Initialize a snapshot page under construction.
    pub fn init_compose_page(page: &Page, storage_id: StorageId, sequence: u64) {
        page.init(storage_id, sequence);
        Self::set_used(page, DATA_START as u16);
    }

    /// Build the snapshot root page content from composed chain heads.
    pub fn write_root_entries(page: &Page, heads: &[SnapshotPagePointer]) {
        // Safety: exclusive page under construction.
        unsafe {
            let data = page.data_mut();
            data[0..4].copy_from_slice(&(heads.len() as u32).to_le_bytes());
            for (i, head) in heads.iter().enumerate() {
                let at = 8 + i * 8;
                data[at..at + 8].copy_from_slice(&head.raw().to_le_bytes());
            }
        }
    }

    /// Parse chain heads out of a snapshot root page.
    pub fn parse_root(page: &Page) -> Vec<SnapshotPagePointer> {
        // Safety: snapshot pages are immutable.
        let data = unsafe { page.data() };
        let count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        (0..count)
            .map(|i| {
                let at = 8 + i * 8;
                SnapshotPagePointer::from_raw(u64::from_le_bytes(
                    data[at..at + 8].try_into().unwrap(),
                ))
            })
            .collect()
    }

    fn used_of(page: &Page) -> usize {
        // Safety: two-byte read of the used watermark; writers hold the
        // version lock or own the page exclusively.
        unsafe {
            let data = page.data();
            u16::from_le_bytes(data[USED_OFFSET..USED_OFFSET + 2].try_into().unwrap()) as usize
        }
    }

    fn set_used(page: &Page, used: u16) {
        // Safety: same contract as used_of, writer side.
        unsafe {
            page.data_mut()[USED_OFFSET..USED_OFFSET + 2].copy_from_slice(&used.to_le_bytes());
        }
    }

    // === Volatile drop (called inside the snapshot pause) ===

    /// Drop volatile chain pages fully covered by the snapshot frontier.
    /// Returns `(dropped_pages, max_epoch_observed, dropped_all)`.
    pub fn drop_volatiles(&self, valid_until: Epoch) -> (u64, Epoch, bool) {
        let mut dropped = 0u64;
        let mut max_observed = Epoch::INVALID;
        let mut dropped_all = true;
        let threads: Vec<ThreadId> = self.chains.iter().map(|e| *e.key()).collect();
        for thread in threads {
            let Some(mut entry) = self.chains.get_mut(&thread) else {
                continue;
            };
            while !entry.head.is_null() {
                let page = self.pools.resolve(entry.head);
                // Safety: transactions are paused; nobody mutates pages.
                let data = unsafe { page.data() };
                let mut page_max = Epoch::INVALID;
                let mut any_newer = false;
                for (id, _) in Self::parse_slots(data) {
                    if id.is_valid() {
                        page_max.store_max(id.epoch());
                        if valid_until.before(id.epoch()) {
                            any_newer = true;
                        }
                    }
                }
                max_observed.store_max(page_max);
                if any_newer {
                    dropped_all = false;
                    break;
                }
                let (next, _) = Self::next_in_copy(data);
                self.pools.release(entry.head);
                dropped += 1;
                entry.head = next;
                if next.is_null() {
                    entry.tail = VolatilePagePointer::NULL;
                }
            }
            if !entry.head.is_null() {
                dropped_all = false;
            }
        }
        self.chains.retain(|_, chain| !chain.head.is_null());
        (dropped, max_observed, dropped_all)
    }
}

impl std::fmt::Debug for SequentialStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialStorage")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("chains", &self.chains.len())
            .finish()
    }
}

/// Iterator over `(owner id, payload)` slots in a page data region.
#[derive(Debug)]
pub struct SlotIter<'a> {
    data: &'a [u8],
    pos: usize,
    used: usize,
}

impl<'a> Iterator for SlotIter<'a> {
    type Item = (XctId, &'a [u8]);

    fn next(&mut self) -> Option<(XctId, &'a [u8])> {
        if self.pos + SLOT_HEADER > self.used {
            return None;
        }
        let id = XctId::from_raw(u64::from_le_bytes(
            self.data[self.pos..self.pos + 8].try_into().unwrap(),
        ));
        let len = u32::from_le_bytes(
            self.data[self.pos + 16..self.pos + 20].try_into().unwrap(),
        ) as usize;
        let start = self.pos + SLOT_HEADER;
        if start + len > self.used {
            return None;
        }
        self.pos += slot_total(len);
        Some((id, &self.data[start..start + len]))
    }
}
