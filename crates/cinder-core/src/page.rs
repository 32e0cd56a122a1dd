//! Fixed-size pages and the dual volatile/snapshot pointer model.
//!
//! Every logical page can exist in two forms at once: a **volatile** page
//! in the in-memory pool (mutable, reached through a
//! [`VolatilePagePointer`]) and a **snapshot** page in an immutable on-disk
//! file (reached through a [`SnapshotPagePointer`]). A [`DualPagePointer`]
//! holds one of each; either, both, or neither side may be null.
//!
//! Pointer transitions:
//! - the volatile side is installed by CAS (first writer wins, the loser
//!   returns its page to the pool);
//! - the snapshot side is written only by the snapshot pipeline and then
//!   swung;
//! - both sides are cleared only inside the snapshot install pause.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Size of every page, volatile or snapshot.
pub const PAGE_SIZE: usize = 4096;
/// Bytes reserved for [`PageHeader`] at the front of each page.
pub const PAGE_HEADER_SIZE: usize = 64;
/// Usable payload bytes per page.
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

const VERSION_LOCKED_BIT: u64 = 1 << 63;
const VERSION_SPLITTING_BIT: u64 = 1 << 62;
const VERSION_INSERTING_BIT: u64 = 1 << 61;
const VERSION_COUNTER_MASK: u64 = (1 << 61) - 1;

/// The status portion of a page version: everything except the lock bit.
///
/// A reader samples this before touching page content and re-checks it
/// afterwards; any change means the read raced with a structural
/// modification and must retry (or, for a tracked observation, abort at
/// commit).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageVersionStatus(u64);

impl PageVersionStatus {
    /// Raw status word.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Structural-modification counter.
    pub fn counter(&self) -> u64 {
        self.0 & VERSION_COUNTER_MASK
    }

    /// Whether an insert was in progress when sampled.
    pub fn is_inserting(&self) -> bool {
        self.0 & VERSION_INSERTING_BIT != 0
    }

    /// Whether a split was in progress when sampled.
    pub fn is_splitting(&self) -> bool {
        self.0 & VERSION_SPLITTING_BIT != 0
    }
}

/// Per-page version word: a lock bit plus insert/split flags and a
/// monotone counter. Structural changes to the page bump the counter, so
/// the counter doubles as the page's append-only modification log.
#[derive(Debug)]
pub struct PageVersion(AtomicU64);

impl PageVersion {
    /// Fresh, unlocked version.
    pub fn new() -> PageVersion {
        PageVersion(AtomicU64::new(0))
    }

    /// Sample the status, spinning past a concurrently held lock.
    pub fn observe(&self) -> PageVersionStatus {
        loop {
            let word = self.0.load(Ordering::Acquire);
            if word & VERSION_LOCKED_BIT == 0 {
                return PageVersionStatus(word);
            }
            std::hint::spin_loop();
        }
    }

    /// Non-blocking sample; `None` while locked.
    pub fn try_observe(&self) -> Option<PageVersionStatus> {
        let word = self.0.load(Ordering::Acquire);
        if word & VERSION_LOCKED_BIT == 0 {
            Some(PageVersionStatus(word))
        } else {
            None
        }
    }

    /// Spin until the page lock is held.
    pub fn lock(&self) {
        loop {
            let word = self.0.load(Ordering::Relaxed);
            if word & VERSION_LOCKED_BIT == 0
                && self
                    .0
                    .compare_exchange_weak(
                        word,
                        word | VERSION_LOCKED_BIT,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Release the page lock, bumping the counter when the content
    /// structurally changed under it.
    pub fn unlock(&self, bump_counter: bool) {
        let word = self.0.load(Ordering::Relaxed);
        debug_assert!(word & VERSION_LOCKED_BIT != 0);
        let mut next = word & !VERSION_LOCKED_BIT;
        if bump_counter {
            next = (next & !VERSION_COUNTER_MASK) | ((next & VERSION_COUNTER_MASK) + 1);
        }
        self.0.store(next, Ordering::Release);
    }

    /// Set or clear the inserting flag. Caller holds the page lock.
    pub fn set_inserting(&self, on: bool) {
        let word = self.0.load(Ordering::Relaxed);
        debug_assert!(word & VERSION_LOCKED_BIT != 0);
        let next = if on {
            word | VERSION_INSERTING_BIT
        } else {
            word & !VERSION_INSERTING_BIT
        };
        self.0.store(next, Ordering::Release);
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for PageVersion {
    fn default() -> Self {
        Self::new()
    }
}

/// Pointer to a page in the volatile pool: `[node:8][offset:32]`, 0 = null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VolatilePagePointer(u64);

impl VolatilePagePointer {
    /// The null pointer.
    pub const NULL: VolatilePagePointer = VolatilePagePointer(0);

    /// Build from node id and pool offset. Offset 0 is reserved, so a
    /// non-null pointer always has a nonzero word.
    pub fn new(node: u8, offset: u32) -> VolatilePagePointer {
        debug_assert!(offset != 0);
        VolatilePagePointer(((node as u64) << 32) | offset as u64)
    }

    /// Reconstruct from the raw word.
    pub const fn from_raw(raw: u64) -> VolatilePagePointer {
        VolatilePagePointer(raw)
    }

    /// Raw word.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Whether this is the null pointer.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// NUMA node owning the page.
    pub fn node(&self) -> u8 {
        (self.0 >> 32) as u8
    }

    /// Offset within the node's pool.
    pub fn offset(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for VolatilePagePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "VolatilePagePointer(null)")
        } else {
            write!(
                f,
                "VolatilePagePointer(node={}, offset={})",
                self.node(),
                self.offset()
            )
        }
    }
}

/// Pointer to a page in a snapshot file:
/// `[snapshot_id:16][node:8][page_index:40]`, 0 = null.
///
/// Page index 0 of every snapshot file is its header page, so a data-page
/// pointer is never all-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SnapshotPagePointer(u64);

impl SnapshotPagePointer {
    /// The null pointer.
    pub const NULL: SnapshotPagePointer = SnapshotPagePointer(0);

    /// Build from snapshot id, node, and page index within the file.
    pub fn new(snapshot_id: u16, node: u8, page_index: u64) -> SnapshotPagePointer {
        debug_assert!(page_index != 0 && page_index < (1 << 40));
        SnapshotPagePointer(
            ((snapshot_id as u64) << 48) | ((node as u64) << 40) | page_index,
        )
    }

    /// Reconstruct from the raw word.
    pub const fn from_raw(raw: u64) -> SnapshotPagePointer {
        SnapshotPagePointer(raw)
    }

    /// Raw word.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Whether this is the null pointer.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Snapshot the page belongs to.
    pub fn snapshot_id(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Node whose snapshot file holds the page.
    pub fn node(&self) -> u8 {
        (self.0 >> 40) as u8
    }

    /// Page index within the snapshot file.
    pub fn page_index(&self) -> u64 {
        self.0 & ((1 << 40) - 1)
    }
}

impl fmt::Debug for SnapshotPagePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "SnapshotPagePointer(null)")
        } else {
            write!(
                f,
                "SnapshotPagePointer(snapshot={}, node={}, index={})",
                self.snapshot_id(),
                self.node(),
                self.page_index()
            )
        }
    }
}

/// The two homes of one logical page.
///
/// `repr(C)`: instances are also laid out inside page data regions (array
/// root pages), so the two words' order is part of the page format.
#[derive(Debug, Default)]
#[repr(C)]
pub struct DualPagePointer {
    volatile: AtomicU64,
    snapshot: AtomicU64,
}

impl DualPagePointer {
    /// Both sides null.
    pub fn new() -> DualPagePointer {
        DualPagePointer {
            volatile: AtomicU64::new(0),
            snapshot: AtomicU64::new(0),
        }
    }

    /// Acquire-load the volatile side.
    pub fn volatile_pointer(&self) -> VolatilePagePointer {
        VolatilePagePointer::from_raw(self.volatile.load(Ordering::Acquire))
    }

    /// Acquire-load the snapshot side.
    pub fn snapshot_pointer(&self) -> SnapshotPagePointer {
        SnapshotPagePointer::from_raw(self.snapshot.load(Ordering::Acquire))
    }

    /// Install a volatile page where none existed. On failure the winner's
    /// pointer is returned and the caller must release its own page.
    pub fn try_install_volatile(
        &self,
        pointer: VolatilePagePointer,
    ) -> Result<(), VolatilePagePointer> {
        match self.volatile.compare_exchange(
            0,
            pointer.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(winner) => Err(VolatilePagePointer::from_raw(winner)),
        }
    }

    /// Overwrite the volatile side. Only the snapshot installer (inside
    /// the pause) and storage initialization use this.
    pub fn store_volatile(&self, pointer: VolatilePagePointer) {
        self.volatile.store(pointer.raw(), Ordering::Release);
    }

    /// Swing the snapshot side. Only the snapshot installer writes here.
    pub fn store_snapshot(&self, pointer: SnapshotPagePointer) {
        self.snapshot.store(pointer.raw(), Ordering::Release);
    }
}

/// Header at the front of every page.
///
/// All fields are atomics because pages are shared by every thread; a page
/// is only logically exclusive between pool allocation and pointer
/// installation.
#[derive(Debug)]
#[repr(C)]
pub struct PageHeader {
    storage_id: AtomicU32,
    checksum: AtomicU32,
    page_id: AtomicU64,
    version: PageVersion,
    _pad: [u64; 5],
}

/// One 4 KiB page frame.
///
/// The data region is interior-mutable raw bytes. Safety relies on the
/// engine-wide access protocol, not the type system:
///
/// - mutation happens only (a) between pool allocation and pointer
///   installation, (b) under the page version lock, or (c) on a record
///   payload whose owner lock is held by the committing thread;
/// - optimistic readers sample the owning version word before and after
///   copying bytes and retry on change;
/// - snapshot pages are never mutated after they are read from disk.
#[repr(C, align(4096))]
pub struct Page {
    header: PageHeader,
    data: UnsafeCell<[u8; PAGE_DATA_SIZE]>,
}

// Shared access is governed by the version/lock protocol above.
unsafe impl Sync for Page {}
unsafe impl Send for Page {}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("header", &self.header).finish()
    }
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<Page>() == PAGE_SIZE);

impl Page {
    /// A zeroed, unowned page frame.
    pub fn new() -> Page {
        Page {
            header: PageHeader {
                storage_id: AtomicU32::new(0),
                checksum: AtomicU32::new(0),
                page_id: AtomicU64::new(0),
                version: PageVersion::new(),
                _pad: [0; 5],
            },
            data: UnsafeCell::new([0; PAGE_DATA_SIZE]),
        }
    }

    /// Re-initialize a freshly allocated frame for a storage. The caller
    /// has exclusive access (the page is not yet reachable).
    pub fn init(&self, storage_id: u32, page_id: u64) {
        self.header.storage_id.store(storage_id, Ordering::Relaxed);
        self.header.checksum.store(0, Ordering::Relaxed);
        self.header.page_id.store(page_id, Ordering::Relaxed);
        self.header.version.reset();
        unsafe {
            (*self.data.get()).fill(0);
        }
    }

    /// Storage owning this page.
    pub fn storage_id(&self) -> u32 {
        self.header.storage_id.load(Ordering::Relaxed)
    }

    /// Storage-defined page id (leaf index, chain sequence, ...).
    pub fn page_id(&self) -> u64 {
        self.header.page_id.load(Ordering::Relaxed)
    }

    /// The page version word.
    pub fn version(&self) -> &PageVersion {
        &self.header.version
    }

    /// Stored content checksum (snapshot pages only).
    pub fn checksum(&self) -> u32 {
        self.header.checksum.load(Ordering::Relaxed)
    }

    /// Record a content checksum before the page is written to a snapshot
    /// file.
    pub fn set_checksum(&self, checksum: u32) {
        self.header.checksum.store(checksum, Ordering::Relaxed);
    }

    /// Checksum of the current data region.
    pub fn compute_checksum(&self) -> u32 {
        // Safety: callers checksum pages that are not concurrently mutated
        // (snapshot construction, file load verification).
        let data = unsafe { &*self.data.get() };
        crc32fast::hash(data)
    }

    /// Raw pointer to the data region.
    pub fn data_ptr(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }

    /// Serialize the page image for a snapshot file: header fields in
    /// little-endian, version written as zero (snapshot pages are never
    /// locked), then the data region. The caller guarantees the page is
    /// not concurrently mutated.
    pub fn serialize_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        out[0..4].copy_from_slice(&self.storage_id().to_le_bytes());
        out[4..8].copy_from_slice(&self.checksum().to_le_bytes());
        out[8..16].copy_from_slice(&self.page_id().to_le_bytes());
        out[16..PAGE_HEADER_SIZE].fill(0);
        // Safety: caller guarantees quiescence (snapshot construction).
        out[PAGE_HEADER_SIZE..].copy_from_slice(unsafe { self.data() });
    }

    /// Rebuild this page from a serialized image. The caller has
    /// exclusive access (the page is a fresh buffer).
    pub fn deserialize_from(&self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        self.header.storage_id.store(
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            Ordering::Relaxed,
        );
        self.header.checksum.store(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            Ordering::Relaxed,
        );
        self.header.page_id.store(
            u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            Ordering::Relaxed,
        );
        self.header.version.reset();
        // Safety: exclusive access per the contract above.
        unsafe {
            self.data_mut().copy_from_slice(&bytes[PAGE_HEADER_SIZE..]);
        }
    }

    /// Borrow the data region for reading.
    ///
    /// # Safety
    /// The caller must hold a consistency guarantee for the bytes it reads:
    /// the page is immutable (snapshot), the page lock is held, or the read
    /// is bracketed by version sampling.
    pub unsafe fn data(&self) -> &[u8; PAGE_DATA_SIZE] {
        &*self.data.get()
    }

    /// Borrow the data region for writing.
    ///
    /// # Safety
    /// The caller must have exclusive access to the range it writes: the
    /// page is not yet reachable, the page lock is held, or the written
    /// range is a record payload whose owner lock is held.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut [u8; PAGE_DATA_SIZE] {
        &mut *self.data.get()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_layout_is_fixed() {
        assert_eq!(std::mem::size_of::<Page>(), PAGE_SIZE);
        assert_eq!(std::mem::align_of::<Page>(), PAGE_SIZE);
    }

    #[test]
    fn volatile_pointer_round_trips() {
        let p = VolatilePagePointer::new(3, 77);
        assert_eq!(p.node(), 3);
        assert_eq!(p.offset(), 77);
        assert!(!p.is_null());
        assert!(VolatilePagePointer::NULL.is_null());
    }

    #[test]
    fn snapshot_pointer_round_trips() {
        let p = SnapshotPagePointer::new(9, 2, 12345);
        assert_eq!(p.snapshot_id(), 9);
        assert_eq!(p.node(), 2);
        assert_eq!(p.page_index(), 12345);
        assert!(SnapshotPagePointer::NULL.is_null());
    }

    #[test]
    fn dual_pointer_install_first_wins() {
        let dual = DualPagePointer::new();
        let a = VolatilePagePointer::new(0, 10);
        let b = VolatilePagePointer::new(0, 11);
        assert!(dual.try_install_volatile(a).is_ok());
        assert_eq!(dual.try_install_volatile(b), Err(a));
        assert_eq!(dual.volatile_pointer(), a);
    }

    #[test]
    fn version_lock_bumps_counter() {
        let v = PageVersion::new();
        let before = v.observe();
        v.lock();
        assert!(v.try_observe().is_none());
        v.unlock(true);
        let after = v.observe();
        assert_eq!(after.counter(), before.counter() + 1);
        v.lock();
        v.unlock(false);
        assert_eq!(v.observe().counter(), after.counter());
    }

    #[test]
    fn page_init_resets_content() {
        let page = Page::new();
        unsafe {
            page.data_mut()[0] = 0xAB;
        }
        page.init(7, 42);
        assert_eq!(page.storage_id(), 7);
        assert_eq!(page.page_id(), 42);
        assert_eq!(unsafe { page.data() }[0], 0);
    }
}
