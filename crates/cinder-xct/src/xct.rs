//! The per-thread transaction object.
//!
//! An [`Xct`] is owned by exactly one thread and reused across
//! transactions: `activate` resets the sets and the local work memory,
//! `deactivate` closes the attempt. All observation sets live here; the
//! commit protocol itself is in the manager.

use crate::access::{
    LockFreeWriteAccess, PageVersionAccess, PointerAccess, ReadAccess, RecordAddress,
    WriteAccess,
};
use crate::lock_list::{CurrentLockList, RetrospectiveLockList};
use cinder_core::error::{CodeResult, ErrorCode};
use cinder_core::page::{DualPagePointer, PageVersion, PageVersionStatus, VolatilePagePointer};
use cinder_core::xct_id::XctId;
use cinder_core::{Epoch, StorageId, ThreadId, XctOptions};
use std::ptr::NonNull;

/// Fixed capacity of the pointer set.
pub const MAX_POINTER_SETS: usize = 1024;
/// Fixed capacity of the page-version set.
pub const MAX_PAGE_VERSION_SETS: usize = 1024;

/// Isolation level of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Full serializability through commit-time verification.
    Serializable,
    /// Read-only view of the grace epoch; observations are not tracked.
    /// Consistent by construction only against data that is no newer than
    /// the grace epoch (snapshot pages, quiesced volatiles).
    SnapshotRead,
}

/// A transaction. One per thread; at most one active attempt at a time.
pub struct Xct {
    thread_id: ThreadId,
    active: bool,
    isolation: IsolationLevel,
    /// Epoch sampled at begin; SnapshotRead reads as of this epoch.
    begin_epoch: Epoch,
    /// Most recently issued id on this thread. Ids are issued at commit,
    /// so mid-transaction this is the previous attempt's id.
    last_issued: XctId,

    read_set: Vec<ReadAccess>,
    write_set: Vec<WriteAccess>,
    lock_free_write_set: Vec<LockFreeWriteAccess>,
    pointer_set: Vec<PointerAccess>,
    page_version_set: Vec<PageVersionAccess>,

    max_read_set_size: usize,
    max_write_set_size: usize,
    max_lock_free_write_set_size: usize,

    current_lock_list: CurrentLockList,
    retrospective_lock_list: RetrospectiveLockList,

    work_memory: Vec<u8>,
    work_cur: usize,
}

impl Xct {
    /// Build a transaction object for one thread.
    pub fn new(thread_id: ThreadId, options: &XctOptions) -> Xct {
        Xct {
            thread_id,
            active: false,
            isolation: IsolationLevel::Serializable,
            begin_epoch: Epoch::INVALID,
            last_issued: XctId::NULL,
            read_set: Vec::new(),
            write_set: Vec::new(),
            lock_free_write_set: Vec::new(),
            pointer_set: Vec::new(),
            page_version_set: Vec::new(),
            max_read_set_size: options.max_read_set_size,
            max_write_set_size: options.max_write_set_size,
            max_lock_free_write_set_size: options.max_lock_free_write_set_size,
            current_lock_list: CurrentLockList::new(),
            retrospective_lock_list: RetrospectiveLockList::new(),
            work_memory: vec![0; options.local_work_memory_kb << 10],
            work_cur: 0,
        }
    }

    /// Begin an attempt. The sets and work memory reset; a non-empty RLL
    /// becomes CLL intentions so the lock phase takes those locks up
    /// front.
    pub fn activate(&mut self, isolation: IsolationLevel, begin_epoch: Epoch) {
        debug_assert!(!self.active);
        self.active = true;
        self.isolation = isolation;
        self.begin_epoch = begin_epoch;
        self.read_set.clear();
        self.write_set.clear();
        self.lock_free_write_set.clear();
        self.pointer_set.clear();
        self.page_version_set.clear();
        self.work_cur = 0;
        self.current_lock_list.clear();
        if !self.retrospective_lock_list.is_empty() {
            // With an RLL we will very likely lock all of them anyway, so
            // make CLL intentions for the whole list at the start.
            self.current_lock_list
                .prepopulate_from_retrospective(&self.retrospective_lock_list);
        }
    }

    /// Close the attempt. All locks must already be released.
    pub fn deactivate(&mut self) {
        debug_assert!(self.active);
        self.current_lock_list.release_all();
        self.current_lock_list.clear();
        self.active = false;
    }

    /// Whether an attempt is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the attempt makes no writes at all.
    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty() && self.lock_free_write_set.is_empty()
    }

    /// Isolation of the running attempt.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// Epoch sampled at begin.
    pub fn begin_epoch(&self) -> Epoch {
        self.begin_epoch
    }

    /// Owning thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Most recently issued id on this thread.
    pub fn last_issued(&self) -> XctId {
        self.last_issued
    }

    /// Record a newly issued id.
    pub fn remember_issued(&mut self, id: XctId) {
        debug_assert!(self.last_issued.is_before_serial(id));
        debug_assert!(id.ordinal() > 0);
        self.last_issued = id;
    }

    // === Observation sets ===

    /// Track a record read. Call BEFORE reading the payload; publishing
    /// the observation first is what makes validation sound.
    pub fn add_to_read_set(
        &mut self,
        storage_id: StorageId,
        observed: XctId,
        owner: RecordAddress,
    ) -> CodeResult<usize> {
        debug_assert!(self.active);
        if self.isolation == IsolationLevel::SnapshotRead {
            // Snapshot reads are consistent by construction; nothing to
            // verify at commit.
            return Ok(usize::MAX);
        }
        if self.read_set.len() >= self.max_read_set_size {
            return Err(ErrorCode::ReadSetOverflow);
        }
        self.read_set.push(ReadAccess {
            storage_id,
            owner,
            observed,
            related_write: None,
        });
        Ok(self.read_set.len() - 1)
    }

    /// Track a record write. The redo record was already built in local
    /// work memory at `[log_offset, log_offset + log_len)`.
    pub fn add_to_write_set(
        &mut self,
        storage_id: StorageId,
        owner: RecordAddress,
        payload: *mut u8,
        log_offset: usize,
        log_len: usize,
    ) -> CodeResult<usize> {
        debug_assert!(self.active);
        if self.write_set.len() >= self.max_write_set_size {
            return Err(ErrorCode::WriteSetOverflow);
        }
        self.write_set.push(WriteAccess {
            storage_id,
            owner,
            payload,
            log_offset,
            log_len,
            related_read: None,
        });
        Ok(self.write_set.len() - 1)
    }

    /// Track a read-modify-write as one linked pair, so validation knows
    /// the record is locked by this very transaction.
    pub fn add_to_read_and_write_set(
        &mut self,
        storage_id: StorageId,
        observed: XctId,
        owner: RecordAddress,
        payload: *mut u8,
        log_offset: usize,
        log_len: usize,
    ) -> CodeResult<()> {
        let write_index =
            self.add_to_write_set(storage_id, owner, payload, log_offset, log_len)?;
        if self.isolation == IsolationLevel::SnapshotRead {
            return Ok(());
        }
        if self.read_set.len() >= self.max_read_set_size {
            return Err(ErrorCode::ReadSetOverflow);
        }
        self.read_set.push(ReadAccess {
            storage_id,
            owner,
            observed,
            related_write: Some(write_index),
        });
        self.write_set[write_index].related_read = Some(self.read_set.len() - 1);
        Ok(())
    }

    /// Cross-link an existing read entry and write entry for the same
    /// record. Accepts the sentinel index returned for untracked
    /// (snapshot-read) observations and does nothing for it.
    pub fn link_read_write(&mut self, read_index: usize, write_index: usize) {
        if read_index == usize::MAX {
            return;
        }
        debug_assert_eq!(self.read_set[read_index].owner, self.write_set[write_index].owner);
        self.read_set[read_index].related_write = Some(write_index);
        self.write_set[write_index].related_read = Some(read_index);
    }

    /// Track a lock-free write to a pre-reserved slot.
    pub fn add_to_lock_free_write_set(
        &mut self,
        storage_id: StorageId,
        owner: RecordAddress,
        log_offset: usize,
        log_len: usize,
    ) -> CodeResult<()> {
        debug_assert!(self.active);
        if self.lock_free_write_set.len() >= self.max_lock_free_write_set_size {
            return Err(ErrorCode::LockFreeWriteSetOverflow);
        }
        self.lock_free_write_set.push(LockFreeWriteAccess {
            storage_id,
            owner,
            log_offset,
            log_len,
        });
        Ok(())
    }

    /// Track a followed volatile pointer that may be swung.
    pub fn add_to_pointer_set(
        &mut self,
        address: &DualPagePointer,
        observed: VolatilePagePointer,
    ) -> CodeResult<()> {
        debug_assert!(self.active);
        if self.isolation == IsolationLevel::SnapshotRead {
            return Ok(());
        }
        let address = NonNull::from(address);
        // The same pointer is commonly followed many times in one
        // transaction; remembering it once is enough.
        if let Some(existing) = self
            .pointer_set
            .iter()
            .find(|entry| entry.address == address)
        {
            if existing.observed == observed {
                return Ok(());
            }
            return Err(ErrorCode::RaceAbort);
        }
        if self.pointer_set.len() >= MAX_POINTER_SETS {
            return Err(ErrorCode::PointerSetOverflow);
        }
        self.pointer_set.push(PointerAccess { address, observed });
        Ok(())
    }

    /// Replace a tracked pointer observation with the value this
    /// transaction itself installed, so the installer does not abort on
    /// its own swing.
    pub fn overwrite_to_pointer_set(
        &mut self,
        address: &DualPagePointer,
        observed: VolatilePagePointer,
    ) {
        let address = NonNull::from(address);
        if let Some(entry) = self
            .pointer_set
            .iter_mut()
            .find(|entry| entry.address == address)
        {
            entry.observed = observed;
        }
    }

    /// Track a structural page-version observation.
    pub fn add_to_page_version_set(
        &mut self,
        version: &PageVersion,
        observed: PageVersionStatus,
    ) -> CodeResult<()> {
        debug_assert!(self.active);
        if self.isolation == IsolationLevel::SnapshotRead {
            return Ok(());
        }
        if self.page_version_set.len() >= MAX_PAGE_VERSION_SETS {
            return Err(ErrorCode::PageVersionSetOverflow);
        }
        self.page_version_set.push(PageVersionAccess {
            address: NonNull::from(version),
            observed,
        });
        Ok(())
    }

    // === Local work memory ===

    /// Reserve `size` bytes (8-aligned) from the per-transaction bump
    /// arena; recycled wholesale on the next activate.
    pub fn acquire_local_work_memory(&mut self, size: usize) -> CodeResult<usize> {
        debug_assert!(self.active);
        let begin = (self.work_cur + 7) & !7;
        let size = (size + 7) & !7;
        if begin + size > self.work_memory.len() {
            return Err(ErrorCode::LocalWorkMemoryFull);
        }
        self.work_cur = begin + size;
        Ok(begin)
    }

    /// Borrow a previously reserved range mutably.
    pub fn work_bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.work_memory[offset..offset + len]
    }

    /// Borrow a previously reserved range.
    pub fn work_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.work_memory[offset..offset + len]
    }

    // === Set accessors (the manager drives the commit protocol) ===

    /// Tracked reads.
    pub fn read_set(&self) -> &[ReadAccess] {
        &self.read_set
    }

    /// Tracked writes.
    pub fn write_set(&self) -> &[WriteAccess] {
        &self.write_set
    }

    /// Tracked writes, mutably (sorting, moved-record fixup).
    pub fn write_set_mut(&mut self) -> &mut Vec<WriteAccess> {
        &mut self.write_set
    }

    /// Tracked reads, mutably (related-write relinking after sort).
    pub fn read_set_mut(&mut self) -> &mut Vec<ReadAccess> {
        &mut self.read_set
    }

    /// Lock-free writes.
    pub fn lock_free_write_set(&self) -> &[LockFreeWriteAccess] {
        &self.lock_free_write_set
    }

    /// Pointer observations.
    pub fn pointer_set(&self) -> &[PointerAccess] {
        &self.pointer_set
    }

    /// Page-version observations.
    pub fn page_version_set(&self) -> &[PageVersionAccess] {
        &self.page_version_set
    }

    /// The current lock list.
    pub fn current_lock_list(&mut self) -> &mut CurrentLockList {
        &mut self.current_lock_list
    }

    /// The retrospective lock list.
    pub fn retrospective_lock_list(&mut self) -> &mut RetrospectiveLockList {
        &mut self.retrospective_lock_list
    }

    /// Debug check of the mutual read/write link invariant:
    /// `r.related_write == w && w.related_read == r` and both sides name
    /// the same record.
    pub fn assert_related_read_write(&self) {
        #[cfg(debug_assertions)]
        {
            for (wi, write) in self.write_set.iter().enumerate() {
                if let Some(ri) = write.related_read {
                    let read = &self.read_set[ri];
                    assert_eq!(read.owner, write.owner);
                    assert_eq!(read.related_write, Some(wi));
                }
            }
            for (ri, read) in self.read_set.iter().enumerate() {
                if let Some(wi) = read.related_write {
                    let write = &self.write_set[wi];
                    assert_eq!(write.owner, read.owner);
                    assert_eq!(write.related_read, Some(ri));
                }
            }
        }
    }
}

// An Xct owns only indices, plain values, and addresses into engine-owned
// arenas; moving it to the thread that will run it is fine.
unsafe impl Send for Xct {}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::xct_id::RwLockableXctId;

    fn test_xct() -> Xct {
        Xct::new(1, &XctOptions::for_testing())
    }

    #[test]
    fn activate_resets_state() {
        let mut xct = test_xct();
        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(2));
        let off = xct.acquire_local_work_memory(100).unwrap();
        xct.work_bytes_mut(off, 100)[0] = 9;
        xct.deactivate();

        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(3));
        assert!(xct.is_active());
        assert!(xct.is_read_only());
        // Arena restarts from the bottom.
        assert_eq!(xct.acquire_local_work_memory(8).unwrap(), 0);
        xct.deactivate();
    }

    #[test]
    fn work_memory_exhaustion_is_reported() {
        let mut options = XctOptions::for_testing();
        options.local_work_memory_kb = 1;
        let mut xct = Xct::new(1, &options);
        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(2));
        assert!(xct.acquire_local_work_memory(1000).is_ok());
        assert_eq!(
            xct.acquire_local_work_memory(100),
            Err(ErrorCode::LocalWorkMemoryFull)
        );
        xct.deactivate();
    }

    #[test]
    fn pointer_set_caps_at_fixed_limit() {
        let mut xct = test_xct();
        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(2));
        let duals: Vec<DualPagePointer> =
            (0..MAX_POINTER_SETS + 1).map(|_| DualPagePointer::new()).collect();
        for dual in duals.iter().take(MAX_POINTER_SETS) {
            xct.add_to_pointer_set(dual, VolatilePagePointer::NULL).unwrap();
        }
        assert_eq!(
            xct.add_to_pointer_set(&duals[MAX_POINTER_SETS], VolatilePagePointer::NULL),
            Err(ErrorCode::PointerSetOverflow)
        );
        xct.deactivate();
    }

    #[test]
    fn page_version_set_caps_at_fixed_limit() {
        let mut xct = test_xct();
        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(2));
        let versions: Vec<PageVersion> =
            (0..MAX_PAGE_VERSION_SETS + 1).map(|_| PageVersion::new()).collect();
        for version in versions.iter().take(MAX_PAGE_VERSION_SETS) {
            xct.add_to_page_version_set(version, version.observe()).unwrap();
        }
        assert_eq!(
            xct.add_to_page_version_set(
                &versions[MAX_PAGE_VERSION_SETS],
                versions[MAX_PAGE_VERSION_SETS].observe()
            ),
            Err(ErrorCode::PageVersionSetOverflow)
        );
        xct.deactivate();
    }

    #[test]
    fn duplicate_pointer_observation_is_collapsed() {
        let mut xct = test_xct();
        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(2));
        let dual = DualPagePointer::new();
        xct.add_to_pointer_set(&dual, VolatilePagePointer::NULL).unwrap();
        xct.add_to_pointer_set(&dual, VolatilePagePointer::NULL).unwrap();
        assert_eq!(xct.pointer_set().len(), 1);
        // Observing a *different* value at the same address is already a
        // lost race.
        assert_eq!(
            xct.add_to_pointer_set(&dual, VolatilePagePointer::new(0, 3)),
            Err(ErrorCode::RaceAbort)
        );
        xct.deactivate();
    }

    #[test]
    fn read_write_links_are_mutual() {
        let mut xct = test_xct();
        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(2));
        let word = RwLockableXctId::new();
        let owner = RecordAddress::new(&word);
        let mut payload = [0u8; 16];
        xct.add_to_read_and_write_set(
            1,
            XctId::NULL,
            owner,
            payload.as_mut_ptr(),
            0,
            0,
        )
        .unwrap();
        xct.assert_related_read_write();
        assert_eq!(xct.read_set().len(), 1);
        assert_eq!(xct.write_set().len(), 1);
        xct.deactivate();
    }

    #[test]
    fn read_set_overflow_uses_dedicated_code() {
        let mut options = XctOptions::for_testing();
        options.max_read_set_size = 2;
        let mut xct = Xct::new(1, &options);
        xct.activate(IsolationLevel::Serializable, Epoch::from_raw(2));
        let words = [
            RwLockableXctId::new(),
            RwLockableXctId::new(),
            RwLockableXctId::new(),
        ];
        for word in words.iter().take(2) {
            xct.add_to_read_set(1, XctId::NULL, RecordAddress::new(word))
                .unwrap();
        }
        assert_eq!(
            xct.add_to_read_set(1, XctId::NULL, RecordAddress::new(&words[2])),
            Err(ErrorCode::ReadSetOverflow)
        );
        xct.deactivate();
    }
}
