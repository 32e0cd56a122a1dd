//! Observation records accumulated by a running transaction.
//!
//! Each entry remembers an *address* (a location shared with other
//! transactions) and the value observed there, so precommit can verify the
//! observation still holds. Addresses are raw pointers into pool frames;
//! frames live in preallocated arenas owned by the engine and never move,
//! so the pointers stay valid for as long as the engine does. A
//! transaction clears its sets on activate and deactivate, so no entry
//! outlives its engine.
//!
//! Lock-order discipline is by address: the write set is sorted by
//! [`RecordAddress`] before the lock phase, which is what makes lock
//! acquisition cycle-free.

use cinder_core::page::{DualPagePointer, PageVersion, PageVersionStatus, VolatilePagePointer};
use cinder_core::xct_id::{RwLockableXctId, XctId};
use cinder_core::StorageId;
use std::ptr::NonNull;

/// Stable address of a record's version word.
///
/// Ordering compares the pointer value; that order is total across all
/// records in all pools and is the engine's global lock order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RecordAddress(NonNull<RwLockableXctId>);

// Record version words are shared atomics; the address itself is freely
// movable across threads.
unsafe impl Send for RecordAddress {}
unsafe impl Sync for RecordAddress {}

impl RecordAddress {
    /// Wrap a reference to a version word living in a pool frame.
    pub fn new(owner: &RwLockableXctId) -> RecordAddress {
        RecordAddress(NonNull::from(owner))
    }

    /// Borrow the version word.
    pub fn as_ref(&self) -> &RwLockableXctId {
        // Safety: the pointee lives in an engine-owned arena that outlives
        // every transaction (sets are cleared on deactivate).
        unsafe { self.0.as_ref() }
    }

    /// The raw address, for diagnostics.
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// One tracked read.
#[derive(Debug, Clone, Copy)]
pub struct ReadAccess {
    /// Storage the record belongs to.
    pub storage_id: StorageId,
    /// Version word observed.
    pub owner: RecordAddress,
    /// Id sampled before the payload was read.
    pub observed: XctId,
    /// Index of this transaction's own write to the same record, if any.
    /// Validation excuses lock-state differences on such entries.
    pub related_write: Option<usize>,
}

/// One tracked write.
#[derive(Debug, Clone, Copy)]
pub struct WriteAccess {
    /// Storage the record belongs to.
    pub storage_id: StorageId,
    /// Version word to lock and republish.
    pub owner: RecordAddress,
    /// Start of the record payload this write lands in.
    pub payload: *mut u8,
    /// Redo record location in the transaction's local work memory.
    pub log_offset: usize,
    /// Redo record length.
    pub log_len: usize,
    /// Index of this transaction's own read of the same record, if any.
    pub related_read: Option<usize>,
}

unsafe impl Send for WriteAccess {}

/// One lock-free write (sequential storages). The slot was reserved at
/// operation time with a null owner id; publish stamps the commit id, and
/// an aborted reservation simply stays null and invisible.
#[derive(Debug, Clone, Copy)]
pub struct LockFreeWriteAccess {
    /// Storage the record belongs to.
    pub storage_id: StorageId,
    /// Reserved slot's version word.
    pub owner: RecordAddress,
    /// Redo record location in local work memory.
    pub log_offset: usize,
    /// Redo record length.
    pub log_len: usize,
}

/// One observed volatile-pointer value.
///
/// Recorded when a reader follows a pointer another thread may swing: a
/// null volatile side it fell through to the snapshot side of, or a root
/// pointer a storage swings RCU-style.
#[derive(Debug, Clone, Copy)]
pub struct PointerAccess {
    /// Address of the dual pointer.
    pub address: NonNull<DualPagePointer>,
    /// Volatile word observed at read time.
    pub observed: VolatilePagePointer,
}

unsafe impl Send for PointerAccess {}

impl PointerAccess {
    /// Re-read the volatile side at the observed address.
    pub fn current(&self) -> VolatilePagePointer {
        // Safety: dual pointers live inside pool frames; see module docs.
        unsafe { self.address.as_ref() }.volatile_pointer()
    }
}

/// One observed page-version status (structural read).
#[derive(Debug, Clone, Copy)]
pub struct PageVersionAccess {
    /// Address of the page's version word.
    pub address: NonNull<PageVersion>,
    /// Status sampled at read time.
    pub observed: PageVersionStatus,
}

unsafe impl Send for PageVersionAccess {}

impl PageVersionAccess {
    /// Re-sample the status; `None` while the page is locked.
    pub fn current(&self) -> Option<PageVersionStatus> {
        // Safety: page version words live in pool frame headers.
        unsafe { self.address.as_ref() }.try_observe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_addresses_order_by_location() {
        let words = [RwLockableXctId::new(), RwLockableXctId::new()];
        let a = RecordAddress::new(&words[0]);
        let b = RecordAddress::new(&words[1]);
        assert!(a < b);
        assert_eq!(a, RecordAddress::new(&words[0]));
    }

    #[test]
    fn pointer_access_sees_swings() {
        let dual = DualPagePointer::new();
        let access = PointerAccess {
            address: NonNull::from(&dual),
            observed: dual.volatile_pointer(),
        };
        assert_eq!(access.current(), access.observed);
        dual.store_volatile(VolatilePagePointer::new(0, 5));
        assert_ne!(access.current(), access.observed);
    }
}
