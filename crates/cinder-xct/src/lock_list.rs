//! Per-transaction lock lists.
//!
//! The **current lock list** (CLL) is the set of record locks this
//! transaction holds right now, kept sorted by record address. The
//! **retrospective lock list** (RLL) is advice from the previous abort:
//! the locks the transaction should take up front on its next run so it
//! stops rediscovering the same conflict. On activate, a non-empty RLL is
//! prepopulated into the CLL as intentions; the lock phase then acquires
//! everything in one ascending-address sweep.

use crate::access::RecordAddress;
use cinder_core::ThreadId;

/// Lock state or intention for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// No lock taken (intention not yet realized).
    None,
    /// Shared.
    Read,
    /// Exclusive.
    Write,
}

/// One CLL entry: an intention (`preferred`) and what is actually held
/// (`taken`).
#[derive(Debug, Clone, Copy)]
pub struct LockEntry {
    /// Record to lock.
    pub owner: RecordAddress,
    /// Mode the transaction wants.
    pub preferred: LockMode,
    /// Mode currently held.
    pub taken: LockMode,
}

/// Sorted list of locks held and intended by the running transaction.
#[derive(Debug, Default)]
pub struct CurrentLockList {
    entries: Vec<LockEntry>,
}

impl CurrentLockList {
    /// Empty list.
    pub fn new() -> CurrentLockList {
        CurrentLockList {
            entries: Vec::new(),
        }
    }

    /// Drop all entries. Caller has already released any taken locks.
    pub fn clear(&mut self) {
        debug_assert!(self.entries.iter().all(|e| e.taken == LockMode::None));
        self.entries.clear();
    }

    /// Whether no entries exist.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in address order.
    pub fn entries(&self) -> &[LockEntry] {
        &self.entries
    }

    /// Seed intentions from the previous abort's RLL.
    pub fn prepopulate_from_retrospective(&mut self, rll: &RetrospectiveLockList) {
        debug_assert!(self.entries.is_empty());
        self.entries.extend(rll.entries().iter().map(|e| LockEntry {
            owner: e.owner,
            preferred: e.mode,
            taken: LockMode::None,
        }));
    }

    /// Add or strengthen an intention, keeping address order.
    pub fn get_or_add(&mut self, owner: RecordAddress, preferred: LockMode) -> usize {
        match self.entries.binary_search_by(|e| e.owner.cmp(&owner)) {
            Ok(index) => {
                if self.entries[index].preferred < preferred {
                    self.entries[index].preferred = preferred;
                }
                index
            }
            Err(index) => {
                self.entries.insert(
                    index,
                    LockEntry {
                        owner,
                        preferred,
                        taken: LockMode::None,
                    },
                );
                index
            }
        }
    }

    /// Acquire every intended lock in ascending address order.
    ///
    /// Entries already holding their preferred mode are skipped, so this is
    /// safe to call after a partial acquisition.
    pub fn acquire_all(&mut self, thread_id: ThreadId) {
        for entry in &mut self.entries {
            if entry.taken == entry.preferred {
                continue;
            }
            debug_assert_eq!(entry.taken, LockMode::None);
            match entry.preferred {
                LockMode::Write => entry.owner.as_ref().write_lock(thread_id),
                LockMode::Read => entry.owner.as_ref().read_lock(),
                LockMode::None => continue,
            }
            entry.taken = entry.preferred;
        }
    }

    /// Release every taken lock in reverse (descending address) order.
    pub fn release_all(&mut self) {
        for entry in self.entries.iter_mut().rev() {
            match entry.taken {
                LockMode::Write => entry.owner.as_ref().write_unlock(),
                LockMode::Read => entry.owner.as_ref().read_unlock(),
                LockMode::None => {}
            }
            entry.taken = LockMode::None;
        }
    }

    /// Debug check: entries strictly ascending by address.
    pub fn assert_sorted(&self) {
        debug_assert!(self
            .entries
            .windows(2)
            .all(|pair| pair[0].owner < pair[1].owner));
    }
}

/// One RLL entry.
#[derive(Debug, Clone, Copy)]
pub struct RetrospectiveEntry {
    /// Record to pre-lock next time.
    pub owner: RecordAddress,
    /// Mode to take it in.
    pub mode: LockMode,
}

/// Lock advice carried across an abort-retry boundary.
#[derive(Debug, Default)]
pub struct RetrospectiveLockList {
    entries: Vec<RetrospectiveEntry>,
}

impl RetrospectiveLockList {
    /// Empty list.
    pub fn new() -> RetrospectiveLockList {
        RetrospectiveLockList {
            entries: Vec::new(),
        }
    }

    /// Whether no advice is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in address order.
    pub fn entries(&self) -> &[RetrospectiveEntry] {
        &self.entries
    }

    /// Forget the advice (after a successful commit).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Rebuild from the aborted attempt: every write-set record in write
    /// mode, plus the records whose validation failed in read mode.
    /// Deduplicated and sorted by address; write beats read on ties.
    pub fn construct(
        &mut self,
        write_owners: impl Iterator<Item = RecordAddress>,
        failed_read_owners: impl Iterator<Item = RecordAddress>,
    ) {
        self.entries.clear();
        self.entries.extend(write_owners.map(|owner| RetrospectiveEntry {
            owner,
            mode: LockMode::Write,
        }));
        self.entries
            .extend(failed_read_owners.map(|owner| RetrospectiveEntry {
                owner,
                mode: LockMode::Read,
            }));
        // Sort write-before-read within one address so dedup keeps write.
        self.entries
            .sort_by(|a, b| a.owner.cmp(&b.owner).then(b.mode.cmp(&a.mode)));
        self.entries.dedup_by_key(|e| e.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::xct_id::RwLockableXctId;

    #[test]
    fn cll_keeps_address_order_and_dedupes() {
        let words = [
            RwLockableXctId::new(),
            RwLockableXctId::new(),
            RwLockableXctId::new(),
        ];
        let mut cll = CurrentLockList::new();
        cll.get_or_add(RecordAddress::new(&words[2]), LockMode::Write);
        cll.get_or_add(RecordAddress::new(&words[0]), LockMode::Read);
        cll.get_or_add(RecordAddress::new(&words[1]), LockMode::Write);
        // Same record again: strengthened, not duplicated.
        cll.get_or_add(RecordAddress::new(&words[0]), LockMode::Write);

        assert_eq!(cll.entries().len(), 3);
        cll.assert_sorted();
        assert_eq!(cll.entries()[0].preferred, LockMode::Write);
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let words = [RwLockableXctId::new(), RwLockableXctId::new()];
        let mut cll = CurrentLockList::new();
        cll.get_or_add(RecordAddress::new(&words[0]), LockMode::Write);
        cll.get_or_add(RecordAddress::new(&words[1]), LockMode::Read);

        cll.acquire_all(7);
        assert!(words[0].is_write_locked());
        assert_eq!(words[1].reader_count(), 1);

        cll.release_all();
        assert!(!words[0].is_write_locked());
        assert_eq!(words[1].reader_count(), 0);
        cll.clear();
        assert!(cll.is_empty());
    }

    #[test]
    fn rll_dedupes_with_write_priority() {
        let words = [RwLockableXctId::new(), RwLockableXctId::new()];
        let a = RecordAddress::new(&words[0]);
        let b = RecordAddress::new(&words[1]);

        let mut rll = RetrospectiveLockList::new();
        rll.construct([a].into_iter(), [a, b].into_iter());
        assert_eq!(rll.entries().len(), 2);
        let a_entry = rll.entries().iter().find(|e| e.owner == a).unwrap();
        assert_eq!(a_entry.mode, LockMode::Write);
        let b_entry = rll.entries().iter().find(|e| e.owner == b).unwrap();
        assert_eq!(b_entry.mode, LockMode::Read);
    }

    #[test]
    fn prepopulation_carries_modes() {
        let words = [RwLockableXctId::new()];
        let a = RecordAddress::new(&words[0]);
        let mut rll = RetrospectiveLockList::new();
        rll.construct([a].into_iter(), std::iter::empty());

        let mut cll = CurrentLockList::new();
        cll.prepopulate_from_retrospective(&rll);
        assert_eq!(cll.entries().len(), 1);
        assert_eq!(cll.entries()[0].preferred, LockMode::Write);
        assert_eq!(cll.entries()[0].taken, LockMode::None);
    }
}
