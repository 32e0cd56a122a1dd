//! Transaction version words and the record lock embedded next to them.
//!
//! [`XctId`] is one 64-bit word:
//!
//! ```text
//! ┌───────────────┬──────────────┬───────────────┬─────────────┐
//! │ epoch (28)    │ status (8)   │ ordinal (24)  │ reserved (4)│
//! │ bits 36..64   │ bits 28..36  │ bits 4..28    │ bits 0..4   │
//! └───────────────┴──────────────┴───────────────┴─────────────┘
//! ```
//!
//! Serial order between committed transactions is `(epoch, ordinal)`
//! lexicographic; the status bits (`deleted`, `moved`, `being_written`) are
//! masked out of that comparison.
//!
//! [`RwLockableXctId`] is the full 128-bit version word that lives in front
//! of every record payload: the id word plus a reader/writer lock word.
//! The two words stay adjacent in one aligned struct so a reader samples
//! version and lock state from the same cache line; they are never split
//! apart. Lock transitions use sequentially-consistent RMW (the commit
//! lock phase); id publication uses a release store paired with acquire
//! loads in readers.

use crate::epoch::Epoch;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const EPOCH_SHIFT: u32 = 36;
const ORDINAL_SHIFT: u32 = 4;
const ORDINAL_MASK: u64 = 0xFF_FFFF << ORDINAL_SHIFT;
const EPOCH_MASK: u64 = 0xFFF_FFFF << EPOCH_SHIFT;
const SERIAL_MASK: u64 = EPOCH_MASK | ORDINAL_MASK;

const DELETED_BIT: u64 = 1 << 28;
const MOVED_BIT: u64 = 1 << 29;
const BEING_WRITTEN_BIT: u64 = 1 << 30;

/// Largest ordinal representable in the 24-bit field.
pub const MAX_ORDINAL: u32 = 0xFF_FFFF;

/// A transaction id: the serial (epoch, ordinal) pair plus status bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct XctId(u64);

impl XctId {
    /// The all-zero id: invalid epoch, ordinal 0. This is the initial
    /// owner id of a never-written record.
    pub const NULL: XctId = XctId(0);

    /// Build a serial id with clear status bits.
    pub fn new(epoch: Epoch, ordinal: u32) -> XctId {
        debug_assert!(ordinal <= MAX_ORDINAL);
        XctId(
            ((epoch.raw() as u64) << EPOCH_SHIFT)
                | (((ordinal & MAX_ORDINAL) as u64) << ORDINAL_SHIFT),
        )
    }

    /// Reconstruct from the raw word (log records, snapshots).
    pub const fn from_raw(raw: u64) -> XctId {
        XctId(raw)
    }

    /// The raw 64-bit word.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Epoch component.
    pub fn epoch(&self) -> Epoch {
        Epoch::from_raw(((self.0 & EPOCH_MASK) >> EPOCH_SHIFT) as u32)
    }

    /// Ordinal component.
    pub fn ordinal(&self) -> u32 {
        ((self.0 & ORDINAL_MASK) >> ORDINAL_SHIFT) as u32
    }

    /// This id with a different epoch, ordinal reset to the given value.
    pub fn with_serial(&self, epoch: Epoch, ordinal: u32) -> XctId {
        debug_assert!(ordinal <= MAX_ORDINAL);
        XctId(
            (self.0 & !SERIAL_MASK)
                | ((epoch.raw() as u64) << EPOCH_SHIFT)
                | (((ordinal & MAX_ORDINAL) as u64) << ORDINAL_SHIFT),
        )
    }

    /// The serial word: this id with status and reserved bits cleared.
    /// Commit validation compares serial words, not raw words.
    pub fn serial_word(&self) -> u64 {
        self.0 & SERIAL_MASK
    }

    /// Whether the two ids are the same committed version.
    pub fn same_serial(&self, other: XctId) -> bool {
        self.serial_word() == other.serial_word()
    }

    /// Strict serial order: epoch first (wrap-aware), then ordinal.
    pub fn is_before_serial(&self, other: XctId) -> bool {
        let (se, oe) = (self.epoch(), other.epoch());
        if !se.is_valid() {
            // A never-written record precedes every committed id.
            return oe.is_valid();
        }
        if !oe.is_valid() {
            return false;
        }
        if se == oe {
            self.ordinal() < other.ordinal()
        } else {
            se.before(oe)
        }
    }

    /// Whether the id carries a valid (committed) serial.
    pub fn is_valid(&self) -> bool {
        self.epoch().is_valid()
    }

    /// Deleted-record status bit.
    pub fn is_deleted(&self) -> bool {
        self.0 & DELETED_BIT != 0
    }

    /// Set or clear the deleted bit.
    pub fn with_deleted(&self, deleted: bool) -> XctId {
        if deleted {
            XctId(self.0 | DELETED_BIT)
        } else {
            XctId(self.0 & !DELETED_BIT)
        }
    }

    /// Moved-record status bit (the physical home migrated; resolve via
    /// the storage's moved-record tracker).
    pub fn is_moved(&self) -> bool {
        self.0 & MOVED_BIT != 0
    }

    /// Set the moved bit.
    pub fn with_moved(&self) -> XctId {
        XctId(self.0 | MOVED_BIT)
    }

    /// Mid-publication marker: the payload next to this id is being
    /// rewritten and must not be trusted.
    pub fn is_being_written(&self) -> bool {
        self.0 & BEING_WRITTEN_BIT != 0
    }

    /// Set or clear the being-written bit.
    pub fn with_being_written(&self, on: bool) -> XctId {
        if on {
            XctId(self.0 | BEING_WRITTEN_BIT)
        } else {
            XctId(self.0 & !BEING_WRITTEN_BIT)
        }
    }
}

impl fmt::Debug for XctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "XctId(epoch={}, ordinal={}{}{}{})",
            self.epoch(),
            self.ordinal(),
            if self.is_deleted() { ", deleted" } else { "" },
            if self.is_moved() { ", moved" } else { "" },
            if self.is_being_written() {
                ", being_written"
            } else {
                ""
            },
        )
    }
}

// Lock word layout.
const WRITER_BIT: u64 = 1 << 63;
const READER_UNIT: u64 = 1 << 48;
const READERS_MASK: u64 = 0x7FFF << 48;
const TAIL_THREAD_SHIFT: u32 = 32;
const TAIL_THREAD_MASK: u64 = 0xFFFF << TAIL_THREAD_SHIFT;

/// How many spins before a waiter yields the core.
const SPINS_BEFORE_YIELD: u32 = 64;

/// The 128-bit record version word: id + reader/writer lock.
///
/// One of these sits in front of every record payload. It is shared by all
/// transactions; the commit protocol is the only writer of the id word, and
/// it only writes while holding the writer side of the lock word.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct RwLockableXctId {
    id: AtomicU64,
    lock: AtomicU64,
}

impl RwLockableXctId {
    /// A fresh version word: null id, unlocked.
    pub fn new() -> RwLockableXctId {
        RwLockableXctId {
            id: AtomicU64::new(0),
            lock: AtomicU64::new(0),
        }
    }

    /// Acquire-load the id word.
    pub fn load_id(&self) -> XctId {
        XctId::from_raw(self.id.load(Ordering::Acquire))
    }

    /// Release-store the id word. Caller holds the writer lock (or has
    /// exclusive access during initialization).
    pub fn store_id(&self, id: XctId) {
        self.id.store(id.raw(), Ordering::Release);
    }

    /// One CAS attempt at the writer lock.
    pub fn try_write_lock(&self, thread_id: u16) -> bool {
        let observed = self.lock.load(Ordering::SeqCst);
        if observed & (WRITER_BIT | READERS_MASK) != 0 {
            return false;
        }
        let desired = WRITER_BIT | ((thread_id as u64) << TAIL_THREAD_SHIFT);
        self.lock
            .compare_exchange(observed, desired, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Spin until the writer lock is held.
    ///
    /// Callers acquire record locks in ascending address order, which is
    /// what makes unbounded spinning here deadlock-free.
    pub fn write_lock(&self, thread_id: u16) {
        let mut spins = 0u32;
        loop {
            if self.try_write_lock(thread_id) {
                return;
            }
            // Leave our thread id as the tail waiter, for diagnostics.
            let observed = self.lock.load(Ordering::Relaxed);
            let tagged =
                (observed & !TAIL_THREAD_MASK) | ((thread_id as u64) << TAIL_THREAD_SHIFT);
            let _ = self.lock.compare_exchange_weak(
                observed,
                tagged,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            spins += 1;
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Release the writer lock.
    pub fn write_unlock(&self) {
        self.lock.fetch_and(!WRITER_BIT, Ordering::SeqCst);
    }

    /// Acquire a shared (reader) slot.
    pub fn read_lock(&self) {
        let mut spins = 0u32;
        loop {
            let observed = self.lock.load(Ordering::SeqCst);
            if observed & WRITER_BIT == 0 {
                debug_assert!(observed & READERS_MASK != READERS_MASK);
                if self
                    .lock
                    .compare_exchange_weak(
                        observed,
                        observed + READER_UNIT,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    return;
                }
            }
            spins += 1;
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Release a shared slot.
    pub fn read_unlock(&self) {
        let prev = self.lock.fetch_sub(READER_UNIT, Ordering::SeqCst);
        debug_assert!(prev & READERS_MASK != 0);
    }

    /// Whether a writer currently holds this record.
    pub fn is_write_locked(&self) -> bool {
        self.lock.load(Ordering::SeqCst) & WRITER_BIT != 0
    }

    /// Current shared-holder count.
    pub fn reader_count(&self) -> u16 {
        ((self.lock.load(Ordering::SeqCst) & READERS_MASK) >> 48) as u16
    }

    /// The most recent waiter's thread id, for diagnostics.
    pub fn tail_thread(&self) -> u16 {
        ((self.lock.load(Ordering::Relaxed) & TAIL_THREAD_MASK) >> TAIL_THREAD_SHIFT) as u16
    }
}

impl Default for RwLockableXctId {
    fn default() -> Self {
        Self::new()
    }
}
