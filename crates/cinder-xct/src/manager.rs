//! Transaction manager: begin/precommit/abort, the epoch clock, and the
//! snapshot pause barrier.
//!
//! ## Commit sequence (precommit)
//!
//! ```text
//! 1. Lock:    write set sorted + deduplicated by record address, then
//!               every intended lock (write set ∪ retrospective advice)
//!               taken in one ascending sweep.
//! 2. Epoch:   read the global current epoch; this is the commit epoch.
//! 3. Verify:  read set (serial words), pointer set, page-version set.
//!               Any mismatch releases the locks and aborts with RaceAbort.
//! 4. Issue:   new id = max(last issued, max observed) + 1, bumped into
//!               the commit epoch; ordinal overflow advances the epoch.
//! 5. Publish: per write: mark being_written, apply the redo to the
//!               record payload, store the new id (release), append the
//!               stamped redo record to the thread's log buffer. Lock-free
//!               writes stamp their pre-reserved slots and append.
//! 6. Unlock:  reverse order.
//! 7. Return the commit epoch; durability is the log manager's
//!               `wait_until_durable` on that epoch.
//! ```
//!
//! A transaction that is active when any step fails is deactivated before
//! the error returns; callers never observe a half-active transaction.
//!
//! ## Pause barrier
//!
//! A rundown latch: `begin_xct` enters the shared side and holds it until
//! commit or abort; the snapshot installer's `pause_transactions` sets the
//! pause flag and waits for the shared side to drain. Begins issued while
//! paused block; precommits and aborts never block here (they already hold
//! the shared side).

use crate::access::RecordAddress;
use crate::lock_list::LockMode;
use crate::xct::{IsolationLevel, Xct};
use cinder_core::error::{CodeResult, ErrorCode, ErrorStack, StackResult};
use cinder_core::log::{ArrayOverwriteRedo, RedoHeader, RedoKind, ThreadLogBuffer};
use cinder_core::xct_id::XctId;
use cinder_core::{AtomicEpoch, Epoch, StorageId, XctOptions};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Resolves a record whose physical home moved between write-set insertion
/// and lock acquisition. Returns the new address, or `None` to abort the
/// transaction.
pub trait MovedRecordResolver: Send + Sync {
    /// Track one moved record.
    fn track_moved(&self, storage_id: StorageId, owner: RecordAddress)
        -> Option<RecordAddress>;
}

#[derive(Debug, Default)]
struct LatchState {
    active: usize,
    /// Count of pausers (the installer and the durability flush may
    /// overlap); begins stay blocked until it reaches zero.
    pausers: usize,
}

/// The transaction manager. One per engine, shared by every thread.
pub struct XctManager {
    options: XctOptions,
    current_epoch: AtomicEpoch,
    epoch_mutex: Mutex<()>,
    epoch_cond: Condvar,

    latch: Mutex<LatchState>,
    begin_cond: Condvar,
    drain_cond: Condvar,

    resolver: RwLock<Option<Arc<dyn MovedRecordResolver>>>,

    chime: Mutex<Option<std::thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl XctManager {
    /// Build a manager whose clock starts at `initial_current` (grace is
    /// one less). A fresh engine starts at epoch 2 so the grace epoch is
    /// already valid; a restarted engine resumes above its last snapshot.
    pub fn new(options: XctOptions, initial_current: Epoch) -> XctManager {
        debug_assert!(initial_current.is_valid());
        debug_assert!(initial_current.one_less().is_valid());
        XctManager {
            options,
            current_epoch: AtomicEpoch::new(initial_current),
            epoch_mutex: Mutex::new(()),
            epoch_cond: Condvar::new(),
            latch: Mutex::new(LatchState::default()),
            begin_cond: Condvar::new(),
            drain_cond: Condvar::new(),
            resolver: RwLock::new(None),
            chime: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Transaction tunables this manager was built with.
    pub fn options(&self) -> &XctOptions {
        &self.options
    }

    /// Wire the moved-record resolver (the storage registry).
    pub fn set_moved_resolver(&self, resolver: Arc<dyn MovedRecordResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    // === Epoch clock ===

    /// The epoch writers currently issue into.
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch.load()
    }

    /// One grain behind current; safe for snapshot reads.
    pub fn grace_epoch(&self) -> Epoch {
        self.current_epoch.load().one_less()
    }

    /// Advance the clock one grain and wake epoch waiters.
    pub fn advance_epoch(&self) -> Epoch {
        let guard = self.epoch_mutex.lock();
        let next = self.current_epoch.advance();
        drop(guard);
        self.epoch_cond.notify_all();
        trace!(epoch = %next, "epoch advanced");
        next
    }

    /// Block until the current epoch is at or past `epoch`.
    pub fn wait_for_epoch(&self, epoch: Epoch) {
        let mut guard = self.epoch_mutex.lock();
        while self.current_epoch.load().before(epoch) {
            self.epoch_cond.wait(&mut guard);
        }
    }

    /// Start the background chime that drives the time-quantum trigger.
    pub fn start(self: &Arc<Self>) {
        let mut chime = self.chime.lock();
        if chime.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        let manager = Arc::clone(self);
        let stop = Arc::clone(&self.stop);
        let interval = Duration::from_millis(self.options.epoch_advance_interval_ms.max(1));
        let handle = std::thread::Builder::new()
            .name("cinder-epoch-chime".to_string())
            .spawn(move || {
                info!("epoch chime started");
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    manager.advance_epoch();
                }
                info!("epoch chime stopped");
            })
            .expect("failed to spawn epoch chime");
        *chime = Some(handle);
    }

    /// Stop the chime. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.chime.lock().take() {
            let _ = handle.join();
        }
    }

    // === Pause barrier ===

    /// Block new begins and wait for in-flight transactions to finish.
    /// Callers (the snapshot installer, the durability flush) always pair
    /// this with [`XctManager::resume_transactions`]; overlapping pausers
    /// are fine, begins stay blocked until the last one resumes.
    pub fn pause_transactions(&self) {
        let mut state = self.latch.lock();
        state.pausers += 1;
        while state.active > 0 {
            self.drain_cond.wait(&mut state);
        }
        debug!("transactions paused");
    }

    /// Reopen the gate for begins.
    pub fn resume_transactions(&self) {
        let mut state = self.latch.lock();
        debug_assert!(state.pausers > 0);
        state.pausers -= 1;
        let reopened = state.pausers == 0;
        drop(state);
        if reopened {
            self.begin_cond.notify_all();
            debug!("transactions resumed");
        }
    }

    fn latch_enter(&self) {
        let mut state = self.latch.lock();
        while state.pausers > 0 {
            self.begin_cond.wait(&mut state);
        }
        state.active += 1;
    }

    fn latch_exit(&self) {
        let mut state = self.latch.lock();
        debug_assert!(state.active > 0);
        state.active -= 1;
        if state.active == 0 {
            drop(state);
            self.drain_cond.notify_all();
        }
    }

    // === Transaction lifecycle ===

    /// Begin a transaction on the calling thread's [`Xct`].
    pub fn begin_xct(&self, xct: &mut Xct, isolation: IsolationLevel) -> StackResult<()> {
        if xct.is_active() {
            return Err(ErrorStack::new(
                ErrorCode::InvalidXctState,
                "a transaction is already active on this thread",
            ));
        }
        self.latch_enter();
        let begin_epoch = match isolation {
            IsolationLevel::Serializable => self.current_epoch(),
            IsolationLevel::SnapshotRead => self.grace_epoch(),
        };
        xct.activate(isolation, begin_epoch);
        Ok(())
    }

    /// Abort the active transaction, discarding its writes. The write
    /// set's addresses become the retrospective lock list for the retry.
    pub fn abort_xct(&self, xct: &mut Xct) -> StackResult<()> {
        if !xct.is_active() {
            return Err(ErrorStack::new(
                ErrorCode::InvalidXctState,
                "no active transaction to abort",
            ));
        }
        Self::populate_rll(xct, &[]);
        xct.deactivate();
        self.latch_exit();
        Ok(())
    }

    /// Attempt to commit the active transaction. On success returns the
    /// commit epoch; `wait_until_durable` on the log manager turns that
    /// into durability. On a race the transaction is aborted (RLL
    /// populated) and `RaceAbort` returned; the caller retries from
    /// `begin_xct`.
    pub fn precommit_xct(
        &self,
        xct: &mut Xct,
        log_buffer: &ThreadLogBuffer,
    ) -> StackResult<Epoch> {
        if !xct.is_active() {
            return Err(ErrorStack::new(
                ErrorCode::InvalidXctState,
                "no active transaction to commit",
            ));
        }
        xct.assert_related_read_write();

        let result = if xct.is_read_only() {
            self.precommit_read_only(xct)
        } else {
            self.precommit_read_write(xct, log_buffer)
        };

        match result {
            Ok(epoch) => {
                xct.retrospective_lock_list().clear();
                xct.deactivate();
                self.latch_exit();
                Ok(epoch)
            }
            Err(code) => {
                xct.deactivate();
                self.latch_exit();
                Err(ErrorStack::new(code, "precommit failed"))
            }
        }
    }

    fn precommit_read_only(&self, xct: &mut Xct) -> CodeResult<Epoch> {
        let commit_epoch = self.current_epoch();
        if xct.isolation_level() == IsolationLevel::SnapshotRead {
            return Ok(xct.begin_epoch());
        }
        let mut failed = Vec::new();
        if Self::verify_sets(xct, &mut failed) {
            Ok(commit_epoch)
        } else {
            Self::populate_rll(xct, &failed);
            Err(ErrorCode::RaceAbort)
        }
    }

    fn precommit_read_write(
        &self,
        xct: &mut Xct,
        log_buffer: &ThreadLogBuffer,
    ) -> CodeResult<Epoch> {
        if xct.isolation_level() == IsolationLevel::SnapshotRead {
            // Snapshot readers have no commit path for writes.
            return Err(ErrorCode::InvalidXctState);
        }
        let thread_id = xct.thread_id();

        // 1. Lock phase.
        Self::sort_write_set(xct);
        if let Err(code) = self.resolve_moved_records(xct) {
            Self::populate_rll(xct, &[]);
            return Err(code);
        }
        for i in 0..xct.write_set().len() {
            let owner = xct.write_set()[i].owner;
            xct.current_lock_list().get_or_add(owner, LockMode::Write);
        }
        {
            let cll = xct.current_lock_list();
            cll.assert_sorted();
            cll.acquire_all(thread_id);
        }

        // 2. Epoch read.
        let mut commit_epoch = self.current_epoch();

        // 3. Verification.
        let mut failed = Vec::new();
        if !Self::verify_sets(xct, &mut failed) {
            xct.current_lock_list().release_all();
            Self::populate_rll(xct, &failed);
            return Err(ErrorCode::RaceAbort);
        }

        // 4. Id issuance.
        let max_observed = Self::max_observed_id(xct);
        let new_id = self.issue_next_id(xct, max_observed, &mut commit_epoch);
        debug_assert_eq!(new_id.epoch(), commit_epoch);

        // 5. Publish.
        for i in 0..xct.write_set().len() {
            let write = xct.write_set()[i];
            Self::stamp_log_record(xct, write.log_offset, write.log_len, new_id);
            let owner = write.owner.as_ref();
            owner.store_id(new_id.with_being_written(true));
            Self::apply_redo(xct, write.log_offset, write.log_len, write.payload);
            owner.store_id(new_id);
            log_buffer.append(commit_epoch, xct.work_bytes(write.log_offset, write.log_len));
        }
        for i in 0..xct.lock_free_write_set().len() {
            let write = xct.lock_free_write_set()[i];
            Self::stamp_log_record(xct, write.log_offset, write.log_len, new_id);
            // The slot payload was written at reservation time; stamping
            // the id is what makes it visible.
            write.owner.as_ref().store_id(new_id);
            log_buffer.append(commit_epoch, xct.work_bytes(write.log_offset, write.log_len));
        }

        // 6. Unlock, reverse order.
        xct.current_lock_list().release_all();

        xct.remember_issued(new_id);
        Ok(commit_epoch)
    }

    /// Sort the write set by record address (stable, so multiple writes to
    /// one record keep their order), then re-point the read/write links at
    /// the new indices.
    fn sort_write_set(xct: &mut Xct) {
        xct.write_set_mut().sort_by(|a, b| a.owner.cmp(&b.owner));
        let links: Vec<(usize, usize)> = xct
            .write_set()
            .iter()
            .enumerate()
            .filter_map(|(wi, w)| w.related_read.map(|ri| (wi, ri)))
            .collect();
        for (wi, ri) in links {
            xct.read_set_mut()[ri].related_write = Some(wi);
        }
        xct.assert_related_read_write();
    }

    /// Chase moved records before locking. Our shipped storages never move
    /// records, but the contract stays: a set moved bit either resolves to
    /// a new address or aborts the commit.
    fn resolve_moved_records(&self, xct: &mut Xct) -> CodeResult<()> {
        for i in 0..xct.write_set().len() {
            let write = xct.write_set()[i];
            if !write.owner.as_ref().load_id().is_moved() {
                continue;
            }
            let resolver = self.resolver.read();
            let new_owner = resolver
                .as_ref()
                .and_then(|r| r.track_moved(write.storage_id, write.owner));
            match new_owner {
                Some(owner) => {
                    xct.write_set_mut()[i].owner = owner;
                    if let Some(ri) = write.related_read {
                        xct.read_set_mut()[ri].owner = owner;
                    }
                }
                None => return Err(ErrorCode::LockAbort),
            }
        }
        Ok(())
    }

    /// Verify every observation. Returns `true` when all still hold;
    /// otherwise `failed_reads` carries the record addresses whose read
    /// verification failed (pointer and page-version divergence abort
    /// without advice, since they name pages rather than records).
    fn verify_sets(xct: &Xct, failed_reads: &mut Vec<RecordAddress>) -> bool {
        failed_reads.clear();
        for read in xct.read_set() {
            let current = read.owner.as_ref().load_id();
            // Lock state is invisible here (the lock lives in its own
            // word); entries with a related_write are held by this very
            // transaction's writer lock, so only the serial can tell them
            // apart from a racing commit.
            if !current.same_serial(read.observed)
                || (current.is_moved() && read.related_write.is_none())
            {
                failed_reads.push(read.owner);
            }
        }
        if !failed_reads.is_empty() {
            return false;
        }
        for pointer in xct.pointer_set() {
            if pointer.current() != pointer.observed {
                return false;
            }
        }
        for version in xct.page_version_set() {
            match version.current() {
                Some(status) if status == version.observed => {}
                _ => return false,
            }
        }
        true
    }

    /// Largest id this transaction depends on: every observed reader-side
    /// id plus the current id of every locked record.
    fn max_observed_id(xct: &Xct) -> XctId {
        let mut max = XctId::NULL;
        for read in xct.read_set() {
            if max.is_before_serial(read.observed) {
                max = read.observed;
            }
        }
        for write in xct.write_set() {
            let current = write.owner.as_ref().load_id();
            if max.is_before_serial(current) {
                max = current;
            }
        }
        max
    }

    /// Issue the commit id per the ordering rules: strictly above the
    /// thread's previous id and everything observed, inside the commit
    /// epoch, ordinal > 0. Ordinal exhaustion advances the global epoch
    /// and issues ordinal 1 there.
    fn issue_next_id(
        &self,
        xct: &mut Xct,
        max_observed: XctId,
        commit_epoch: &mut Epoch,
    ) -> XctId {
        let mut base = xct.last_issued();
        if base.is_before_serial(max_observed) {
            base = max_observed;
        }
        if !base.is_valid() || base.epoch().before(*commit_epoch) {
            return XctId::new(*commit_epoch, 1);
        }
        // base epoch is the commit epoch or later (a dependency committed
        // while the clock chimed past us); follow it up.
        commit_epoch.store_max(base.epoch());
        if base.ordinal() >= self.options.max_ordinal {
            let advanced = self.advance_epoch();
            debug_assert!(commit_epoch.before(advanced));
            *commit_epoch = advanced;
            XctId::new(*commit_epoch, 1)
        } else {
            XctId::new(*commit_epoch, base.ordinal() + 1)
        }
    }

    /// Write the issued id into a built redo record's header.
    fn stamp_log_record(xct: &mut Xct, log_offset: usize, log_len: usize, id: XctId) {
        let bytes = xct.work_bytes_mut(log_offset, log_len);
        bytes[8..16].copy_from_slice(&id.raw().to_le_bytes());
    }

    /// Apply one built redo record to its record payload.
    fn apply_redo(xct: &Xct, log_offset: usize, log_len: usize, payload: *mut u8) {
        let bytes = xct.work_bytes(log_offset, log_len);
        let header = RedoHeader::decode(bytes).expect("self-built redo record");
        match header.kind {
            RedoKind::ArrayOverwrite => {
                let redo = ArrayOverwriteRedo::decode(
                    &bytes[cinder_core::log::RECORD_HEADER_SIZE..],
                )
                .expect("self-built redo record");
                // Safety: `payload` points at this record's payload region
                // and the storage validated offset+len against the payload
                // size when it built the record; the writer lock is held.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        redo.bytes.as_ptr(),
                        payload.add(redo.payload_offset as usize),
                        redo.bytes.len(),
                    );
                }
            }
            RedoKind::SequentialAppend => {
                // Payload already sits in the reserved slot.
            }
            RedoKind::EpochMark | RedoKind::Filler => {
                unreachable!("marks are never in a write set")
            }
        }
    }

    fn populate_rll(xct: &mut Xct, failed_reads: &[RecordAddress]) {
        let writes: Vec<RecordAddress> = xct.write_set().iter().map(|w| w.owner).collect();
        xct.retrospective_lock_list()
            .construct(writes.into_iter(), failed_reads.iter().copied());
    }
}

impl Drop for XctManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_manager() -> XctManager {
        XctManager::new(XctOptions::for_testing(), Epoch::from_raw(2))
    }

    #[test]
    fn clock_starts_with_a_valid_grace_epoch() {
        let manager = test_manager();
        assert_eq!(manager.current_epoch(), Epoch::from_raw(2));
        assert_eq!(manager.grace_epoch(), Epoch::from_raw(1));
        assert_eq!(manager.advance_epoch(), Epoch::from_raw(3));
        assert_eq!(manager.grace_epoch(), Epoch::from_raw(2));
    }

    #[test]
    fn wait_for_epoch_wakes_on_advance() {
        let manager = Arc::new(test_manager());
        let waiter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager.wait_for_epoch(Epoch::from_raw(4));
                manager.current_epoch()
            })
        };
        while manager.current_epoch().before(Epoch::from_raw(4)) {
            manager.advance_epoch();
        }
        assert!(!waiter.join().unwrap().before(Epoch::from_raw(4)));
    }

    #[test]
    fn begin_requires_an_inactive_xct() {
        let manager = test_manager();
        let mut xct = Xct::new(0, manager.options());
        manager.begin_xct(&mut xct, IsolationLevel::Serializable).unwrap();
        let err = manager
            .begin_xct(&mut xct, IsolationLevel::Serializable)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidXctState);
        manager.abort_xct(&mut xct).unwrap();
        assert!(!xct.is_active());
        assert_eq!(
            manager.abort_xct(&mut xct).unwrap_err().code,
            ErrorCode::InvalidXctState
        );
    }

    #[test]
    fn snapshot_read_begins_at_the_grace_epoch() {
        let manager = test_manager();
        let mut xct = Xct::new(0, manager.options());
        manager
            .begin_xct(&mut xct, IsolationLevel::SnapshotRead)
            .unwrap();
        assert_eq!(xct.begin_epoch(), manager.grace_epoch());
        let buffer = ThreadLogBuffer::new(0, 0);
        let epoch = manager.precommit_xct(&mut xct, &buffer).unwrap();
        assert_eq!(epoch, manager.grace_epoch());
    }

    #[test]
    fn read_only_precommit_returns_the_current_epoch() {
        let manager = test_manager();
        let mut xct = Xct::new(0, manager.options());
        let buffer = ThreadLogBuffer::new(0, 0);
        manager.begin_xct(&mut xct, IsolationLevel::Serializable).unwrap();
        let epoch = manager.precommit_xct(&mut xct, &buffer).unwrap();
        assert_eq!(epoch, manager.current_epoch());
        assert!(!xct.is_active());
        assert!(buffer.is_empty());
    }

    #[test]
    fn pause_blocks_new_begins_until_resume() {
        let manager = Arc::new(test_manager());
        manager.pause_transactions();

        let begun = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let mut xct = Xct::new(1, manager.options());
                let started = Instant::now();
                manager.begin_xct(&mut xct, IsolationLevel::Serializable).unwrap();
                let waited = started.elapsed();
                manager.abort_xct(&mut xct).unwrap();
                waited
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        manager.resume_transactions();
        let waited = begun.join().unwrap();
        assert!(waited >= Duration::from_millis(40), "begin did not block");
    }

    #[test]
    fn pause_waits_for_inflight_transactions() {
        let manager = Arc::new(test_manager());
        let mut xct = Xct::new(0, manager.options());
        manager.begin_xct(&mut xct, IsolationLevel::Serializable).unwrap();

        let pauser = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let started = Instant::now();
                manager.pause_transactions();
                let waited = started.elapsed();
                manager.resume_transactions();
                waited
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        manager.abort_xct(&mut xct).unwrap();
        let waited = pauser.join().unwrap();
        assert!(waited >= Duration::from_millis(40), "pause did not drain");
    }
}
