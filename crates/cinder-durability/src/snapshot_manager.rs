//! Snapshot manager: decides *when* the gleaner runs.
//!
//! Two triggers, per configuration: a time interval
//! (`snapshot_interval_milliseconds`), and pool pressure (a cycle is
//! forced ahead of schedule when any node's free-page percentage falls
//! under `snapshot_trigger_page_pool_percent`). Tests bypass both with
//! [`SnapshotManager::trigger_and_wait`].
//!
//! A structural error in a cycle abandons that cycle only: it is logged,
//! the engine keeps running against the last good snapshot, and the next
//! trigger tries again.

use crate::gleaner::{run_cycle, CycleOutcome, GleanerContext};
use crate::snapshot_file::SnapshotManifest;
use cinder_core::epoch::Epoch;
use cinder_core::error::StackResult;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy)]
struct Progress {
    next_snapshot_id: u16,
    base_epoch: Epoch,
}

/// Owns the snapshot schedule and the gleaner context.
pub struct SnapshotManager {
    ctx: GleanerContext,
    progress: Mutex<Progress>,
    cycle_lock: Mutex<()>,
    stop: AtomicBool,
    wake_mutex: Mutex<()>,
    wake_cond: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SnapshotManager {
    /// Build from a gleaner context, resuming after `previous` when the
    /// engine restarted from a manifest.
    pub fn new(ctx: GleanerContext, previous: Option<&SnapshotManifest>) -> SnapshotManager {
        let progress = match previous {
            Some(manifest) => Progress {
                next_snapshot_id: manifest.snapshot_id + 1,
                base_epoch: manifest.valid_until,
            },
            None => Progress {
                next_snapshot_id: 1,
                base_epoch: Epoch::INITIAL,
            },
        };
        SnapshotManager {
            ctx,
            progress: Mutex::new(progress),
            cycle_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            wake_mutex: Mutex::new(()),
            wake_cond: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    /// Epoch covered by the latest installed snapshot (the base of the
    /// next one).
    pub fn snapshotted_epoch(&self) -> Epoch {
        self.progress.lock().base_epoch
    }

    /// Run one cycle right now, synchronously. Concurrent callers
    /// serialize; the schedule thread uses the same path.
    pub fn trigger_and_wait(&self) -> StackResult<Option<CycleOutcome>> {
        let _cycle = self.cycle_lock.lock();
        let Progress {
            next_snapshot_id,
            base_epoch,
        } = *self.progress.lock();
        let outcome = run_cycle(&self.ctx, next_snapshot_id, base_epoch)?;
        if let Some(outcome) = &outcome {
            let mut progress = self.progress.lock();
            progress.next_snapshot_id = next_snapshot_id + 1;
            progress.base_epoch = outcome.valid_until;
        }
        Ok(outcome)
    }

    /// Start the schedule thread.
    pub fn start(self: &Arc<Self>) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("cinder-snapshot".to_string())
            .spawn(move || manager.schedule_loop())
            .expect("failed to spawn snapshot manager");
        *thread = Some(handle);
    }

    /// Stop the schedule thread. Idempotent; pairs with the in-cycle
    /// teardown also being idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake_cond.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn schedule_loop(&self) {
        info!("snapshot manager started");
        let interval =
            Duration::from_millis(self.ctx.snapshot_options.snapshot_interval_milliseconds.max(1));
        let poll = interval.min(Duration::from_millis(100));
        let mut last_cycle = Instant::now();
        while !self.stop.load(Ordering::Acquire) {
            {
                let mut guard = self.wake_mutex.lock();
                self.wake_cond.wait_for(&mut guard, poll);
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let pressured = self.ctx.pools.min_free_percent()
                < self.ctx.snapshot_options.snapshot_trigger_page_pool_percent;
            let due = last_cycle.elapsed() >= interval;
            if !pressured && !due {
                continue;
            }
            if pressured {
                info!(
                    free_percent = self.ctx.pools.min_free_percent(),
                    "pool pressure forcing a snapshot cycle"
                );
            }
            last_cycle = Instant::now();
            match self.trigger_and_wait() {
                Ok(_) => {}
                Err(e) => {
                    // Abandon this cycle; transactions keep running
                    // against the last good snapshot.
                    error!(error = %e, "snapshot cycle abandoned");
                }
            }
        }
        info!("snapshot manager stopped");
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        self.stop();
    }
}
