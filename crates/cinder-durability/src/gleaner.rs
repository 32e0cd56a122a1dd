//! The gleaner: orchestrator of one snapshot cycle.
//!
//! ```text
//! decide valid_until ──► spawn per-node workers ──► construct roots
//!   (durable frontier)     mapper: bucket logs        (node-0 writer)
//!                          reducer: sort + compose          │
//!                                                           ▼
//! resume ◄── drop volatiles ◄── swing pointers ◄── pause ◄── manifest
//!            (budgeted)          (always complete)           (commit pt)
//! ```
//!
//! Workers coordinate through a [`GleanerBarrier`]: each reports
//! completion of its processing window, errors bump a shared counter and
//! wake the gleaner, and a stop request is polled by the mapper and
//! reducer loops so a failing cycle winds down early instead of draining
//! its inputs. Teardown is explicitly idempotent: a worker's own exit
//! path and the gleaner's error path may both run it.
//!
//! The pause window is budgeted: snapshot-pointer swings always complete;
//! volatile drops stop when `max_pause_ms` is spent and leave the rest
//! for the next cycle.

use crate::composer::{
    compose, construct_root, drop_root_volatile, drop_volatiles, DropChunks, RootInfo,
};
use crate::log_manager::LogManager;
use crate::mapper::{run_mapper, MapperStats, RedoTuple};
use crate::reducer::run_reducer;
use crate::snapshot_file::{ManifestStorage, SnapshotManifest, SnapshotWriter};
use cinder_core::epoch::Epoch;
use cinder_core::error::{ErrorCode, ErrorStack, StackResult};
use cinder_core::memory::PagePools;
use cinder_core::page::SnapshotPagePointer;
use cinder_core::traits::SnapshotPageSource;
use cinder_core::{SnapshotOptions, StorageId};
use cinder_storage::{StorageRef, StorageRegistry};
use cinder_xct::XctManager;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Completion/error rendezvous between the gleaner and its workers.
pub struct GleanerBarrier {
    all_count: u32,
    completed_count: AtomicU32,
    exit_count: AtomicU32,
    error_count: AtomicU32,
    stop_requested: AtomicBool,
    shutdown_ran: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl GleanerBarrier {
    /// Barrier expecting `all_count` workers.
    pub fn new(all_count: u32) -> GleanerBarrier {
        GleanerBarrier {
            all_count,
            completed_count: AtomicU32::new(0),
            exit_count: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            shutdown_ran: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Worker: the processing window is done.
    pub fn report_completed(&self) {
        let after = self.completed_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(after <= self.all_count);
        if after == self.all_count {
            self.wakeup();
        }
    }

    /// Worker: something went wrong; the gleaner should drain and stop.
    pub fn increment_error_count(&self) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
        self.wakeup();
    }

    /// Worker: thread is exiting (after its own teardown).
    pub fn report_exit(&self) {
        self.exit_count.fetch_add(1, Ordering::AcqRel);
        self.wakeup();
    }

    /// Errors reported so far.
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Workers that have fully exited, their own teardown included.
    pub fn exit_count(&self) -> u32 {
        self.exit_count.load(Ordering::Acquire)
    }

    /// Whether the gleaner asked workers to wind down early. The mapper
    /// and reducer loops poll this between records/buckets and bail out
    /// when it flips.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Gleaner: block until every worker completed or anyone failed.
    pub fn wait_all_completed(&self) {
        let mut guard = self.mutex.lock();
        loop {
            if self.error_count() > 0
                || self.completed_count.load(Ordering::Acquire) >= self.all_count
            {
                return;
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Ask workers to stop and wake everyone. Safe to call twice; the
    /// second call is a no-op by construction, which is what makes the
    /// worker-side and owner-side teardown paths compose.
    pub fn shutdown(&self) {
        if self.shutdown_ran.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_requested.store(true, Ordering::Release);
        self.wakeup();
    }

    fn wakeup(&self) {
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }
}

/// Everything a cycle needs, wired once by the engine.
pub struct GleanerContext {
    /// For the pause barrier and epoch clock.
    pub xct_manager: Arc<XctManager>,
    /// Log frontier and streams.
    pub log_manager: Arc<LogManager>,
    /// Storages to snapshot.
    pub registry: Arc<StorageRegistry>,
    /// Resolves previous-snapshot pages during composition.
    pub source: Arc<dyn SnapshotPageSource>,
    /// Volatile pools (for drops).
    pub pools: PagePools,
    /// Snapshot tunables.
    pub snapshot_options: SnapshotOptions,
    /// Pause budget.
    pub max_pause_ms: u64,
}

/// What one successful cycle produced.
#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    /// Id of the new snapshot.
    pub snapshot_id: u16,
    /// Every commit at or before this epoch is in the snapshot.
    pub valid_until: Epoch,
    /// Redo records consumed.
    pub mapped_records: u64,
    /// Volatile pages returned to the pools.
    pub dropped_pages: u64,
}

struct PartitionOutput {
    root_infos: Vec<(StorageId, RootInfo)>,
    writer: SnapshotWriter,
}

/// Run one snapshot cycle. Returns `None` when no epoch has closed since
/// `base_epoch` (nothing to do).
pub fn run_cycle(
    ctx: &GleanerContext,
    snapshot_id: u16,
    base_epoch: Epoch,
) -> StackResult<Option<CycleOutcome>> {
    // 1. Decide valid_until from the durable frontier.
    let target = ctx.xct_manager.current_epoch();
    let valid_until = ctx
        .log_manager
        .wait_until_durable(target, &ctx.xct_manager)?;
    if !base_epoch.before(valid_until) {
        return Ok(None);
    }
    let storages = ctx.registry.all();
    if storages.is_empty() {
        return Ok(None);
    }
    let node_count = ctx.pools.node_count();

    // Read the streams once up front; a window with no records means
    // there is nothing to snapshot.
    let mut node_streams = Vec::with_capacity(node_count);
    let mut in_window = 0u64;
    for node in 0..node_count {
        let streams = ctx
            .log_manager
            .read_node_streams(node as u8, ctx.snapshot_options.log_mapper_io_buffer_kb)?;
        in_window += crate::mapper::count_records_in_window(&streams, base_epoch, valid_until);
        node_streams.push(streams);
    }
    if in_window == 0 {
        debug!(%base_epoch, %valid_until, "no records in window; skipping cycle");
        return Ok(None);
    }

    info!(
        snapshot_id,
        %base_epoch,
        %valid_until,
        nodes = node_count,
        storages = storages.len(),
        records = in_window,
        "snapshot cycle starting"
    );
    for node in 0..node_count {
        let dir = ctx.snapshot_options.folder_path(node as u8);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ErrorStack::new(ErrorCode::SnapshotIo, format!("{}: {}", dir.display(), e))
        })?;
    }

    // 2. Per-node map / reduce / compose, one mapper and one
    //    reducer+composer per node, talking through bucket channels.
    let barrier = GleanerBarrier::new(node_count as u32 * 2);
    let mut mapper_stats: Vec<Option<MapperStats>> = Vec::new();
    let mut partition_outputs: Vec<Option<PartitionOutput>> = Vec::new();

    std::thread::scope(|scope| -> StackResult<()> {
        let mut senders = Vec::with_capacity(node_count);
        let mut receivers = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let (sender, receiver) = mpsc::channel::<Vec<RedoTuple>>();
            senders.push(sender);
            receivers.push(Some(receiver));
        }

        let mut reducer_handles = Vec::new();
        for (node, receiver) in receivers.iter_mut().enumerate() {
            let receiver = receiver.take().expect("receiver consumed once");
            let barrier = &barrier;
            let storages = &storages;
            reducer_handles.push(scope.spawn(move || {
                let result =
                    reduce_and_compose(ctx, snapshot_id, node as u8, receiver, storages, barrier);
                match result {
                    Ok(output) => {
                        barrier.report_completed();
                        barrier.report_exit();
                        Some(output)
                    }
                    Err(e) => {
                        if barrier.is_stop_requested() {
                            debug!(node, "reducer/composer wound down");
                        } else {
                            error!(node, error = %e, "reducer/composer failed");
                            barrier.increment_error_count();
                        }
                        barrier.report_exit();
                        None
                    }
                }
            }));
        }

        let mut mapper_handles = Vec::new();
        for node in 0..node_count {
            let senders: Vec<mpsc::Sender<Vec<RedoTuple>>> = senders.to_vec();
            let barrier = &barrier;
            let streams = &node_streams[node];
            mapper_handles.push(scope.spawn(move || {
                let result = run_mapper(
                    node as u8,
                    streams,
                    base_epoch,
                    valid_until,
                    &ctx.registry,
                    &senders,
                    ctx.snapshot_options.log_mapper_bucket_kb,
                    barrier,
                );
                drop(senders);
                match result {
                    Ok(stats) => {
                        barrier.report_completed();
                        barrier.report_exit();
                        Some(stats)
                    }
                    Err(e) => {
                        if barrier.is_stop_requested() {
                            debug!(node, "mapper wound down");
                        } else {
                            error!(node, error = %e, "mapper failed");
                            barrier.increment_error_count();
                        }
                        barrier.report_exit();
                        None
                    }
                }
            }));
        }
        // The scope's own sender copies must die or the reducers never
        // see end-of-stream.
        drop(senders);

        barrier.wait_all_completed();
        if barrier.error_count() > 0 {
            // Drain: let every worker finish its own teardown before we
            // run ours (shutdown is idempotent either way).
            barrier.shutdown();
        }
        for handle in mapper_handles {
            mapper_stats.push(handle.join().map_err(|_| {
                ErrorStack::new(ErrorCode::SnapshotCycleFailed, "mapper panicked")
            })?);
        }
        for handle in reducer_handles {
            partition_outputs.push(handle.join().map_err(|_| {
                ErrorStack::new(ErrorCode::SnapshotCycleFailed, "reducer panicked")
            })?);
        }
        Ok(())
    })?;

    barrier.shutdown();
    if barrier.error_count() > 0 {
        return Err(ErrorStack::new(
            ErrorCode::SnapshotCycleFailed,
            format!("{} snapshot workers failed", barrier.error_count()),
        ));
    }
    let mapped_records: u64 = mapper_stats
        .iter()
        .flatten()
        .map(|s| s.mapped_records)
        .sum();

    // 3. Construct roots on node 0's writer, then seal every file.
    let mut outputs: Vec<PartitionOutput> = partition_outputs
        .into_iter()
        .map(|o| o.expect("worker success established above"))
        .collect();
    let mut per_storage_infos: HashMap<StorageId, Vec<RootInfo>> = HashMap::new();
    for output in &mut outputs {
        for (storage_id, info) in output.root_infos.drain(..) {
            per_storage_infos.entry(storage_id).or_default().push(info);
        }
    }
    let mut new_roots: Vec<(StorageRef, SnapshotPagePointer, Vec<RootInfo>)> = Vec::new();
    {
        let root_writer = &mut outputs[0].writer;
        for storage in &storages {
            let id = match storage {
                StorageRef::Array(a) => a.id(),
                StorageRef::Sequential(s) => s.id(),
            };
            let infos = per_storage_infos.remove(&id).unwrap_or_default();
            let root = construct_root(storage, &infos, root_writer, &ctx.source)?;
            new_roots.push((storage.clone(), root, infos));
        }
    }
    for output in outputs {
        output.writer.finish()?;
    }

    // 4. Manifest: the commit point of the cycle.
    let manifest = SnapshotManifest {
        snapshot_id,
        base_epoch,
        valid_until,
        storages: new_roots
            .iter()
            .map(|(storage, root, _)| ManifestStorage {
                metadata: storage.metadata(),
                root_pointer: root.raw(),
            })
            .collect(),
    };
    manifest.save(&ctx.snapshot_options)?;

    // 5. Install under the pause; drops are budgeted, swings are not.
    let pause_budget = Duration::from_millis(ctx.max_pause_ms.max(1));
    ctx.xct_manager.pause_transactions();
    let pause_started = Instant::now();
    for (storage, root, infos) in &new_roots {
        crate::composer::install_pointers(storage, *root, infos, valid_until);
    }
    let mut chunks = DropChunks::new(ctx.pools.clone());
    let mut dropped_pages = 0u64;
    let mut all_dropped = true;
    let mut budget_spent = false;
    for (storage, _, _) in &new_roots {
        if pause_started.elapsed() >= pause_budget {
            budget_spent = true;
            all_dropped = false;
            break;
        }
        let result = drop_volatiles(storage, valid_until, &mut chunks);
        dropped_pages += result.dropped_count;
        all_dropped &= result.dropped_all;
    }
    if all_dropped {
        for (storage, _, _) in &new_roots {
            dropped_pages += drop_root_volatile(storage, &mut chunks);
        }
    }
    chunks.flush();
    ctx.xct_manager.resume_transactions();
    if budget_spent {
        warn!(
            snapshot_id,
            budget_ms = ctx.max_pause_ms,
            "pause budget exhausted; remaining volatile drops deferred"
        );
    }

    info!(
        snapshot_id,
        %valid_until,
        mapped_records,
        dropped_pages,
        pause_us = pause_started.elapsed().as_micros() as u64,
        "snapshot cycle complete"
    );
    Ok(Some(CycleOutcome {
        snapshot_id,
        valid_until,
        mapped_records,
        dropped_pages,
    }))
}

fn reduce_and_compose(
    ctx: &GleanerContext,
    snapshot_id: u16,
    node: u8,
    receiver: mpsc::Receiver<Vec<RedoTuple>>,
    storages: &[StorageRef],
    barrier: &GleanerBarrier,
) -> StackResult<PartitionOutput> {
    let spill_dir = ctx.snapshot_options.folder_path(node);
    let (sorted, _stats) = run_reducer(
        node,
        receiver,
        ctx.snapshot_options.log_reducer_buffer_mb,
        &spill_dir,
        barrier,
    )?;
    if barrier.is_stop_requested() {
        // Another worker failed while we were sorting; do not open a
        // snapshot file for a cycle that is being abandoned.
        return Err(ErrorStack::new(
            ErrorCode::SnapshotCycleFailed,
            "composer wound down by stop request",
        ));
    }

    // The sorted run is contiguous per storage; slice it out.
    let mut ranges: HashMap<StorageId, std::ops::Range<usize>> = HashMap::new();
    let mut start = 0usize;
    for i in 1..=sorted.len() {
        if i == sorted.len() || sorted[i].storage_id != sorted[start].storage_id {
            ranges.insert(sorted[start].storage_id, start..i);
            start = i;
        }
    }

    let mut writer = SnapshotWriter::create(&ctx.snapshot_options, snapshot_id, node)?;
    let node_count = ctx.pools.node_count();
    let mut root_infos = Vec::new();
    for storage in storages {
        let id = match storage {
            StorageRef::Array(a) => a.id(),
            StorageRef::Sequential(s) => s.id(),
        };
        let tuples = ranges
            .get(&id)
            .map(|range| &sorted[range.clone()])
            .unwrap_or(&[]);
        let info = compose(storage, node, node_count, tuples, &mut writer, &ctx.source)?;
        root_infos.push((id, info));
    }
    debug!(node, storages = root_infos.len(), "partition composed");
    Ok(PartitionOutput { root_infos, writer })
}
