//! The engine: single owning root of every subsystem.
//!
//! Ownership is strictly top-down: the engine owns pools, cache,
//! registry, managers; everything below holds `Arc` handles or arena
//! indices, never a back-reference. [`ThreadContext`]s borrow into this
//! structure through `Arc`s and must not outlive their engine's
//! `shutdown`.
//!
//! `shutdown` is idempotent: the snapshot manager, log flusher, and epoch
//! chime each tolerate a second stop, so both an explicit call and the
//! `Drop` impl may run it.

use cinder_core::epoch::Epoch;
use cinder_core::error::{ErrorStack, StackResult};
use cinder_core::log::ThreadLogBuffer;
use cinder_core::memory::PagePools;
use cinder_core::options::EngineOptions;
use cinder_core::page::SnapshotPagePointer;
use cinder_core::traits::SnapshotPageSource;
use cinder_core::ThreadId;
use cinder_durability::{
    GleanerContext, LogManager, SnapshotManager, SnapshotManifest, SnapshotPageCache,
};
use cinder_storage::StorageRegistry;
use cinder_xct::{IsolationLevel, MovedRecordResolver, Xct, XctManager};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The database engine.
pub struct Engine {
    options: EngineOptions,
    pools: PagePools,
    cache: Arc<SnapshotPageCache>,
    registry: Arc<StorageRegistry>,
    xct_manager: Arc<XctManager>,
    log_manager: Arc<LogManager>,
    snapshot_manager: Arc<SnapshotManager>,
    next_thread_id: AtomicU16,
    flusher: Mutex<Option<std::thread::JoinHandle<()>>>,
    flusher_stop: Arc<AtomicBool>,
    shutdown_ran: AtomicBool,
}

impl Engine {
    /// Start a fresh engine: empty pools, fresh logs, no snapshot.
    pub fn new(options: EngineOptions) -> StackResult<Arc<Engine>> {
        Self::build(options, None)
    }

    /// Start against existing snapshot folders: the latest manifest (if
    /// any) is loaded, storages are rebuilt on their snapshot roots with
    /// empty volatile trees, and the clock resumes above the snapshot.
    pub fn restart(options: EngineOptions) -> StackResult<Arc<Engine>> {
        let manifest = SnapshotManifest::load_current(&options.snapshot)?;
        Self::build(options, manifest)
    }

    fn build(
        options: EngineOptions,
        manifest: Option<SnapshotManifest>,
    ) -> StackResult<Arc<Engine>> {
        let node_count = options.memory.node_count.max(1);
        let pools = PagePools::new(node_count as usize, options.memory.pool_pages_per_node);
        let cache = Arc::new(SnapshotPageCache::new(options.snapshot.clone()));
        let source: Arc<dyn SnapshotPageSource> = cache.clone() as Arc<dyn SnapshotPageSource>;
        let registry = Arc::new(StorageRegistry::new(pools.clone(), Arc::clone(&source)));

        let initial_current = match &manifest {
            Some(manifest) => manifest.valid_until.one_more(),
            None => Epoch::INITIAL.one_more(),
        };
        let xct_manager = Arc::new(XctManager::new(options.xct.clone(), initial_current));
        xct_manager.set_moved_resolver(registry.clone() as Arc<dyn MovedRecordResolver>);
        xct_manager.start();

        let log_manager = Arc::new(LogManager::new(options.log.clone(), node_count)?);

        if let Some(manifest) = &manifest {
            for entry in &manifest.storages {
                registry.load_storage(
                    &entry.metadata,
                    SnapshotPagePointer::from_raw(entry.root_pointer),
                    manifest.valid_until,
                )?;
            }
            info!(
                snapshot = manifest.snapshot_id,
                valid_until = %manifest.valid_until,
                storages = manifest.storages.len(),
                "engine restarted from snapshot"
            );
        }

        let gleaner_ctx = GleanerContext {
            xct_manager: Arc::clone(&xct_manager),
            log_manager: Arc::clone(&log_manager),
            registry: Arc::clone(&registry),
            source,
            pools: pools.clone(),
            snapshot_options: options.snapshot.clone(),
            max_pause_ms: options.xct.max_pause_ms,
        };
        let snapshot_manager =
            Arc::new(SnapshotManager::new(gleaner_ctx, manifest.as_ref()));
        snapshot_manager.start();

        let engine = Arc::new(Engine {
            options,
            pools,
            cache,
            registry,
            xct_manager,
            log_manager,
            snapshot_manager,
            next_thread_id: AtomicU16::new(0),
            flusher: Mutex::new(None),
            flusher_stop: Arc::new(AtomicBool::new(false)),
            shutdown_ran: AtomicBool::new(false),
        });
        engine.start_flusher();
        info!("engine started");
        Ok(engine)
    }

    fn start_flusher(self: &Arc<Self>) {
        let log_manager = Arc::clone(&self.log_manager);
        let stop = Arc::clone(&self.flusher_stop);
        let interval = Duration::from_millis(self.options.log.flush_interval_ms.max(1));
        let handle = std::thread::Builder::new()
            .name("cinder-log-flusher".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if let Err(e) = log_manager.flush_all() {
                        error!(error = %e, "background log flush failed");
                    }
                }
            })
            .expect("failed to spawn log flusher");
        *self.flusher.lock() = Some(handle);
    }

    /// Configuration this engine runs with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The volatile page pools.
    pub fn pools(&self) -> &PagePools {
        &self.pools
    }

    /// The storage registry.
    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    /// The transaction manager.
    pub fn xct_manager(&self) -> &Arc<XctManager> {
        &self.xct_manager
    }

    /// The snapshot manager.
    pub fn snapshot_manager(&self) -> &Arc<SnapshotManager> {
        &self.snapshot_manager
    }

    /// The snapshot page cache.
    pub fn snapshot_cache(&self) -> &Arc<SnapshotPageCache> {
        &self.cache
    }

    /// Block until every commit at or before `epoch` is durable. Call
    /// between transactions; the durability drain waits for running
    /// transactions to finish.
    pub fn wait_for_commit(&self, epoch: Epoch) -> StackResult<Epoch> {
        self.log_manager.wait_until_durable(epoch, &self.xct_manager)
    }

    /// Hand out a context for the calling thread. Thread ids are dense;
    /// nodes are assigned round-robin.
    pub fn attach_thread(self: &Arc<Self>) -> ThreadContext {
        let thread_id = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
        let node = (thread_id % self.options.memory.node_count.max(1) as u16) as u8;
        let log_buffer = self.log_manager.register_thread(node, thread_id);
        ThreadContext {
            engine: Arc::clone(self),
            node,
            thread_id,
            xct: Xct::new(thread_id, &self.options.xct),
            log_buffer,
        }
    }

    /// Stop background work and flush what remains. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_ran.swap(true, Ordering::AcqRel) {
            return;
        }
        self.snapshot_manager.stop();
        self.flusher_stop.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        self.xct_manager.stop();
        if let Err(e) = self.log_manager.flush_all() {
            error!(error = %e, "final log flush failed");
        }
        info!("engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.pools.node_count())
            .field("current_epoch", &self.xct_manager.current_epoch())
            .finish()
    }
}

/// One worker thread's handle into the engine: its transaction object and
/// its redo log buffer.
pub struct ThreadContext {
    engine: Arc<Engine>,
    node: u8,
    thread_id: ThreadId,
    xct: Xct,
    log_buffer: Arc<ThreadLogBuffer>,
}

impl ThreadContext {
    /// The engine this context belongs to.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// NUMA node this thread is assigned to.
    pub fn node(&self) -> u8 {
        self.node
    }

    /// This thread's id.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// The transaction object, for storage operations.
    pub fn xct(&mut self) -> &mut Xct {
        &mut self.xct
    }

    /// Begin a transaction.
    pub fn begin(&mut self, isolation: IsolationLevel) -> StackResult<()> {
        self.engine.xct_manager.begin_xct(&mut self.xct, isolation)
    }

    /// Attempt to commit, returning the commit epoch.
    pub fn precommit(&mut self) -> StackResult<Epoch> {
        self.engine
            .xct_manager
            .precommit_xct(&mut self.xct, &self.log_buffer)
    }

    /// Abort the running transaction.
    pub fn abort(&mut self) -> StackResult<()> {
        self.engine.xct_manager.abort_xct(&mut self.xct)
    }

    /// Run one closure as a serializable transaction, retrying on race
    /// aborts until it commits. Returns the commit epoch.
    pub fn retry_transaction(
        &mut self,
        mut body: impl FnMut(&mut Xct) -> Result<(), ErrorStack>,
    ) -> StackResult<Epoch> {
        loop {
            self.begin(IsolationLevel::Serializable)?;
            match body(&mut self.xct) {
                Ok(()) => {}
                Err(e) if e.is_race() => {
                    if self.xct.is_active() {
                        self.abort()?;
                    }
                    continue;
                }
                Err(e) => {
                    if self.xct.is_active() {
                        self.abort()?;
                    }
                    return Err(e);
                }
            }
            match self.precommit() {
                Ok(epoch) => return Ok(epoch),
                Err(e) if e.is_race() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("thread_id", &self.thread_id)
            .field("node", &self.node)
            .finish()
    }
}
