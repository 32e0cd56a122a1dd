//! Durable redo log writer and reader.
//!
//! Every thread's log buffer drains to its own file,
//! `<log_folder(node)>/thread_<T>.log`, as framed blocks:
//!
//! ```text
//! ┌───────────┬───────────┬──────────────────────────────┐
//! │ len (4)   │ crc32 (4) │ packed redo records (len)    │
//! └───────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! A block is one or more whole commits, so a CRC-valid prefix of a file
//! is always a record-aligned stream. The reader re-concatenates blocks
//! and hands the mapper plain record bytes.
//!
//! ## Durable epoch
//!
//! `wait_until_durable(e)` is the engine's durability point. It advances
//! the clock past `e`, briefly drains running transactions on the pause
//! latch (so no commit can still append records with epochs ≤ `e`),
//! flushes and fsyncs every buffer, and only then publishes the new
//! durable frontier. That trade (a short rundown per explicit durability
//! wait) buys an exact frontier without per-thread epoch bookkeeping.
//!
//! Log files do not survive a restart: recovery is snapshot-based, and the
//! records a snapshot has consumed are dead. `LogManager::new` starts the
//! files fresh.

use cinder_core::epoch::{AtomicEpoch, Epoch};
use cinder_core::error::{ErrorCode, ErrorStack, StackResult};
use cinder_core::log::ThreadLogBuffer;
use cinder_core::{LogOptions, ThreadId};
use cinder_xct::XctManager;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const BLOCK_HEADER_SIZE: usize = 8;

fn io_error(path: &std::path::Path, err: std::io::Error) -> ErrorStack {
    ErrorStack::new(ErrorCode::LogIo, format!("{}: {}", path.display(), err))
}

/// Durable log writer: owns the per-thread files and the durable epoch.
pub struct LogManager {
    options: LogOptions,
    node_count: u8,
    buffers: RwLock<Vec<Arc<ThreadLogBuffer>>>,
    files: Mutex<HashMap<ThreadId, File>>,
    durable_epoch: AtomicEpoch,
    durable_mutex: Mutex<()>,
    durable_cond: Condvar,
    flush_lock: Mutex<()>,
}

impl LogManager {
    /// Create the log directories (fresh: leftover files from a previous
    /// run are removed; recovery is snapshot-based).
    pub fn new(options: LogOptions, node_count: u8) -> StackResult<LogManager> {
        for node in 0..node_count {
            let dir = options.folder_path(node);
            std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
            let entries = std::fs::read_dir(&dir).map_err(|e| io_error(&dir, e))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "log") {
                    std::fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
                }
            }
        }
        Ok(LogManager {
            options,
            node_count,
            buffers: RwLock::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            durable_epoch: AtomicEpoch::new(Epoch::INITIAL),
            durable_mutex: Mutex::new(()),
            durable_cond: Condvar::new(),
            flush_lock: Mutex::new(()),
        })
    }

    /// Number of nodes this manager writes for.
    pub fn node_count(&self) -> u8 {
        self.node_count
    }

    /// Register one thread's buffer; the flusher drains it from now on.
    pub fn register_thread(&self, node: u8, thread_id: ThreadId) -> Arc<ThreadLogBuffer> {
        let buffer = Arc::new(ThreadLogBuffer::new(node, thread_id));
        self.buffers.write().push(Arc::clone(&buffer));
        buffer
    }

    /// All logs at or before this epoch are on disk.
    pub fn durable_epoch(&self) -> Epoch {
        self.durable_epoch.load()
    }

    fn thread_log_path(&self, node: u8, thread_id: ThreadId) -> PathBuf {
        self.options
            .folder_path(node)
            .join(format!("thread_{}.log", thread_id))
    }

    /// Drain every registered buffer to its file and fsync. Does not move
    /// the durable epoch; only `wait_until_durable` may, because only it
    /// rules out in-flight commits behind the frontier.
    pub fn flush_all(&self) -> StackResult<()> {
        let _guard = self.flush_lock.lock();
        let buffers: Vec<Arc<ThreadLogBuffer>> = self.buffers.read().clone();
        let mut files = self.files.lock();
        for buffer in buffers {
            let Some(bytes) = buffer.drain() else {
                continue;
            };
            let path = self.thread_log_path(buffer.node(), buffer.thread_id());
            let file = match files.entry(buffer.thread_id()) {
                std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .map_err(|e| io_error(&path, e))?;
                    v.insert(file)
                }
            };
            let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + bytes.len());
            block.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            block.extend_from_slice(&crc32fast::hash(&bytes).to_le_bytes());
            block.extend_from_slice(&bytes);
            file.write_all(&block).map_err(|e| io_error(&path, e))?;
            file.sync_data().map_err(|e| io_error(&path, e))?;
            debug!(
                node = buffer.node(),
                thread = buffer.thread_id(),
                bytes = block.len(),
                "flushed log block"
            );
        }
        Ok(())
    }

    /// Make every commit with epoch ≤ `epoch` durable, then publish the
    /// frontier and wake waiters.
    pub fn wait_until_durable(
        &self,
        epoch: Epoch,
        xct_manager: &XctManager,
    ) -> StackResult<Epoch> {
        if !epoch.is_valid() {
            return Ok(self.durable_epoch());
        }
        if !self.durable_epoch().before(epoch) {
            return Ok(self.durable_epoch());
        }
        // New commits must land past the requested frontier.
        while !epoch.before(xct_manager.current_epoch()) {
            xct_manager.advance_epoch();
        }
        // Drain in-flight commits: anything that began before the advance
        // finishes inside this rundown, so after it no appends with
        // epochs ≤ `epoch` can appear.
        xct_manager.pause_transactions();
        let flushed = self.flush_all();
        xct_manager.resume_transactions();
        flushed?;

        let frontier = xct_manager.current_epoch().one_less();
        debug_assert!(!frontier.before(epoch));
        {
            let _guard = self.durable_mutex.lock();
            self.durable_epoch.store_max(frontier);
        }
        self.durable_cond.notify_all();
        info!(durable = %self.durable_epoch(), "durable epoch advanced");
        Ok(self.durable_epoch())
    }

    /// Block until the durable frontier reaches `epoch` (some other
    /// caller is expected to be driving it).
    pub fn wait_for_durable(&self, epoch: Epoch) {
        let mut guard = self.durable_mutex.lock();
        while self.durable_epoch().before(epoch) {
            self.durable_cond.wait(&mut guard);
        }
    }

    /// Read back one node's record streams for the mapper: CRC-validated
    /// block payloads, re-concatenated per thread. `io_buffer_kb` sizes
    /// the read buffer.
    pub fn read_node_streams(
        &self,
        node: u8,
        io_buffer_kb: usize,
    ) -> StackResult<Vec<(ThreadId, Vec<u8>)>> {
        let buffers = self.buffers.read();
        let mut streams = Vec::new();
        for buffer in buffers.iter().filter(|b| b.node() == node) {
            let path = self.thread_log_path(node, buffer.thread_id());
            if !path.exists() {
                continue;
            }
            let file = File::open(&path).map_err(|e| io_error(&path, e))?;
            let mut reader = BufReader::with_capacity((io_buffer_kb.max(1)) << 10, file);
            let mut bytes = Vec::new();
            loop {
                let mut header = [0u8; BLOCK_HEADER_SIZE];
                match reader.read_exact(&mut header) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(io_error(&path, e)),
                }
                let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
                let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
                let mut payload = vec![0u8; len];
                reader
                    .read_exact(&mut payload)
                    .map_err(|e| io_error(&path, e))?;
                if crc32fast::hash(&payload) != crc {
                    return Err(ErrorStack::new(
                        ErrorCode::Corrupt,
                        format!("log block checksum mismatch in {}", path.display()),
                    ));
                }
                bytes.extend_from_slice(&payload);
            }
            streams.push((buffer.thread_id(), bytes));
        }
        Ok(streams)
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("node_count", &self.node_count)
            .field("durable_epoch", &self.durable_epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::log::{encode_epoch_mark, iter_records, RedoKind};

    fn test_manager(dir: &std::path::Path) -> LogManager {
        let options = LogOptions {
            folder_path_pattern: dir
                .join("logs/node_$NODE$")
                .to_string_lossy()
                .into_owned(),
            flush_interval_ms: 1000,
        };
        LogManager::new(options, 1).unwrap()
    }

    #[test]
    fn flush_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let buffer = manager.register_thread(0, 0);

        let mark = encode_epoch_mark(Epoch::from_raw(4));
        buffer.append(Epoch::from_raw(4), &mark[0..0]); // marks itself
        buffer.append(Epoch::from_raw(4), &mark); // plus an explicit record
        manager.flush_all().unwrap();

        let streams = manager.read_node_streams(0, 64).unwrap();
        assert_eq!(streams.len(), 1);
        let (thread, bytes) = &streams[0];
        assert_eq!(*thread, 0);
        let kinds: Vec<RedoKind> = iter_records(bytes).map(|r| r.header.kind).collect();
        assert_eq!(kinds, vec![RedoKind::EpochMark, RedoKind::EpochMark]);
    }

    #[test]
    fn corrupt_blocks_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let buffer = manager.register_thread(0, 3);
        buffer.append(Epoch::from_raw(4), b"");
        manager.flush_all().unwrap();

        // Flip a payload byte behind the manager's back.
        let path = dir.path().join("logs/node_0/thread_3.log");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = manager.read_node_streams(0, 64).unwrap_err();
        assert_eq!(err.code, ErrorCode::Corrupt);
    }

    #[test]
    fn new_manager_starts_files_fresh() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = test_manager(dir.path());
            let buffer = manager.register_thread(0, 0);
            buffer.append(Epoch::from_raw(4), b"");
            manager.flush_all().unwrap();
        }
        let manager = test_manager(dir.path());
        let _buffer = manager.register_thread(0, 0);
        // The previous run's file is gone; nothing to read.
        assert!(manager.read_node_streams(0, 64).unwrap().is_empty());
    }
}
