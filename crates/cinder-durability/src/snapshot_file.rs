//! Snapshot page files, the page cache, and the manifest.
//!
//! Per node, per snapshot, one file: `snapshot_<id>.db` under the node's
//! snapshot folder. Page 0 is a header page (magic + snapshot id); data
//! pages follow at their page index × [`PAGE_SIZE`]. Pages carry a crc32
//! of their data region, verified on read.
//!
//! The manifest is one JSON document written to node 0's folder after the
//! page files are fsynced; writing it is the commit point of a snapshot
//! cycle. `manifest_current.json` always names the latest snapshot.

use cinder_core::epoch::Epoch;
use cinder_core::error::{CodeResult, ErrorCode, ErrorStack, StackResult};
use cinder_core::page::{Page, SnapshotPagePointer, PAGE_SIZE};
use cinder_core::traits::SnapshotPageSource;
use cinder_core::{DeviceEmulationOptions, SnapshotOptions};
use cinder_storage::StorageMetadata;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const SNAPSHOT_MAGIC: &[u8; 8] = b"CINDSNAP";

fn io_error(path: &std::path::Path, err: std::io::Error) -> ErrorStack {
    ErrorStack::new(ErrorCode::SnapshotIo, format!("{}: {}", path.display(), err))
}

/// File name of one snapshot's pages on one node.
pub fn snapshot_file_path(options: &SnapshotOptions, snapshot_id: u16, node: u8) -> PathBuf {
    options
        .folder_path(node)
        .join(format!("snapshot_{}.db", snapshot_id))
}

/// Writes one node's pages for one snapshot under construction.
pub struct SnapshotWriter {
    snapshot_id: u16,
    node: u8,
    path: PathBuf,
    file: File,
    next_page_index: u64,
    emulation: DeviceEmulationOptions,
    scratch: Vec<u8>,
}

impl SnapshotWriter {
    /// Create the file and write the header page.
    pub fn create(
        options: &SnapshotOptions,
        snapshot_id: u16,
        node: u8,
    ) -> StackResult<SnapshotWriter> {
        let dir = options.folder_path(node);
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let path = snapshot_file_path(options, snapshot_id, node);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        let mut writer = SnapshotWriter {
            snapshot_id,
            node,
            path,
            file,
            next_page_index: 0,
            emulation: options.emulation,
            scratch: vec![0u8; PAGE_SIZE],
        };
        let header = Page::new();
        header.init(0, snapshot_id as u64);
        // Safety: the header page is exclusively ours.
        unsafe {
            header.data_mut()[0..8].copy_from_slice(SNAPSHOT_MAGIC);
        }
        writer.write_page_internal(&header)?;
        Ok(writer)
    }

    /// The snapshot under construction.
    pub fn snapshot_id(&self) -> u16 {
        self.snapshot_id
    }

    /// Node this writer serves.
    pub fn node(&self) -> u8 {
        self.node
    }

    /// Append one page, returning its pointer.
    pub fn write_page(&mut self, page: &Page) -> StackResult<SnapshotPagePointer> {
        page.set_checksum(page.compute_checksum());
        let index = self.write_page_internal(page)?;
        Ok(SnapshotPagePointer::new(self.snapshot_id, self.node, index))
    }

    fn write_page_internal(&mut self, page: &Page) -> StackResult<u64> {
        if self.emulation.emulated_write_latency_us > 0 {
            std::thread::sleep(std::time::Duration::from_micros(
                self.emulation.emulated_write_latency_us,
            ));
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        page.serialize_into(&mut scratch);
        let result = self.file.write_all(&scratch);
        self.scratch = scratch;
        result.map_err(|e| io_error(&self.path, e))?;
        let index = self.next_page_index;
        self.next_page_index += 1;
        Ok(index)
    }

    /// Pages written so far, header page included.
    pub fn page_count(&self) -> u64 {
        self.next_page_index
    }

    /// Fsync the file. Nothing may be written afterwards.
    pub fn finish(mut self) -> StackResult<u64> {
        self.file.flush().map_err(|e| io_error(&self.path, e))?;
        self.file.sync_all().map_err(|e| io_error(&self.path, e))?;
        debug!(
            snapshot = self.snapshot_id,
            node = self.node,
            pages = self.next_page_index,
            "snapshot file finished"
        );
        Ok(self.next_page_index)
    }
}

/// Read-through cache over all snapshot files; the engine's
/// [`SnapshotPageSource`].
///
/// Loaded pages are shared immutable images; the cache grows with the
/// working set and retires wholesale with the engine (snapshot files this
/// engine no longer references are never touched again).
pub struct SnapshotPageCache {
    options: SnapshotOptions,
    pages: DashMap<u64, Arc<Page>>,
}

impl SnapshotPageCache {
    /// Empty cache over the configured snapshot folders.
    pub fn new(options: SnapshotOptions) -> SnapshotPageCache {
        SnapshotPageCache {
            options,
            pages: DashMap::new(),
        }
    }

    /// Cached page count, for tests and gauges.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether nothing is cached yet.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn load_page(&self, pointer: SnapshotPagePointer) -> CodeResult<Arc<Page>> {
        if self.options.emulation.emulated_read_latency_us > 0 {
            std::thread::sleep(std::time::Duration::from_micros(
                self.options.emulation.emulated_read_latency_us,
            ));
        }
        let path = snapshot_file_path(&self.options, pointer.snapshot_id(), pointer.node());
        let mut file = File::open(&path).map_err(|_| ErrorCode::SnapshotIo)?;
        file.seek(SeekFrom::Start(pointer.page_index() * PAGE_SIZE as u64))
            .map_err(|_| ErrorCode::SnapshotIo)?;
        let mut bytes = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut bytes).map_err(|_| ErrorCode::SnapshotIo)?;
        let page = Page::new();
        page.deserialize_from(&bytes);
        if page.checksum() != page.compute_checksum() {
            return Err(ErrorCode::Corrupt);
        }
        Ok(Arc::new(page))
    }
}

impl SnapshotPageSource for SnapshotPageCache {
    fn read_page(&self, pointer: SnapshotPagePointer) -> CodeResult<Arc<Page>> {
        debug_assert!(!pointer.is_null());
        if let Some(cached) = self.pages.get(&pointer.raw()) {
            return Ok(Arc::clone(&cached));
        }
        let page = self.load_page(pointer)?;
        self.pages.insert(pointer.raw(), Arc::clone(&page));
        Ok(page)
    }
}

impl std::fmt::Debug for SnapshotPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPageCache")
            .field("cached_pages", &self.pages.len())
            .finish()
    }
}

/// One storage's entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStorage {
    /// Metadata to rebuild the storage handle.
    pub metadata: StorageMetadata,
    /// Raw word of the storage's new root snapshot pointer.
    pub root_pointer: u64,
}

/// The durable description of one snapshot: written last, read first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Snapshot id (monotone per engine).
    pub snapshot_id: u16,
    /// Records strictly after this epoch are included...
    pub base_epoch: Epoch,
    /// ...up to and including this one.
    pub valid_until: Epoch,
    /// Every storage with its new root.
    pub storages: Vec<ManifestStorage>,
}

impl SnapshotManifest {
    fn current_path(options: &SnapshotOptions) -> PathBuf {
        options.folder_path(0).join("manifest_current.json")
    }

    fn numbered_path(options: &SnapshotOptions, snapshot_id: u16) -> PathBuf {
        options
            .folder_path(0)
            .join(format!("manifest_{}.json", snapshot_id))
    }

    /// Persist this manifest (numbered + current). The rename-free double
    /// write is fine here: the numbered file is the authority and the
    /// current file is rewritten from it on the next cycle.
    pub fn save(&self, options: &SnapshotOptions) -> StackResult<()> {
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| ErrorStack::new(ErrorCode::Corrupt, e.to_string()))?;
        let numbered = Self::numbered_path(options, self.snapshot_id);
        std::fs::write(&numbered, &body).map_err(|e| io_error(&numbered, e))?;
        let current = Self::current_path(options);
        std::fs::write(&current, &body).map_err(|e| io_error(&current, e))?;
        Ok(())
    }

    /// Load the latest manifest, or `None` when no snapshot exists yet.
    pub fn load_current(options: &SnapshotOptions) -> StackResult<Option<SnapshotManifest>> {
        let path = Self::current_path(options);
        if !path.exists() {
            return Ok(None);
        }
        let body = std::fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        let manifest = serde_json::from_str(&body)
            .map_err(|e| ErrorStack::new(ErrorCode::Corrupt, e.to_string()))?;
        Ok(Some(manifest))
    }
}
