//! Core types for the cinder storage engine.
//!
//! This crate holds everything the upper layers share:
//! - [`epoch`]: the wrap-aware engine clock;
//! - [`xct_id`]: transaction version words and the record lock embedded
//!   beside them;
//! - [`page`]: 4 KiB pages, page versions, and the dual volatile/snapshot
//!   pointer model;
//! - [`memory`]: per-node volatile page pools;
//! - [`log`]: the redo-record wire format and per-thread log buffers;
//! - [`error`]: the two-layer error model;
//! - [`options`]: the serde configuration tree.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod epoch;
pub mod error;
pub mod log;
pub mod memory;
pub mod options;
pub mod page;
pub mod traits;
pub mod xct_id;

pub use epoch::{AtomicEpoch, Epoch};
pub use error::{CodeResult, ErrorCode, ErrorStack, StackResult};
pub use memory::{PagePool, PagePoolOffsetChunk, PagePools};
pub use options::{
    convert_folder_path_pattern, DeviceEmulationOptions, EngineOptions, LogOptions,
    MemoryOptions, SnapshotOptions, XctOptions,
};
pub use page::{
    DualPagePointer, Page, PageVersion, PageVersionStatus, SnapshotPagePointer,
    VolatilePagePointer, PAGE_DATA_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE,
};
pub use traits::SnapshotPageSource;
pub use xct_id::{RwLockableXctId, XctId, MAX_ORDINAL};

/// Storage identifier. Dense, nonzero for registered storages.
pub type StorageId = u32;

/// Logical thread identifier, unique across nodes.
pub type ThreadId = u16;
