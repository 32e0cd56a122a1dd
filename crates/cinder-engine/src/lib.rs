//! cinder: an embedded, main-memory OLTP storage engine.
//!
//! Serializable optimistic transactions over a volatile page pool,
//! durable redo logging, and asynchronous snapshots that migrate cold
//! data into immutable on-disk pages.
//!
//! ```no_run
//! use cinder_engine::{Engine, EngineOptions, IsolationLevel};
//!
//! let engine = Engine::new(EngineOptions::default()).unwrap();
//! let accounts = engine.registry().create_array("accounts", 16, 1024).unwrap();
//!
//! let mut ctx = engine.attach_thread();
//! ctx.begin(IsolationLevel::Serializable).unwrap();
//! accounts.overwrite_primitive::<i64>(ctx.xct(), 42, 100, 0).unwrap();
//! let commit_epoch = ctx.precommit().unwrap();
//! engine.wait_for_commit(commit_epoch).unwrap();
//! ```

#![warn(clippy::all)]

mod engine;

pub use engine::{Engine, ThreadContext};

pub use cinder_core::{
    Epoch, EngineOptions, ErrorCode, ErrorStack, LogOptions, MemoryOptions, SnapshotOptions,
    XctId, XctOptions,
};
pub use cinder_durability::{CycleOutcome, SnapshotManifest};
pub use cinder_storage::{
    ArrayStorage, Primitive, SequentialStorage, StorageMetadata, StorageRef, StorageRegistry,
    StorageType,
};
pub use cinder_xct::{IsolationLevel, Xct, XctManager};
