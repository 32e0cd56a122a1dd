//! Error model for cinder.
//!
//! Two layers, matching how errors actually travel through the engine:
//!
//! - [`ErrorCode`] is a flat, `Copy` enum returned by inner operations on
//!   hot paths (record reads, set insertion, page allocation). No
//!   allocation, no capture site.
//! - [`ErrorStack`] wraps a code with a message and the capture location at
//!   boundary operations (storage creation, snapshot cycles, engine
//!   start/stop). Constructed via `#[track_caller]`, so the `file:line` of
//!   the failing call is recorded without macros.
//!
//! ## Classification
//!
//! - **Concurrency conflicts** (`RaceAbort`, `LockAbort`): recovered by
//!   retrying the whole transaction, usually with the retrospective lock
//!   list populated. `ErrorCode::is_race` identifies them.
//! - **Capacity exhaustion** (`ReadSetOverflow`, `WriteSetOverflow`,
//!   `PointerSetOverflow`, `PageVersionSetOverflow`, `LocalWorkMemoryFull`,
//!   `PoolExhausted`): surfaced to the caller, who may raise the configured
//!   caps and retry.
//! - **Structural errors** (everything else): not retryable as-is. A
//!   structural error inside a snapshot cycle abandons the cycle; in-flight
//!   transactions keep running against the last good snapshot.

use std::panic::Location;
use thiserror::Error;

/// Flat error code used by inner engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Record ordinal is out of the storage's range.
    #[error("record is out of range for this storage")]
    InvalidRecord,
    /// No storage registered under the given id or name.
    #[error("storage not found")]
    StorageNotFound,
    /// A storage with this name already exists.
    #[error("storage name already in use")]
    DuplicateStorageName,
    /// Requested offset/length does not fit in the record payload.
    #[error("payload range out of bounds")]
    InvalidPayloadRange,
    /// Commit-time verification failed; retry the transaction.
    #[error("transaction aborted due to a race")]
    RaceAbort,
    /// Lock acquisition observed a conflicting state; retry the transaction.
    #[error("transaction aborted while taking locks")]
    LockAbort,
    /// Read set reached `max_read_set_size`.
    #[error("read set overflow")]
    ReadSetOverflow,
    /// Write set reached `max_write_set_size`.
    #[error("write set overflow")]
    WriteSetOverflow,
    /// Lock-free write set reached `max_lock_free_write_set_size`.
    #[error("lock-free write set overflow")]
    LockFreeWriteSetOverflow,
    /// Pointer set reached its fixed capacity.
    #[error("pointer set overflow")]
    PointerSetOverflow,
    /// Page-version set reached its fixed capacity.
    #[error("page version set overflow")]
    PageVersionSetOverflow,
    /// The transaction's local work memory is exhausted.
    #[error("no more local work memory")]
    LocalWorkMemoryFull,
    /// The volatile page pool has no free pages.
    #[error("volatile page pool exhausted")]
    PoolExhausted,
    /// The storage cannot hold the requested record count.
    #[error("storage capacity exceeded")]
    CapacityExceeded,
    /// Operation requires an active (or inactive) transaction and found the
    /// opposite.
    #[error("invalid transaction state")]
    InvalidXctState,
    /// I/O failure in the log writer/reader.
    #[error("log file I/O error")]
    LogIo,
    /// I/O failure while reading or writing snapshot files.
    #[error("snapshot file I/O error")]
    SnapshotIo,
    /// The snapshot cycle was abandoned after a worker error.
    #[error("snapshot cycle failed")]
    SnapshotCycleFailed,
    /// Checksum mismatch or malformed on-disk data.
    #[error("corrupt data encountered")]
    Corrupt,
}

impl ErrorCode {
    /// Whether this code is a concurrency conflict, recoverable by retrying
    /// the transaction from the top.
    pub fn is_race(&self) -> bool {
        matches!(self, ErrorCode::RaceAbort | ErrorCode::LockAbort)
    }

    /// Whether this code is a capacity limit the caller can raise via
    /// configuration.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            ErrorCode::ReadSetOverflow
                | ErrorCode::WriteSetOverflow
                | ErrorCode::LockFreeWriteSetOverflow
                | ErrorCode::PointerSetOverflow
                | ErrorCode::PageVersionSetOverflow
                | ErrorCode::LocalWorkMemoryFull
                | ErrorCode::PoolExhausted
        )
    }
}

/// Boundary error: an [`ErrorCode`] plus a message and the capture site.
#[derive(Debug, Clone, Error)]
#[error("{code} at {location}: {message}")]
pub struct ErrorStack {
    /// Underlying code.
    pub code: ErrorCode,
    /// Human-readable context from the failing boundary.
    pub message: String,
    /// Source location that constructed this stack.
    pub location: &'static Location<'static>,
}

impl ErrorStack {
    /// Wrap a code with context, capturing the caller's location.
    #[track_caller]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorStack {
            code,
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Whether the underlying code is a retryable race.
    pub fn is_race(&self) -> bool {
        self.code.is_race()
    }
}

impl From<ErrorCode> for ErrorStack {
    #[track_caller]
    fn from(code: ErrorCode) -> Self {
        ErrorStack::new(code, "")
    }
}

/// Result alias for inner operations.
pub type CodeResult<T> = Result<T, ErrorCode>;

/// Result alias for boundary operations.
pub type StackResult<T> = Result<T, ErrorStack>;
