//! Optimistic transaction engine for cinder.
//!
//! - [`access`]: the observation records a transaction accumulates;
//! - [`lock_list`]: current and retrospective lock lists;
//! - [`xct`]: the per-thread transaction object;
//! - [`manager`]: begin/precommit/abort, the epoch clock and chime, and
//!   the snapshot pause barrier.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod lock_list;
pub mod manager;
pub mod xct;

pub use access::{
    LockFreeWriteAccess, PageVersionAccess, PointerAccess, ReadAccess, RecordAddress,
    WriteAccess,
};
pub use lock_list::{CurrentLockList, LockEntry, LockMode, RetrospectiveLockList};
pub use manager::{MovedRecordResolver, XctManager};
pub use xct::{IsolationLevel, Xct, MAX_PAGE_VERSION_SETS, MAX_POINTER_SETS};
