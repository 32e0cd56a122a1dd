//! Cross-crate seams.

use crate::error::CodeResult;
use crate::page::{Page, SnapshotPagePointer};
use std::sync::Arc;

/// Resolves snapshot page pointers to immutable page images.
///
/// Implemented by the snapshot file cache one crate up; storages hold it as
/// a handle so record reads can fall through to snapshot pages without
/// knowing about files. Returned pages are shared and never mutated.
pub trait SnapshotPageSource: Send + Sync {
    /// Fetch the page behind a non-null snapshot pointer.
    fn read_page(&self, pointer: SnapshotPagePointer) -> CodeResult<Arc<Page>>;
}
