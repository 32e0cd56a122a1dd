//! Shared helpers for engine integration tests.

use cinder_engine::EngineOptions;
use std::path::Path;

/// Test-sized options with logs and snapshots under `root`.
pub fn engine_options(root: &Path) -> EngineOptions {
    EngineOptions::for_testing().with_paths_under(root)
}
