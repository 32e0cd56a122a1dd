//! Engine configuration.
//!
//! Plain serde structs with builder-style `with_*` helpers and a
//! `for_testing()` constructor per group. The whole tree persists as one
//! JSON document and round-trips losslessly; every enumerated option keeps
//! its value across save → load.
//!
//! Folder patterns contain the placeholder `$NODE$`, substituted per NUMA
//! node: `/data/node_$NODE$` becomes `/data/node_3` on node 3.

use crate::error::{ErrorCode, ErrorStack, StackResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder replaced by the node id in folder patterns.
pub const NODE_PLACEHOLDER: &str = "$NODE$";

/// Substitute the node id into a folder pattern.
pub fn convert_folder_path_pattern(pattern: &str, node: u8) -> PathBuf {
    PathBuf::from(pattern.replace(NODE_PLACEHOLDER, &node.to_string()))
}

/// Volatile pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOptions {
    /// Number of NUMA nodes to model (one page pool and one snapshot
    /// partition per node).
    pub node_count: u8,
    /// Page frames per node pool.
    pub pool_pages_per_node: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        MemoryOptions {
            node_count: 1,
            pool_pages_per_node: 1 << 16,
        }
    }
}

impl MemoryOptions {
    /// Small pools for unit tests.
    pub fn for_testing() -> Self {
        MemoryOptions {
            node_count: 1,
            pool_pages_per_node: 1 << 10,
        }
    }
}

/// Transaction-engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XctOptions {
    /// Read-set entries per transaction before `ReadSetOverflow`.
    pub max_read_set_size: usize,
    /// Write-set entries per transaction before `WriteSetOverflow`.
    pub max_write_set_size: usize,
    /// Lock-free write-set entries per transaction.
    pub max_lock_free_write_set_size: usize,
    /// Bump-arena bytes reset on every activate, in KiB.
    pub local_work_memory_kb: usize,
    /// Largest ordinal issued within one epoch. Exceeding it advances the
    /// epoch. The default is the full 24-bit space; tests shrink it to
    /// exercise the overflow path.
    pub max_ordinal: u32,
    /// Epoch chime period.
    pub epoch_advance_interval_ms: u64,
    /// Budget for the snapshot install pause; volatile drops beyond it are
    /// abandoned until the next cycle.
    pub max_pause_ms: u64,
}

impl Default for XctOptions {
    fn default() -> Self {
        XctOptions {
            max_read_set_size: 32 << 10,
            max_write_set_size: 8 << 10,
            max_lock_free_write_set_size: 4 << 10,
            local_work_memory_kb: 1 << 10,
            max_ordinal: crate::xct_id::MAX_ORDINAL,
            epoch_advance_interval_ms: 20,
            max_pause_ms: 100,
        }
    }
}

impl XctOptions {
    /// Tight limits for unit tests.
    pub fn for_testing() -> Self {
        XctOptions {
            max_read_set_size: 1 << 10,
            max_write_set_size: 1 << 10,
            max_lock_free_write_set_size: 1 << 10,
            local_work_memory_kb: 256,
            epoch_advance_interval_ms: 5,
            ..Default::default()
        }
    }

    /// Override the ordinal space.
    pub fn with_max_ordinal(mut self, max_ordinal: u32) -> Self {
        self.max_ordinal = max_ordinal;
        self
    }
}

/// Durable log writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Folder pattern for per-node log directories (`$NODE$` substituted).
    pub folder_path_pattern: String,
    /// Background flush period.
    pub flush_interval_ms: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            folder_path_pattern: "logs/node_$NODE$".to_string(),
            flush_interval_ms: 20,
        }
    }
}

impl LogOptions {
    /// Log directory for one node.
    pub fn folder_path(&self, node: u8) -> PathBuf {
        convert_folder_path_pattern(&self.folder_path_pattern, node)
    }
}

/// Emulated device latency, for experiments only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceEmulationOptions {
    /// Added latency per snapshot-file read, microseconds.
    pub emulated_read_latency_us: u64,
    /// Added latency per snapshot-file write, microseconds.
    pub emulated_write_latency_us: u64,
}

/// Snapshot pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOptions {
    /// Folder pattern for per-node snapshot directories (`$NODE$`
    /// substituted).
    pub folder_path_pattern: String,
    /// Force a snapshot cycle when any pool's free percentage falls below
    /// this. 100 disables the pressure trigger.
    pub snapshot_trigger_page_pool_percent: u32,
    /// Time-based trigger period.
    pub snapshot_interval_milliseconds: u64,
    /// Mapper bucket size per partition, KiB. The larger, the less often
    /// each mapper hands buckets to reducers.
    pub log_mapper_bucket_kb: usize,
    /// Mapper read buffer for log files, KiB.
    pub log_mapper_io_buffer_kb: usize,
    /// Reducer in-memory sort arena, MiB; runs spill to disk beyond it.
    pub log_reducer_buffer_mb: usize,
    /// Emulated device latency.
    pub emulation: DeviceEmulationOptions,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        SnapshotOptions {
            folder_path_pattern: "snapshots/node_$NODE$".to_string(),
            snapshot_trigger_page_pool_percent: 100,
            snapshot_interval_milliseconds: 60_000,
            log_mapper_bucket_kb: 1024,
            log_mapper_io_buffer_kb: 1024,
            log_reducer_buffer_mb: 256,
            emulation: DeviceEmulationOptions::default(),
        }
    }
}

impl SnapshotOptions {
    /// Snapshot directory for one node.
    pub fn folder_path(&self, node: u8) -> PathBuf {
        convert_folder_path_pattern(&self.folder_path_pattern, node)
    }

    /// Small buffers for unit tests.
    pub fn for_testing() -> Self {
        SnapshotOptions {
            snapshot_interval_milliseconds: 3_600_000,
            log_mapper_bucket_kb: 64,
            log_mapper_io_buffer_kb: 64,
            log_reducer_buffer_mb: 4,
            ..Default::default()
        }
    }
}

/// The full engine configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Pool sizing.
    pub memory: MemoryOptions,
    /// Transaction tunables.
    pub xct: XctOptions,
    /// Log writer settings.
    pub log: LogOptions,
    /// Snapshot pipeline settings.
    pub snapshot: SnapshotOptions,
}

impl EngineOptions {
    /// Options sized for tests: tiny pools, fast chime, small buffers.
    /// Paths still need to be pointed into a temp directory by the caller.
    pub fn for_testing() -> Self {
        EngineOptions {
            memory: MemoryOptions::for_testing(),
            xct: XctOptions::for_testing(),
            log: LogOptions::default(),
            snapshot: SnapshotOptions::for_testing(),
        }
    }

    /// Rebase both folder patterns under `root`, keeping the `$NODE$`
    /// placeholder. The usual way tests point an engine into a tempdir.
    pub fn with_paths_under(mut self, root: &Path) -> Self {
        self.log.folder_path_pattern = root
            .join("logs/node_$NODE$")
            .to_string_lossy()
            .into_owned();
        self.snapshot.folder_path_pattern = root
            .join("snapshots/node_$NODE$")
            .to_string_lossy()
            .into_owned();
        self
    }

    /// Serialize to a pretty JSON document.
    pub fn save_to_file(&self, path: &Path) -> StackResult<()> {
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| ErrorStack::new(ErrorCode::Corrupt, e.to_string()))?;
        std::fs::write(path, body).map_err(|e| {
            ErrorStack::new(
                ErrorCode::LogIo,
                format!("saving options to {}: {}", path.display(), e),
            )
        })
    }

    /// Load a previously saved document.
    pub fn load_from_file(path: &Path) -> StackResult<EngineOptions> {
        let body = std::fs::read_to_string(path).map_err(|e| {
            ErrorStack::new(
                ErrorCode::LogIo,
                format!("loading options from {}: {}", path.display(), e),
            )
        })?;
        serde_json::from_str(&body)
            .map_err(|e| ErrorStack::new(ErrorCode::Corrupt, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_placeholder_is_substituted() {
        assert_eq!(
            convert_folder_path_pattern("/data/node_$NODE$", 3),
            PathBuf::from("/data/node_3")
        );
        let opts = SnapshotOptions {
            folder_path_pattern: "/data/node_$NODE$".to_string(),
            ..Default::default()
        };
        assert_eq!(opts.folder_path(0), PathBuf::from("/data/node_0"));
    }

    #[test]
    fn options_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");

        let mut options = EngineOptions::default();
        options.snapshot.folder_path_pattern = "/data/node_$NODE$".to_string();
        options.snapshot.snapshot_trigger_page_pool_percent = 25;
        options.snapshot.snapshot_interval_milliseconds = 777;
        options.snapshot.log_mapper_bucket_kb = 512;
        options.snapshot.log_mapper_io_buffer_kb = 2048;
        options.snapshot.log_reducer_buffer_mb = 99;
        options.snapshot.emulation.emulated_read_latency_us = 5;
        options.xct.max_ordinal = 8;

        options.save_to_file(&path).unwrap();
        let loaded = EngineOptions::load_from_file(&path).unwrap();
        assert_eq!(loaded, options);
        assert_eq!(
            convert_folder_path_pattern(&loaded.snapshot.folder_path_pattern, 3),
            PathBuf::from("/data/node_3")
        );
    }
}
