//! Log mapper: per-node reader that buckets redo records by partition.
//!
//! One mapper runs per NUMA node and cycle. It walks its node's thread
//! log streams (idle → reading → flushing → signalling), keeps the
//! records whose epoch falls in `(base_epoch, valid_until]`, tags each
//! with its target partition, and hands buckets of
//! `log_mapper_bucket_kb` to the owning reducer as they fill. The epoch
//! of a record is carried by the preceding epoch mark in its stream.
//!
//! Partitioning: array records go to the node that owns their leaf;
//! sequential records stay on the appending thread's node, which is the
//! mapper's own.
//!
//! The mapper polls its barrier's stop flag between records: when the
//! gleaner winds a failing cycle down, in-flight mappers bail out instead
//! of finishing their streams.

use crate::gleaner::GleanerBarrier;
use cinder_core::epoch::Epoch;
use cinder_core::error::{ErrorCode, ErrorStack, StackResult};
use cinder_core::log::{decode_epoch_mark, iter_records, ArrayOverwriteRedo, RedoKind};
use cinder_core::xct_id::XctId;
use cinder_core::{StorageId, ThreadId};
use cinder_storage::{StorageRef, StorageRegistry};
use std::sync::mpsc::Sender;
use tracing::debug;

/// One redo record on its way through the snapshot pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoTuple {
    /// Target storage.
    pub storage_id: StorageId,
    /// Sort key within the storage (array: record ordinal; sequential: 0,
    /// ordering is by transaction alone).
    pub key: u64,
    /// Issuing transaction; the tie-breaker that makes later writers win.
    pub xct_id: XctId,
    /// Record kind.
    pub kind: RedoKind,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
}

impl RedoTuple {
    /// Total sort key: `(storage, key, xct serial)` ascending.
    pub fn sort_key(&self) -> (StorageId, u64, u64) {
        (self.storage_id, self.key, self.xct_id.serial_word())
    }

    /// Rough arena footprint, for buffer accounting.
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<RedoTuple>() + self.payload.len()
    }
}

/// Outcome of one mapper run.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapperStats {
    /// Records inside the epoch window, bucketed and sent.
    pub mapped_records: u64,
    /// Records outside the window, skipped.
    pub skipped_records: u64,
    /// Buckets handed to reducers.
    pub buckets_sent: u64,
}

/// Count the records a mapper would keep for the window, without
/// decoding payloads. The gleaner uses this to skip cycles that would
/// snapshot nothing.
pub fn count_records_in_window(
    streams: &[(ThreadId, Vec<u8>)],
    base_epoch: Epoch,
    valid_until: Epoch,
) -> u64 {
    let mut count = 0;
    for (_, bytes) in streams {
        let mut record_epoch = Epoch::INVALID;
        for record in iter_records(bytes) {
            match record.header.kind {
                RedoKind::EpochMark => {
                    if let Some(epoch) = decode_epoch_mark(record.payload) {
                        record_epoch = epoch;
                    }
                }
                RedoKind::Filler => {}
                _ => {
                    if record_epoch.is_valid()
                        && base_epoch.before(record_epoch)
                        && record_epoch.before_or_equal(valid_until)
                    {
                        count += 1;
                    }
                }
            }
        }
    }
    count
}

/// Map one node's streams into the per-partition reducer channels.
pub fn run_mapper(
    node: u8,
    streams: &[(ThreadId, Vec<u8>)],
    base_epoch: Epoch,
    valid_until: Epoch,
    registry: &StorageRegistry,
    senders: &[Sender<Vec<RedoTuple>>],
    bucket_kb: usize,
    barrier: &GleanerBarrier,
) -> StackResult<MapperStats> {
    let bucket_budget = bucket_kb.max(1) << 10;
    let partitions = senders.len();
    let mut buckets: Vec<Vec<RedoTuple>> = (0..partitions).map(|_| Vec::new()).collect();
    let mut bucket_bytes = vec![0usize; partitions];
    let mut stats = MapperStats::default();

    for (thread, bytes) in streams {
        let mut record_epoch = Epoch::INVALID;
        for record in iter_records(bytes) {
            if barrier.is_stop_requested() {
                return Err(ErrorStack::new(
                    ErrorCode::SnapshotCycleFailed,
                    "mapper wound down by stop request",
                ));
            }
            match record.header.kind {
                RedoKind::EpochMark => {
                    record_epoch = decode_epoch_mark(record.payload).ok_or_else(|| {
                        ErrorStack::new(
                            ErrorCode::Corrupt,
                            format!("bad epoch mark in thread {} log", thread),
                        )
                    })?;
                    continue;
                }
                RedoKind::Filler => continue,
                RedoKind::ArrayOverwrite | RedoKind::SequentialAppend => {}
            }
            debug_assert!(record_epoch.is_valid(), "record before any epoch mark");
            let in_window = base_epoch.before(record_epoch)
                && record_epoch.before_or_equal(valid_until);
            if !in_window {
                stats.skipped_records += 1;
                continue;
            }

            let (key, partition) = match record.header.kind {
                RedoKind::ArrayOverwrite => {
                    let redo = ArrayOverwriteRedo::decode(record.payload).ok_or_else(|| {
                        ErrorStack::new(
                            ErrorCode::Corrupt,
                            format!("bad array redo in thread {} log", thread),
                        )
                    })?;
                    let partition = match registry.get(record.header.storage_id) {
                        Some(StorageRef::Array(array)) => {
                            registry.partition_of_array_record(&array, redo.record)
                        }
                        _ => {
                            return Err(ErrorStack::new(
                                ErrorCode::StorageNotFound,
                                format!(
                                    "log names unknown storage {}",
                                    record.header.storage_id
                                ),
                            ))
                        }
                    };
                    (redo.record, partition)
                }
                RedoKind::SequentialAppend => (0, node),
                _ => unreachable!(),
            };

            let tuple = RedoTuple {
                storage_id: record.header.storage_id,
                key,
                xct_id: record.header.xct_id,
                kind: record.header.kind,
                payload: record.payload.to_vec(),
            };
            let p = partition as usize;
            bucket_bytes[p] += tuple.footprint();
            buckets[p].push(tuple);
            stats.mapped_records += 1;

            if bucket_bytes[p] >= bucket_budget {
                let full = std::mem::take(&mut buckets[p]);
                bucket_bytes[p] = 0;
                stats.buckets_sent += 1;
                senders[p].send(full).map_err(|_| {
                    ErrorStack::new(
                        ErrorCode::SnapshotCycleFailed,
                        "reducer went away mid-cycle",
                    )
                })?;
            }
        }
    }

    // Flush the partial buckets.
    for (p, bucket) in buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        stats.buckets_sent += 1;
        senders[p].send(bucket).map_err(|_| {
            ErrorStack::new(
                ErrorCode::SnapshotCycleFailed,
                "reducer went away mid-cycle",
            )
        })?;
    }
    debug!(
        node,
        mapped = stats.mapped_records,
        skipped = stats.skipped_records,
        buckets = stats.buckets_sent,
        "mapper finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::log::{encode_epoch_mark, RedoHeader, RECORD_HEADER_SIZE};
    use cinder_core::page::Page;
    use cinder_core::traits::SnapshotPageSource;
    use cinder_core::PagePools;
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    struct NoSnapshots;
    impl SnapshotPageSource for NoSnapshots {
        fn read_page(
            &self,
            _pointer: cinder_core::SnapshotPagePointer,
        ) -> cinder_core::CodeResult<Arc<Page>> {
            Err(ErrorCode::SnapshotIo)
        }
    }

    fn array_record(storage: StorageId, record: u64, epoch: u32, ordinal: u32) -> Vec<u8> {
        let redo = ArrayOverwriteRedo {
            record,
            payload_offset: 0,
            bytes: &[1, 2, 3, 4],
        };
        let mut out = vec![0u8; redo.record_len()];
        redo.encode_record(storage, &mut out);
        let id = XctId::new(Epoch::from_raw(epoch), ordinal);
        out[8..16].copy_from_slice(&id.raw().to_le_bytes());
        out
    }

    #[test]
    fn maps_only_the_epoch_window() {
        let registry = StorageRegistry::new(PagePools::new(1, 128), Arc::new(NoSnapshots));
        let array = registry.create_array("t", 16, 8).unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_epoch_mark(Epoch::from_raw(2)));
        stream.extend_from_slice(&array_record(array.id(), 1, 2, 1)); // at base: skipped
        stream.extend_from_slice(&encode_epoch_mark(Epoch::from_raw(3)));
        stream.extend_from_slice(&array_record(array.id(), 2, 3, 1)); // in window
        stream.extend_from_slice(&encode_epoch_mark(Epoch::from_raw(9)));
        stream.extend_from_slice(&array_record(array.id(), 3, 9, 1)); // past window

        let (sender, receiver) = channel();
        let stats = run_mapper(
            0,
            &[(0, stream)],
            Epoch::from_raw(2),
            Epoch::from_raw(5),
            &registry,
            &[sender],
            64,
            &GleanerBarrier::new(1),
        )
        .unwrap();
        assert_eq!(stats.mapped_records, 1);
        assert_eq!(stats.skipped_records, 2);

        let bucket = receiver.recv().unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].key, 2);
        assert_eq!(bucket[0].xct_id.epoch(), Epoch::from_raw(3));
    }

    #[test]
    fn sequential_records_stay_on_the_mapper_node() {
        let registry = StorageRegistry::new(PagePools::new(2, 128), Arc::new(NoSnapshots));
        let seq = registry.create_sequential("hist").unwrap();

        let mut record = vec![0u8; RECORD_HEADER_SIZE + 5];
        RedoHeader {
            length: record.len() as u16,
            kind: RedoKind::SequentialAppend,
            storage_id: seq.id(),
            xct_id: XctId::new(Epoch::from_raw(3), 1),
        }
        .encode_into(&mut record);
        record[RECORD_HEADER_SIZE..].copy_from_slice(b"hello");

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_epoch_mark(Epoch::from_raw(3)));
        stream.extend_from_slice(&record);

        let (s0, r0) = channel();
        let (s1, r1) = channel();
        run_mapper(
            1,
            &[(4, stream)],
            Epoch::from_raw(1),
            Epoch::from_raw(5),
            &registry,
            &[s0, s1],
            64,
            &GleanerBarrier::new(1),
        )
        .unwrap();
        assert!(r0.try_recv().is_err());
        let bucket = r1.recv().unwrap();
        assert_eq!(bucket[0].payload, b"hello");
    }

    #[test]
    fn stop_request_short_circuits_the_stream_walk() {
        let registry = StorageRegistry::new(PagePools::new(1, 128), Arc::new(NoSnapshots));
        let array = registry.create_array("t", 16, 8).unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_epoch_mark(Epoch::from_raw(3)));
        stream.extend_from_slice(&array_record(array.id(), 1, 3, 1));

        let barrier = GleanerBarrier::new(1);
        barrier.shutdown();
        let (sender, receiver) = channel();
        let err = run_mapper(
            0,
            &[(0, stream)],
            Epoch::from_raw(1),
            Epoch::from_raw(5),
            &registry,
            &[sender],
            64,
            &barrier,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SnapshotCycleFailed);
        // Nothing reached the reducer side.
        assert!(receiver.try_recv().is_err());
    }
}
