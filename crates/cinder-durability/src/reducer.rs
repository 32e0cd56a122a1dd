//! Log reducer: per-partition sorter of redo tuples.
//!
//! One reducer runs per NUMA node and cycle. Buckets from the mappers
//! accumulate in a `log_reducer_buffer_mb` arena; when the arena
//! overflows, the current batch is sorted and spilled to a run file.
//! After the mappers close their channels, the in-memory rest is sorted
//! and merged with the spilled runs.
//!
//! The output is totally ordered by `(storage_id, key, xct_id)` with the
//! transaction id ascending, so a composer replaying the sequence in
//! order applies later writers last. Every record is emitted; last-wins
//! collapsing is the array composer's business; sequential composers
//! want the full history.
//!
//! Like the mapper, the reducer polls its barrier's stop flag per bucket
//! so a failing cycle winds down without draining every channel.

use crate::gleaner::GleanerBarrier;
use crate::mapper::RedoTuple;
use cinder_core::error::{ErrorCode, ErrorStack, StackResult};
use cinder_core::log::RedoKind;
use cinder_core::xct_id::XctId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use tracing::debug;

/// Outcome of one reducer run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReducerStats {
    /// Tuples received from mappers.
    pub received: u64,
    /// Runs spilled to disk.
    pub spilled_runs: u64,
}

/// Sort everything arriving on `receiver` into one ordered vector.
/// `spill_dir` hosts run files when the arena budget overflows.
pub fn run_reducer(
    node: u8,
    receiver: Receiver<Vec<RedoTuple>>,
    buffer_mb: usize,
    spill_dir: &Path,
    barrier: &GleanerBarrier,
) -> StackResult<(Vec<RedoTuple>, ReducerStats)> {
    let budget = buffer_mb.max(1) << 20;
    let mut arena: Vec<RedoTuple> = Vec::new();
    let mut arena_bytes = 0usize;
    let mut runs: Vec<PathBuf> = Vec::new();
    let mut stats = ReducerStats::default();

    while let Ok(bucket) = receiver.recv() {
        if barrier.is_stop_requested() {
            for run in &runs {
                let _ = std::fs::remove_file(run);
            }
            return Err(ErrorStack::new(
                ErrorCode::SnapshotCycleFailed,
                "reducer wound down by stop request",
            ));
        }
        for tuple in bucket {
            arena_bytes += tuple.footprint();
            arena.push(tuple);
            stats.received += 1;
        }
        if arena_bytes >= budget {
            let run_path = spill_dir.join(format!(
                "reducer_{}_run_{}.tmp",
                node,
                runs.len()
            ));
            spill_run(&mut arena, &run_path)?;
            arena_bytes = 0;
            stats.spilled_runs += 1;
            runs.push(run_path);
        }
    }

    // `sort_by` is stable: two writes by one transaction to one record
    // keep their application order.
    arena.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let merged = if runs.is_empty() {
        arena
    } else {
        let merged = merge_runs(arena, &runs)?;
        for run in &runs {
            let _ = std::fs::remove_file(run);
        }
        merged
    };
    debug!(
        node,
        received = stats.received,
        runs = stats.spilled_runs,
        "reducer finished"
    );
    Ok((merged, stats))
}

/// Sort the arena and write it out as one run file.
fn spill_run(arena: &mut Vec<RedoTuple>, path: &Path) -> StackResult<()> {
    arena.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let file = File::create(path)
        .map_err(|e| ErrorStack::new(ErrorCode::SnapshotIo, format!("{}: {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    for tuple in arena.drain(..) {
        write_tuple(&mut writer, &tuple)
            .map_err(|e| ErrorStack::new(ErrorCode::SnapshotIo, format!("{}: {}", path.display(), e)))?;
    }
    writer
        .flush()
        .map_err(|e| ErrorStack::new(ErrorCode::SnapshotIo, format!("{}: {}", path.display(), e)))?;
    Ok(())
}

fn write_tuple(writer: &mut impl Write, tuple: &RedoTuple) -> std::io::Result<()> {
    writer.write_all(&tuple.storage_id.to_le_bytes())?;
    writer.write_all(&tuple.key.to_le_bytes())?;
    writer.write_all(&tuple.xct_id.raw().to_le_bytes())?;
    writer.write_all(&(tuple.kind as u16).to_le_bytes())?;
    writer.write_all(&(tuple.payload.len() as u32).to_le_bytes())?;
    writer.write_all(&tuple.payload)
}

fn read_tuple(reader: &mut impl Read) -> StackResult<Option<RedoTuple>> {
    let mut head = [0u8; 26];
    match reader.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ErrorStack::new(ErrorCode::SnapshotIo, e.to_string())),
    }
    let storage_id = u32::from_le_bytes(head[0..4].try_into().unwrap());
    let key = u64::from_le_bytes(head[4..12].try_into().unwrap());
    let xct_id = XctId::from_raw(u64::from_le_bytes(head[12..20].try_into().unwrap()));
    let kind = RedoKind::from_wire(u16::from_le_bytes(head[20..22].try_into().unwrap()))
        .ok_or_else(|| ErrorStack::new(ErrorCode::Corrupt, "bad kind in reducer run"))?;
    let len = u32::from_le_bytes(head[22..26].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| ErrorStack::new(ErrorCode::SnapshotIo, e.to_string()))?;
    Ok(Some(RedoTuple {
        storage_id,
        key,
        xct_id,
        kind,
        payload,
    }))
}

/// K-way merge of the sorted in-memory rest and the sorted run files.
/// Ties break by source index (runs in spill order, memory last), which
/// preserves arrival order for records with identical keys.
fn merge_runs(memory: Vec<RedoTuple>, runs: &[PathBuf]) -> StackResult<Vec<RedoTuple>> {
    struct Source {
        reader: Option<BufReader<File>>,
        memory: std::vec::IntoIter<RedoTuple>,
    }

    impl Source {
        fn next(&mut self) -> StackResult<Option<RedoTuple>> {
            match &mut self.reader {
                Some(reader) => read_tuple(reader),
                None => Ok(self.memory.next()),
            }
        }
    }

    let mut sources: Vec<Source> = Vec::with_capacity(runs.len() + 1);
    for run in runs {
        let file = File::open(run).map_err(|e| {
            ErrorStack::new(ErrorCode::SnapshotIo, format!("{}: {}", run.display(), e))
        })?;
        sources.push(Source {
            reader: Some(BufReader::new(file)),
            memory: Vec::new().into_iter(),
        });
    }
    sources.push(Source {
        reader: None,
        memory: memory.into_iter(),
    });

    let mut heap: BinaryHeap<Reverse<((u32, u64, u64), usize)>> = BinaryHeap::new();
    let mut heads: Vec<Option<RedoTuple>> = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter_mut().enumerate() {
        let head = source.next()?;
        if let Some(tuple) = &head {
            heap.push(Reverse((tuple.sort_key(), index)));
        }
        heads.push(head);
    }

    let mut merged = Vec::new();
    while let Some(Reverse((_, index))) = heap.pop() {
        let tuple = heads[index].take().expect("head tracked by heap");
        merged.push(tuple);
        let next = sources[index].next()?;
        if let Some(tuple) = &next {
            heap.push(Reverse((tuple.sort_key(), index)));
        }
        heads[index] = next;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::epoch::Epoch;
    use std::sync::mpsc::channel;

    fn tuple(storage: u32, key: u64, epoch: u32, ordinal: u32, payload: &[u8]) -> RedoTuple {
        RedoTuple {
            storage_id: storage,
            key,
            xct_id: XctId::new(Epoch::from_raw(epoch), ordinal),
            kind: RedoKind::ArrayOverwrite,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn sorts_by_storage_key_then_xct() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = channel();
        sender
            .send(vec![
                tuple(2, 1, 3, 1, b"late-storage"),
                tuple(1, 5, 4, 2, b"k5-late"),
                tuple(1, 5, 4, 1, b"k5-early"),
                tuple(1, 2, 9, 1, b"k2"),
            ])
            .unwrap();
        drop(sender);

        let (sorted, stats) =
            run_reducer(0, receiver, 4, dir.path(), &GleanerBarrier::new(1)).unwrap();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.spilled_runs, 0);
        let keys: Vec<(u32, u64, u32)> = sorted
            .iter()
            .map(|t| (t.storage_id, t.key, t.xct_id.ordinal()))
            .collect();
        assert_eq!(keys, vec![(1, 2, 1), (1, 5, 1), (1, 5, 2), (2, 1, 1)]);
    }

    #[test]
    fn spills_and_merges_when_the_arena_overflows() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = channel();
        // ~2 MiB of tuples against a 1 MiB budget forces at least one
        // spill.
        let blob = vec![7u8; 64 << 10];
        for i in 0..32u64 {
            sender.send(vec![tuple(1, 100 - i, 3, 1, &blob)]).unwrap();
        }
        drop(sender);

        let (sorted, stats) =
            run_reducer(0, receiver, 1, dir.path(), &GleanerBarrier::new(1)).unwrap();
        assert_eq!(stats.received, 32);
        assert!(stats.spilled_runs >= 1);
        assert_eq!(sorted.len(), 32);
        assert!(sorted.windows(2).all(|p| p[0].key <= p[1].key));
        // Spill files are cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn stop_request_abandons_the_sort() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = channel();
        sender.send(vec![tuple(1, 1, 3, 1, b"x")]).unwrap();
        drop(sender);

        let barrier = GleanerBarrier::new(1);
        barrier.shutdown();
        let err = run_reducer(0, receiver, 4, dir.path(), &barrier).unwrap_err();
        assert_eq!(err.code, ErrorCode::SnapshotCycleFailed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
