//! Redo-log record format and the per-thread log buffer.
//!
//! # Record layout
//!
//! ```text
//! ┌─────────────┬───────────┬─────────────────┬──────────────────────┐
//! │ length (2)  │ kind (2)  │ storage_id (4)  │ xct_id (16)          │
//! ├─────────────┴───────────┴─────────────────┴──────────────────────┤
//! │ payload (length - 24 bytes, layout per kind)                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The id field reserves 16 bytes for the
//! full version word; the serial word occupies the low 8 and the high 8
//! are written as zero. Records inside one thread's stream are
//! epoch-ordered, with [`RedoKind::EpochMark`] records delimiting epoch
//! boundaries; a mark applies to every following record until the next
//! mark.
//!
//! Durable framing (block headers, checksums, files) is the log manager's
//! concern, one crate up. Here the stream is plain bytes so the mapper and
//! the commit path share one parser.

use crate::epoch::Epoch;
use crate::xct_id::XctId;
use parking_lot::Mutex;

/// Byte size of the common record header.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Discriminates redo record payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RedoKind {
    /// Epoch boundary marker; payload is the 4-byte epoch.
    EpochMark = 1,
    /// Array record overwrite; payload is `{record: u64, offset: u16,
    /// len: u16, bytes}`.
    ArrayOverwrite = 2,
    /// Sequential append; payload is the appended bytes.
    SequentialAppend = 3,
    /// Padding; skipped by every consumer.
    Filler = 4,
}

impl RedoKind {
    /// Parse the wire value.
    pub fn from_wire(value: u16) -> Option<RedoKind> {
        match value {
            1 => Some(RedoKind::EpochMark),
            2 => Some(RedoKind::ArrayOverwrite),
            3 => Some(RedoKind::SequentialAppend),
            4 => Some(RedoKind::Filler),
            _ => None,
        }
    }
}

/// Decoded common header of one redo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoHeader {
    /// Total record length, header included.
    pub length: u16,
    /// Payload discriminator.
    pub kind: RedoKind,
    /// Storage the record belongs to (0 for marks and filler).
    pub storage_id: u32,
    /// Issuing transaction's id (null for marks and filler).
    pub xct_id: XctId,
}

impl RedoHeader {
    /// Serialize into the first [`RECORD_HEADER_SIZE`] bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= RECORD_HEADER_SIZE);
        out[0..2].copy_from_slice(&self.length.to_le_bytes());
        out[2..4].copy_from_slice(&(self.kind as u16).to_le_bytes());
        out[4..8].copy_from_slice(&self.storage_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.xct_id.raw().to_le_bytes());
        out[16..24].copy_from_slice(&0u64.to_le_bytes());
    }

    /// Parse from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<RedoHeader> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let length = u16::from_le_bytes(bytes[0..2].try_into().ok()?);
        let kind = RedoKind::from_wire(u16::from_le_bytes(bytes[2..4].try_into().ok()?))?;
        let storage_id = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        let xct_id = XctId::from_raw(u64::from_le_bytes(bytes[8..16].try_into().ok()?));
        if (length as usize) < RECORD_HEADER_SIZE {
            return None;
        }
        Some(RedoHeader {
            length,
            kind,
            storage_id,
            xct_id,
        })
    }
}

/// A parsed record borrowed from a log stream.
#[derive(Debug, Clone, Copy)]
pub struct RedoRecordRef<'a> {
    /// Common header.
    pub header: RedoHeader,
    /// Kind-specific payload bytes.
    pub payload: &'a [u8],
}

/// Iterate the records packed in `bytes`. Stops at the first malformed
/// header; the caller decides whether a short tail is corruption.
pub fn iter_records(bytes: &[u8]) -> RecordIter<'_> {
    RecordIter { bytes, pos: 0 }
}

/// Iterator over a packed record stream.
#[derive(Debug)]
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordIter<'a> {
    /// Byte offset of the next unparsed record.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = RedoRecordRef<'a>;

    fn next(&mut self) -> Option<RedoRecordRef<'a>> {
        let rest = &self.bytes[self.pos..];
        let header = RedoHeader::decode(rest)?;
        let total = header.length as usize;
        if rest.len() < total {
            return None;
        }
        self.pos += total;
        Some(RedoRecordRef {
            header,
            payload: &rest[RECORD_HEADER_SIZE..total],
        })
    }
}

/// Payload of an [`RedoKind::ArrayOverwrite`] record:
/// `{record: u64, payload_offset: u16, len: u16, bytes}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayOverwriteRedo<'a> {
    /// Record ordinal within the array storage.
    pub record: u64,
    /// Byte offset within the record payload.
    pub payload_offset: u16,
    /// Bytes to place at that offset.
    pub bytes: &'a [u8],
}

impl<'a> ArrayOverwriteRedo<'a> {
    /// Encoded payload length.
    pub fn payload_len(&self) -> usize {
        12 + self.bytes.len()
    }

    /// Full record length including the common header.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload_len()
    }

    /// Serialize the whole record (header + payload) into `out`. The id
    /// field is stamped at commit time, so it is written as null here.
    pub fn encode_record(&self, storage_id: u32, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.record_len());
        RedoHeader {
            length: self.record_len() as u16,
            kind: RedoKind::ArrayOverwrite,
            storage_id,
            xct_id: XctId::NULL,
        }
        .encode_into(out);
        let p = &mut out[RECORD_HEADER_SIZE..];
        p[0..8].copy_from_slice(&self.record.to_le_bytes());
        p[8..10].copy_from_slice(&self.payload_offset.to_le_bytes());
        p[10..12].copy_from_slice(&(self.bytes.len() as u16).to_le_bytes());
        p[12..].copy_from_slice(self.bytes);
    }

    /// Parse from a record payload.
    pub fn decode(payload: &'a [u8]) -> Option<ArrayOverwriteRedo<'a>> {
        if payload.len() < 12 {
            return None;
        }
        let record = u64::from_le_bytes(payload[0..8].try_into().ok()?);
        let payload_offset = u16::from_le_bytes(payload[8..10].try_into().ok()?);
        let len = u16::from_le_bytes(payload[10..12].try_into().ok()?) as usize;
        if payload.len() < 12 + len {
            return None;
        }
        Some(ArrayOverwriteRedo {
            record,
            payload_offset,
            bytes: &payload[12..12 + len],
        })
    }
}

/// Build an epoch-mark record.
pub fn encode_epoch_mark(epoch: Epoch) -> [u8; RECORD_HEADER_SIZE + 4] {
    let mut out = [0u8; RECORD_HEADER_SIZE + 4];
    let header = RedoHeader {
        length: (RECORD_HEADER_SIZE + 4) as u16,
        kind: RedoKind::EpochMark,
        storage_id: 0,
        xct_id: XctId::NULL,
    };
    header.encode_into(&mut out);
    out[RECORD_HEADER_SIZE..].copy_from_slice(&epoch.raw().to_le_bytes());
    out
}

/// Parse an epoch-mark payload.
pub fn decode_epoch_mark(payload: &[u8]) -> Option<Epoch> {
    if payload.len() < 4 {
        return None;
    }
    Some(Epoch::from_raw(u32::from_le_bytes(
        payload[0..4].try_into().ok()?,
    )))
}

#[derive(Debug)]
struct LogBufferInner {
    bytes: Vec<u8>,
    /// Epoch of the most recent mark in `bytes`; invalid right after a
    /// drain so the next append re-marks.
    marked_epoch: Epoch,
    /// Latest epoch ever appended (survives drains).
    max_epoch: Epoch,
}

/// Per-thread redo buffer.
///
/// The owning thread appends at commit time; the log writer drains from a
/// background thread. A short mutex covers both sides: the buffer is
/// single-writer, single-drainer, and appends are one memcpy.
#[derive(Debug)]
pub struct ThreadLogBuffer {
    node: u8,
    thread_id: u16,
    inner: Mutex<LogBufferInner>,
}

impl ThreadLogBuffer {
    /// Empty buffer for one thread.
    pub fn new(node: u8, thread_id: u16) -> ThreadLogBuffer {
        ThreadLogBuffer {
            node,
            thread_id,
            inner: Mutex::new(LogBufferInner {
                bytes: Vec::new(),
                marked_epoch: Epoch::INVALID,
                max_epoch: Epoch::INVALID,
            }),
        }
    }

    /// Node the owning thread is pinned to.
    pub fn node(&self) -> u8 {
        self.node
    }

    /// Owning thread's id.
    pub fn thread_id(&self) -> u16 {
        self.thread_id
    }

    /// Append one commit's records, all stamped with `epoch`. Emits an
    /// epoch mark when the epoch differs from the previous append.
    pub fn append(&self, epoch: Epoch, records: &[u8]) {
        debug_assert!(epoch.is_valid());
        let mut inner = self.inner.lock();
        if inner.marked_epoch != epoch {
            debug_assert!(
                !inner.marked_epoch.is_valid() || inner.marked_epoch.before(epoch),
                "epochs in one thread's log must be monotone"
            );
            let mark = encode_epoch_mark(epoch);
            inner.bytes.extend_from_slice(&mark);
            inner.marked_epoch = epoch;
        }
        inner.bytes.extend_from_slice(records);
        inner.max_epoch.store_max(epoch);
    }

    /// Take everything buffered so far. Returns `None` when empty.
    pub fn drain(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.bytes.is_empty() {
            return None;
        }
        inner.marked_epoch = Epoch::INVALID;
        Some(std::mem::take(&mut inner.bytes))
    }

    /// Latest epoch this buffer has ever seen.
    pub fn max_epoch(&self) -> Epoch {
        self.inner.lock().max_epoch
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(storage_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; RECORD_HEADER_SIZE + payload.len()];
        RedoHeader {
            length: (RECORD_HEADER_SIZE + payload.len()) as u16,
            kind: RedoKind::SequentialAppend,
            storage_id,
            xct_id: XctId::new(Epoch::from_raw(4), 1),
        }
        .encode_into(&mut out);
        out[RECORD_HEADER_SIZE..].copy_from_slice(payload);
        out
    }

    #[test]
    fn header_round_trips() {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        let header = RedoHeader {
            length: 40,
            kind: RedoKind::ArrayOverwrite,
            storage_id: 12,
            xct_id: XctId::new(Epoch::from_raw(9), 33),
        };
        header.encode_into(&mut buf);
        assert_eq!(RedoHeader::decode(&buf), Some(header));
    }

    #[test]
    fn iterator_walks_packed_records() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&sample_record(1, b"abc"));
        stream.extend_from_slice(&sample_record(2, b"defgh"));
        let records: Vec<_> = iter_records(&stream).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].header.storage_id, 1);
        assert_eq!(records[0].payload, b"abc");
        assert_eq!(records[1].header.storage_id, 2);
        assert_eq!(records[1].payload, b"defgh");
    }

    #[test]
    fn buffer_marks_epoch_transitions() {
        let buffer = ThreadLogBuffer::new(0, 3);
        buffer.append(Epoch::from_raw(5), &sample_record(1, b"x"));
        buffer.append(Epoch::from_raw(5), &sample_record(1, b"y"));
        buffer.append(Epoch::from_raw(6), &sample_record(1, b"z"));

        let drained = buffer.drain().unwrap();
        let marks: Vec<Epoch> = iter_records(&drained)
            .filter(|r| r.header.kind == RedoKind::EpochMark)
            .map(|r| decode_epoch_mark(r.payload).unwrap())
            .collect();
        assert_eq!(marks, vec![Epoch::from_raw(5), Epoch::from_raw(6)]);
        assert_eq!(buffer.max_epoch(), Epoch::from_raw(6));
        assert!(buffer.drain().is_none());

        // A fresh append after a drain re-marks its epoch.
        buffer.append(Epoch::from_raw(6), &sample_record(1, b"w"));
        let drained = buffer.drain().unwrap();
        let first = iter_records(&drained).next().unwrap();
        assert_eq!(first.header.kind, RedoKind::EpochMark);
    }
}
