//! Sparse encoding of the flat guest memory arena.
//!
//! The arena is scanned in fixed windows; only windows holding at least one non-zero byte are
//! written, as `(offset: u64, len: u64, bytes)` records in ascending offset order. A trailing
//! window shorter than the window size is tested and written the same way. The stream ends with
//! a record whose offset is [`SENTINEL_OFFSET`] and whose length is zero. Omitted windows are
//! implicitly zero, so the decoder expects a zero-filled destination.

use std::io::Write;

use tracing::warn;

use crate::error::{CheckpointError, Result};
use crate::format::SENTINEL_OFFSET;
use crate::io::{ByteReader, WriteLeExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Records written or applied (sentinel excluded).
    pub chunks: usize,
    /// Payload bytes written or applied.
    pub bytes: u64,
    /// Records rejected for lying outside the destination arena.
    pub skipped: usize,
}

pub(crate) fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size % 8 != 0 {
        return Err(CheckpointError::Corrupt("invalid chunk size"));
    }
    Ok(())
}

/// Window-level zero test. Scans machine words and falls back to bytes for a ragged tail.
fn is_zero(window: &[u8]) -> bool {
    let mut words = window.chunks_exact(8);
    let words_zero = words
        .by_ref()
        .all(|w| w.try_into().map_or(false, |b: [u8; 8]| u64::from_ne_bytes(b) == 0));
    words_zero && words.remainder().iter().all(|&b| b == 0)
}

pub fn encode_arena<W: Write>(w: &mut W, arena: &[u8], chunk_size: usize) -> Result<ArenaStats> {
    validate_chunk_size(chunk_size)?;

    let mut stats = ArenaStats::default();
    for (index, window) in arena.chunks(chunk_size).enumerate() {
        if is_zero(window) {
            continue;
        }
        let offset = (index as u64)
            .checked_mul(chunk_size as u64)
            .ok_or(CheckpointError::Corrupt("arena offset overflow"))?;
        w.write_u64_le(offset)?;
        w.write_u64_le(window.len() as u64)?;
        w.write_bytes(window)?;
        stats.chunks += 1;
        stats.bytes += window.len() as u64;
    }

    w.write_u64_le(SENTINEL_OFFSET)?;
    w.write_u64_le(0)?;
    Ok(stats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRecord<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

/// A fully framed chunk stream, validated against a destination size but not yet applied.
///
/// Parsing reaches the sentinel before anything is written, so a truncated stream is rejected
/// while the destination is still untouched.
#[derive(Debug, Clone, Default)]
pub struct ArenaSnapshot<'a> {
    records: Vec<ArenaRecord<'a>>,
    skipped: usize,
}

impl<'a> ArenaSnapshot<'a> {
    pub fn parse(r: &mut ByteReader<'a>, arena_len: usize) -> Result<Self> {
        let mut out = ArenaSnapshot::default();
        loop {
            let offset = r.read_u64_le("arena chunk header")?;
            let len = r.read_u64_le("arena chunk header")?;
            if offset == SENTINEL_OFFSET {
                if len != 0 {
                    warn!(len, "arena sentinel carries a non-zero length");
                }
                return Ok(out);
            }

            let payload_len =
                usize::try_from(len).map_err(|_| CheckpointError::Truncated("arena chunk payload"))?;
            let data = r.read_bytes(payload_len, "arena chunk payload")?;

            let in_range = offset
                .checked_add(len)
                .map_or(false, |end| end <= arena_len as u64);
            if !in_range {
                warn!(
                    offset = format_args!("{offset:#x}"),
                    len, arena_len, "arena chunk exceeds arena size, skipping"
                );
                out.skipped += 1;
                continue;
            }
            out.records.push(ArenaRecord { offset, data });
        }
    }

    pub fn records(&self) -> &[ArenaRecord<'a>] {
        &self.records
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Copy every record into `arena`. The caller zero-fills `arena` first.
    ///
    /// Records were bounds-checked by [`ArenaSnapshot::parse`] against the length given there;
    /// a record that does not fit this particular slice is skipped as well.
    pub fn apply(&self, arena: &mut [u8]) -> ArenaStats {
        let mut stats = ArenaStats {
            skipped: self.skipped,
            ..ArenaStats::default()
        };
        for record in &self.records {
            let start = record.offset as usize;
            match arena.get_mut(start..start + record.data.len()) {
                Some(dst) => {
                    dst.copy_from_slice(record.data);
                    stats.chunks += 1;
                    stats.bytes += record.data.len() as u64;
                }
                None => stats.skipped += 1,
            }
        }
        stats
    }
}

/// Parse a chunk stream and apply it to a zero-filled `arena` in one step.
pub fn decode_arena_into(r: &mut ByteReader<'_>, arena: &mut [u8]) -> Result<ArenaStats> {
    let snapshot = ArenaSnapshot::parse(r, arena.len())?;
    Ok(snapshot.apply(arena))
}
