//! Checkpoint codec — snapshots to meta-page blobs and back.
//!
//! A checkpoint blob is a sequence of big-endian 32-bit words:
//!
//! ```text
//! header (8 words):
//!     id MSW, id LSW, total word count, block count,
//!     block size, inline level count, page size, overflow flag
//! log pointer (4 words):
//!     offset MSW, offset LSW, checksum word 0, checksum word 1
//! per inline level:
//!     age, rhs count, lhs segment (4 words), each rhs segment (4 words),
//!     and when rhs count > 0 a merge block:
//!     input count, skip count, per input (page, cell), split page, split cell
//! free list:
//!     without overflow: count, then each block number
//!     with overflow:    keep count, refree block 1, refree block 2
//! checksum (2 words) over everything above
//! ```
//!
//! The blob must fit a 4 KiB meta page — 1024 words. When the level
//! list or free list would not fit, the overflow flag is set: a suffix
//! of older levels lives in a system record under the LEVELS key, the
//! full free list under the FREELIST key, and the inline free list
//! degenerates to the three-word delta above. [`overflow_plan`]
//! computes the split; it is deliberately order-sensitive (levels are
//! budgeted before the free list) and property-tested.

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::encoding;
use crate::log::LogPtr;
use crate::snapshot::{FreeBlock, Level, MergeInput, MergeState, SegmentRecord, Snapshot};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Maximum checkpoint size: one 4 KiB meta page of 32-bit words.
pub const CKPT_MAX_WORDS: usize = 1024;

const HDR_WORDS: usize = 8;
const LOGPTR_WORDS: usize = 4;
const SEGMENT_WORDS: usize = 4;
const CKSUM_WORDS: usize = 2;
const FREE_DELTA_WORDS: usize = 3;

const HDR_ID_MSW: usize = 0;
const HDR_ID_LSW: usize = 1;
const HDR_NCKPT: usize = 2;
const HDR_NBLOCK: usize = 3;
const HDR_BLKSZ: usize = 4;
const HDR_NLEVEL: usize = 5;
const HDR_PGSZ: usize = 6;
const HDR_OVFL: usize = 7;

/// Reserved key of the system record holding overflowed levels.
pub const SYS_LEVELS_KEY: &[u8] = b"LEVELS";

/// Reserved key of the system record holding the full free list.
pub const SYS_FREELIST_KEY: &[u8] = b"FREELIST";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the checkpoint codec.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The blob exceeds the meta-page capacity.
    #[error("checkpoint of {0} words exceeds the {CKPT_MAX_WORDS}-word meta page")]
    TooLarge(usize),

    /// Structurally invalid blob (used for system records, which carry
    /// no checksum of their own).
    #[error("malformed checkpoint payload")]
    Malformed,
}

// ------------------------------------------------------------------------------------------------
// Encoded forms
// ------------------------------------------------------------------------------------------------

/// How the free list travels in a checkpoint.
pub enum FreePayload<'a> {
    /// The whole list inline, as block numbers.
    Full(&'a [FreeBlock]),
    /// Overflow delta against the FREELIST system record:
    /// `[keep count, refree 1, refree 2]`.
    Delta([u32; 3]),
}

/// Free-list content recovered from a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreeDecoded {
    /// The whole list was inline.
    Full(Vec<u32>),
    /// Delta: keep the first `keep` entries of the FREELIST system
    /// record, then add the nonzero refree blocks.
    Delta { keep: u32, refree: [u32; 2] },
}

/// A decoded checkpoint blob.
#[derive(Debug, Clone)]
pub struct DecodedCkpt {
    pub ckpt_id: u64,
    pub n_block: u32,
    pub block_size: u32,
    pub page_size: u32,
    pub log_ptr: LogPtr,
    pub inline_levels: Vec<Level>,
    pub ovfl: bool,
    pub free: FreeDecoded,
}

/// The overflow decision for one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowPlan {
    /// Levels to keep inline (a prefix of the snapshot's level list).
    pub inline_levels: usize,

    /// Whether LEVELS/FREELIST system records are required.
    pub ovfl: bool,
}

// ------------------------------------------------------------------------------------------------
// Word-count accounting
// ------------------------------------------------------------------------------------------------

/// Words one level record occupies.
fn level_words(level: &Level) -> usize {
    let mut n = 2 + SEGMENT_WORDS + level.rhs.len() * SEGMENT_WORDS;
    if let Some(merge) = &level.merge {
        n += 2 + merge.inputs.len() * 2 + 2;
    }
    n
}

/// Decide how many levels stay inline and whether overflow records are
/// needed.
///
/// Budgeting is order-sensitive: levels claim words first (newest
/// first), then the free list must fit in what remains. Space is
/// reserved up front for the delta fallback and for one more level, so
/// a flush between planning and serialization cannot burst the page.
pub fn overflow_plan(snap: &Snapshot) -> OverflowPlan {
    let mut free_words = CKPT_MAX_WORDS - HDR_WORDS - LOGPTR_WORDS - CKSUM_WORDS;
    free_words -= FREE_DELTA_WORDS;
    free_words -= 2 + SEGMENT_WORDS;

    let mut inline = 0usize;
    for level in &snap.levels {
        let need = level_words(level);
        if free_words < need {
            break;
        }
        free_words -= need;
        inline += 1;
    }

    let tail = snap.levels.len() - inline;
    let list_words = snap.free.len() + 1;
    OverflowPlan {
        inline_levels: inline,
        ovfl: tail > 0 || list_words > free_words,
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding
// ------------------------------------------------------------------------------------------------

fn push_segment(words: &mut Vec<u32>, seg: &SegmentRecord) {
    words.push(seg.first_pg);
    words.push(seg.last_pg);
    words.push(seg.root_pg);
    words.push(seg.n_pages);
}

fn push_level(words: &mut Vec<u32>, level: &Level) {
    words.push(level.age);
    words.push(level.rhs.len() as u32);
    push_segment(words, &level.lhs);
    for seg in &level.rhs {
        push_segment(words, seg);
    }
    if let Some(merge) = &level.merge {
        words.push(merge.inputs.len() as u32);
        words.push(merge.n_skip);
        for input in &merge.inputs {
            words.push(input.pgno);
            words.push(input.cell);
        }
        words.push(merge.split_pg);
        words.push(merge.split_cell);
    }
}

/// Serialize a snapshot into a meta-page blob.
///
/// `inline_levels` and the free payload come from [`overflow_plan`]
/// and the worker's overflow bookkeeping.
pub fn encode(
    snap: &Snapshot,
    inline_levels: usize,
    free: FreePayload<'_>,
) -> Result<Vec<u8>, CheckpointError> {
    let ovfl = matches!(free, FreePayload::Delta(_));
    let mut words = vec![0u32; HDR_WORDS];

    // Log pointer.
    words.push((snap.log_ptr.offset >> 32) as u32);
    words.push(snap.log_ptr.offset as u32);
    words.push(snap.log_ptr.cksum[0]);
    words.push(snap.log_ptr.cksum[1]);

    // Inline levels, newest first.
    for level in snap.levels.iter().take(inline_levels) {
        push_level(&mut words, level);
    }

    // Free list.
    match free {
        FreePayload::Full(list) => {
            words.push(list.len() as u32);
            for fb in list {
                words.push(fb.block);
            }
        }
        FreePayload::Delta(delta) => words.extend_from_slice(&delta),
    }

    // Header, now that the total is known.
    let total = words.len() + CKSUM_WORDS;
    if total > CKPT_MAX_WORDS {
        return Err(CheckpointError::TooLarge(total));
    }
    words[HDR_ID_MSW] = (snap.ckpt_id >> 32) as u32;
    words[HDR_ID_LSW] = snap.ckpt_id as u32;
    words[HDR_NCKPT] = total as u32;
    words[HDR_NBLOCK] = snap.n_block;
    words[HDR_BLKSZ] = snap.block_size;
    words[HDR_NLEVEL] = inline_levels as u32;
    words[HDR_PGSZ] = snap.page_size;
    words[HDR_OVFL] = u32::from(ovfl);

    // Trailing checksum over the serialized bytes of all prior words.
    let mut bytes = encoding::words_to_bytes(&words);
    let cksum = encoding::rolling_sum(&bytes, [0, 0]);
    encoding::put_u32(&mut bytes, cksum[0]);
    encoding::put_u32(&mut bytes, cksum[1]);
    Ok(bytes)
}

// ------------------------------------------------------------------------------------------------
// Decoding
// ------------------------------------------------------------------------------------------------

struct WordReader<'a> {
    words: &'a [u32],
    at: usize,
}

impl<'a> WordReader<'a> {
    fn take(&mut self) -> Result<u32, CheckpointError> {
        let w = self
            .words
            .get(self.at)
            .copied()
            .ok_or(CheckpointError::Malformed)?;
        self.at += 1;
        Ok(w)
    }

    fn segment(&mut self) -> Result<SegmentRecord, CheckpointError> {
        Ok(SegmentRecord {
            first_pg: self.take()?,
            last_pg: self.take()?,
            root_pg: self.take()?,
            n_pages: self.take()?,
        })
    }

    fn level(&mut self) -> Result<Level, CheckpointError> {
        let age = self.take()?;
        let n_rhs = self.take()? as usize;
        if n_rhs > CKPT_MAX_WORDS {
            return Err(CheckpointError::Malformed);
        }
        let lhs = self.segment()?;
        let mut rhs = Vec::with_capacity(n_rhs);
        for _ in 0..n_rhs {
            rhs.push(self.segment()?);
        }
        let merge = if n_rhs > 0 {
            let n_input = self.take()? as usize;
            if n_input > CKPT_MAX_WORDS {
                return Err(CheckpointError::Malformed);
            }
            let n_skip = self.take()?;
            let mut inputs = Vec::with_capacity(n_input);
            for _ in 0..n_input {
                inputs.push(MergeInput {
                    pgno: self.take()?,
                    cell: self.take()?,
                });
            }
            Some(MergeState {
                inputs,
                n_skip,
                split_pg: self.take()?,
                split_cell: self.take()?,
            })
        } else {
            None
        };
        Ok(Level {
            age,
            lhs,
            rhs,
            merge,
        })
    }
}

/// Decode and verify a meta-page blob.
///
/// `Ok(None)` means the slot holds no valid checkpoint — blank, torn,
/// or corrupted. That is not an error at this layer; slot arbitration
/// happens above.
pub fn decode(bytes: &[u8]) -> Result<Option<DecodedCkpt>, CheckpointError> {
    if bytes.len() < (HDR_WORDS + LOGPTR_WORDS + CKSUM_WORDS) * 4 {
        return Ok(None);
    }
    // Total word count lives in the header; bounds-check before use.
    let n_words = match encoding::get_u32_at(bytes, HDR_NCKPT * 4) {
        Ok(v) => v as usize,
        Err(_) => return Ok(None),
    };
    if n_words < HDR_WORDS + LOGPTR_WORDS + CKSUM_WORDS
        || n_words > CKPT_MAX_WORDS
        || n_words * 4 > bytes.len()
    {
        return Ok(None);
    }

    let blob = &bytes[..n_words * 4];
    let body = &blob[..(n_words - CKSUM_WORDS) * 4];
    let computed = encoding::rolling_sum(body, [0, 0]);
    let stored = [
        match encoding::get_u32_at(blob, (n_words - 2) * 4) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        },
        match encoding::get_u32_at(blob, (n_words - 1) * 4) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        },
    ];
    if computed != stored {
        return Ok(None);
    }

    let words = match encoding::bytes_to_words(body) {
        Ok(w) => w,
        Err(_) => return Ok(None),
    };

    let ckpt_id = ((words[HDR_ID_MSW] as u64) << 32) | words[HDR_ID_LSW] as u64;
    let n_block = words[HDR_NBLOCK];
    let block_size = words[HDR_BLKSZ];
    let n_level = words[HDR_NLEVEL] as usize;
    let page_size = words[HDR_PGSZ];
    let ovfl = words[HDR_OVFL] != 0;

    let mut reader = WordReader {
        words: &words,
        at: HDR_WORDS,
    };
    let offset_msw = reader.take()?;
    let offset_lsw = reader.take()?;
    let log_ptr = LogPtr {
        offset: ((offset_msw as u64) << 32) | offset_lsw as u64,
        cksum: [reader.take()?, reader.take()?],
    };

    let mut inline_levels = Vec::with_capacity(n_level);
    for _ in 0..n_level {
        inline_levels.push(reader.level()?);
    }

    let free = if ovfl {
        let keep = reader.take()?;
        let refree = [reader.take()?, reader.take()?];
        FreeDecoded::Delta { keep, refree }
    } else {
        let n = reader.take()? as usize;
        if n > CKPT_MAX_WORDS {
            return Err(CheckpointError::Malformed);
        }
        let mut list = Vec::with_capacity(n);
        for _ in 0..n {
            list.push(reader.take()?);
        }
        FreeDecoded::Full(list)
    };

    Ok(Some(DecodedCkpt {
        ckpt_id,
        n_block,
        block_size,
        page_size,
        log_ptr,
        inline_levels,
        ovfl,
        free,
    }))
}

/// Read just the checkpoint id of a slot without validating the rest.
pub fn peek_id(bytes: &[u8]) -> Option<u64> {
    let msw = encoding::get_u32_at(bytes, HDR_ID_MSW * 4).ok()?;
    let lsw = encoding::get_u32_at(bytes, HDR_ID_LSW * 4).ok()?;
    Some(((msw as u64) << 32) | lsw as u64)
}

// ------------------------------------------------------------------------------------------------
// System record payloads
// ------------------------------------------------------------------------------------------------

/// Payload of the LEVELS system record: `[count, level records…]`,
/// big-endian words, no checksum (segment pages carry their own).
pub fn encode_levels_record(levels: &[Level]) -> Vec<u8> {
    let mut words = vec![levels.len() as u32];
    for level in levels {
        push_level(&mut words, level);
    }
    encoding::words_to_bytes(&words)
}

/// Decode a LEVELS system record payload.
pub fn decode_levels_record(bytes: &[u8]) -> Result<Vec<Level>, CheckpointError> {
    let words = encoding::bytes_to_words(bytes).map_err(|_| CheckpointError::Malformed)?;
    let mut reader = WordReader {
        words: &words,
        at: 0,
    };
    let n = reader.take()? as usize;
    if n > CKPT_MAX_WORDS {
        return Err(CheckpointError::Malformed);
    }
    let mut levels = Vec::with_capacity(n);
    for _ in 0..n {
        levels.push(reader.level()?);
    }
    Ok(levels)
}

// ------------------------------------------------------------------------------------------------
// System record chunking
// ------------------------------------------------------------------------------------------------
//
// A system payload can exceed one segment page cell (a LEVELS record
// for hundreds of levels, a FREELIST for thousands of blocks), so it
// is stored as a run of chunk records. Chunk keys are the base key
// plus a big-endian 32-bit index, which keeps the run contiguous and
// ordered inside a segment; chunk 0's value is prefixed with the total
// chunk count. All chunks of one version land in one segment, so a
// reader resolves the newest version by finding chunk 0 youngest-first
// and then reading the remaining chunks from that same segment —
// leftover higher-index chunks of an older version are never touched.

/// Key of chunk `index` of the system record rooted at `base`.
pub fn sys_chunk_key(base: &[u8], index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(base.len() + 4);
    key.extend_from_slice(base);
    encoding::put_u32(&mut key, index);
    key
}

/// Split `blob` into chunk values of at most `max_chunk` payload bytes.
///
/// The first chunk's value carries a 4-byte big-endian total count
/// before its payload.
pub fn chunk_blob(blob: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
    let max_chunk = max_chunk.max(8);
    // The count prefix eats into chunk 0's payload.
    let first_payload = max_chunk - 4;
    let rest = blob.len().saturating_sub(first_payload);
    let n_chunks = 1 + rest.div_ceil(max_chunk);

    let mut out = Vec::with_capacity(n_chunks);
    let mut first = Vec::with_capacity(max_chunk);
    encoding::put_u32(&mut first, n_chunks as u32);
    let head = blob.len().min(first_payload);
    first.extend_from_slice(&blob[..head]);
    out.push(first);

    for piece in blob[head..].chunks(max_chunk) {
        out.push(piece.to_vec());
    }
    out
}

/// Parse chunk 0's value into `(total chunk count, payload)`.
pub fn chunk_head(value: &[u8]) -> Result<(u32, &[u8]), CheckpointError> {
    let (count, n) = encoding::get_u32(value).map_err(|_| CheckpointError::Malformed)?;
    if count == 0 {
        return Err(CheckpointError::Malformed);
    }
    Ok((count, &value[n..]))
}

/// Payload of the FREELIST system record: `[count, block numbers…]`.
pub fn encode_free_record(list: &[FreeBlock]) -> Vec<u8> {
    let mut words = vec![list.len() as u32];
    words.extend(list.iter().map(|fb| fb.block));
    encoding::words_to_bytes(&words)
}

/// Decode a FREELIST system record payload.
pub fn decode_free_record(bytes: &[u8]) -> Result<Vec<u32>, CheckpointError> {
    let words = encoding::bytes_to_words(bytes).map_err(|_| CheckpointError::Malformed)?;
    let mut reader = WordReader {
        words: &words,
        at: 0,
    };
    let n = reader.take()? as usize;
    if n > crate::encoding::MAX_BYTE_LEN as usize / 4 {
        return Err(CheckpointError::Malformed);
    }
    let mut list = Vec::with_capacity(n);
    for _ in 0..n {
        list.push(reader.take()?);
    }
    Ok(list)
}
