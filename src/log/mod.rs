//! Write-ahead log — framed, checksummed, with space reuse.
//!
//! The log is a separate append-only file of framed records. Each frame
//! is protected by a **rolling** two-word checksum seeded from the
//! previous frame's final value, so a frame can only verify if every
//! frame before it (back to the replay seed) verified too.
//!
//! # On-disk layout
//!
//! ```text
//! [kind(1)][payload…][cksum0 BE u32][cksum1 BE u32]
//! ```
//!
//! | kind | payload |
//! |------|---------|
//! | 1 WRITE  | `key_len varint, value_len varint, key, value` |
//! | 2 DELETE | `key_len varint, key` |
//! | 3 COMMIT | empty |
//! | 4 JUMP   | `offset varint` |
//!
//! The checksum covers the kind byte and payload, folded into the
//! running sum; the stored words are the running sum *after* the frame.
//!
//! # Regions and reuse
//!
//! Logical log space is divided into up to three regions so space
//! behind a durable checkpoint can be reused without growing the file
//! forever. Region 2 is always the append region; regions 0 and 1 hold
//! older still-live ranges in logical order. When the append offset
//! passes the configured soft size and everything before the last
//! checkpoint's pointer is dead, a JUMP frame redirects the stream to
//! the file start; when a bounded low region fills, another JUMP hops
//! over the live middle region. Replay follows JUMP frames, so the
//! rolling checksum chain is never broken by relocation.
//!
//! # Replay
//!
//! [`LogReader`] walks frames forward from a [`LogPtr`] (offset +
//! checksum seed), verifying each frame and following jumps. It stops —
//! without error — at the first frame that is truncated, has an unknown
//! kind, or fails its checksum: that is the end of the durable log.
//! Deciding which replayed records are *committed* is the caller's job.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::encoding::{self, EncodingError};
use crate::env::EnvFile;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const KIND_WRITE: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_COMMIT: u8 = 3;
const KIND_JUMP: u8 = 4;

/// Bytes of trailing checksum on every frame.
const CKSUM_SIZE: usize = 8;

/// Upper bound on an encoded JUMP frame; reserved before relocating so
/// the jump itself always fits.
const JUMP_RESERVE: u64 = 24;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding or decoding failed structurally.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Core types
// ------------------------------------------------------------------------------------------------

/// A position in the log: byte offset plus the rolling checksum of
/// everything replayed up to that offset.
///
/// Checkpoints persist a `LogPtr`; recovery seeds replay from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogPtr {
    /// Byte offset of the next frame.
    pub offset: u64,

    /// Rolling checksum seed at that offset.
    pub cksum: [u32; 2],
}

/// A logical log record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Insert or replace `key` with `value`.
    Write {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Delete `key` (tombstone).
    Delete {
        key: Vec<u8>,
    },
    /// Transaction commit marker (outermost level only).
    Commit,
    /// Redirect replay to `offset`; written when log space is reused.
    Jump {
        offset: u64,
    },
}

/// One contiguous range of the log's address space.
///
/// `start == end` means the region is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LogRegion {
    start: u64,
    end: u64,
}

impl LogRegion {
    fn is_free(&self) -> bool {
        self.start == self.end
    }

    fn contains(&self, off: u64) -> bool {
        !self.is_free() && off >= self.start && off <= self.end
    }
}

// ------------------------------------------------------------------------------------------------
// Log — append side
// ------------------------------------------------------------------------------------------------

/// The append side of the write-ahead log.
///
/// Serialized externally: the database's writer path owns the log
/// behind its writer lock.
pub struct Log {
    /// Log file handle.
    file: Arc<dyn EnvFile>,

    /// Regions in logical order; index 2 is the append region.
    regions: [LogRegion; 3],

    /// Next append offset.
    write_off: u64,

    /// Rolling checksum after the last appended frame.
    cksum: [u32; 2],

    /// Offset of the last durably checkpointed log pointer.
    last_ckpt_off: u64,

    /// Soft size target that triggers space reuse.
    log_size: u64,
}

impl Log {
    /// Open the append side positioned at `ptr`.
    ///
    /// `ptr` is where recovery finished (or zero for a fresh database);
    /// `low_water` is the lowest offset replay visited, which bounds
    /// the range that must be treated as live until the next
    /// checkpoint.
    pub fn open(file: Arc<dyn EnvFile>, ptr: LogPtr, low_water: u64, log_size: u64) -> Self {
        let regions = [
            LogRegion::default(),
            LogRegion::default(),
            LogRegion {
                start: low_water.min(ptr.offset),
                end: ptr.offset,
            },
        ];
        info!(offset = ptr.offset, low_water, "log opened");
        Self {
            file,
            regions,
            write_off: ptr.offset,
            cksum: ptr.cksum,
            last_ckpt_off: 0,
            log_size,
        }
    }

    /// Current append position and checksum seed.
    pub fn tell(&self) -> LogPtr {
        LogPtr {
            offset: self.write_off,
            cksum: self.cksum,
        }
    }

    /// Update the soft size target (runtime config).
    pub fn set_log_size(&mut self, log_size: u64) {
        self.log_size = log_size;
    }

    /// Append one record, returning the position *after* it.
    ///
    /// On I/O failure the log state is untouched: the checksum chain
    /// and append offset advance only once the frame is fully written.
    pub fn append(&mut self, record: &LogRecord) -> Result<LogPtr, LogError> {
        let body = encode_body(record);
        self.make_room(body.len() as u64 + CKSUM_SIZE as u64)?;

        let (frame, new_cksum) = seal(&body, self.cksum);
        self.file.write_at(self.write_off, &frame)?;
        self.cksum = new_cksum;
        self.write_off += frame.len() as u64;
        self.regions[2].end = self.regions[2].end.max(self.write_off);

        trace!(
            kind = body[0],
            len = frame.len(),
            offset = self.write_off,
            "log frame appended"
        );
        Ok(self.tell())
    }

    /// Durability barrier on the log file.
    pub fn sync(&self) -> Result<(), LogError> {
        self.file.sync()?;
        Ok(())
    }

    /// Discard everything appended after `ptr` (transaction rollback).
    ///
    /// The frame that used to live at `ptr.offset` is clobbered with
    /// zeroes so replay cannot resurrect the discarded suffix.
    pub fn truncate_to(&mut self, ptr: LogPtr) -> Result<(), LogError> {
        if ptr.offset > self.write_off {
            return Err(LogError::Internal(format!(
                "log truncate target {} is past the append offset {}",
                ptr.offset, self.write_off
            )));
        }
        self.file.write_at(ptr.offset, &[0u8; 16])?;
        self.write_off = ptr.offset;
        self.cksum = ptr.cksum;
        if self.regions[2].contains(ptr.offset) {
            self.regions[2].end = ptr.offset;
        } else {
            // The rollback crossed a relocation. Collapse the region
            // table to one conservative range; reuse resumes after the
            // next checkpoint.
            let start = self
                .regions
                .iter()
                .filter(|r| !r.is_free())
                .map(|r| r.start)
                .min()
                .unwrap_or(0)
                .min(ptr.offset);
            let end = self
                .regions
                .iter()
                .map(|r| r.end)
                .max()
                .unwrap_or(ptr.offset)
                .max(ptr.offset);
            self.regions = [
                LogRegion::default(),
                LogRegion::default(),
                LogRegion { start, end },
            ];
        }
        debug!(offset = ptr.offset, "log truncated for rollback");
        Ok(())
    }

    /// Note that a checkpoint with log pointer `ptr` is durably
    /// installed; regions logically before it become reusable.
    pub fn checkpointed(&mut self, ptr: LogPtr) {
        self.last_ckpt_off = ptr.offset;
        // Regions are kept in logical order 0 → 1 → 2.
        if self.regions[2].contains(ptr.offset) {
            self.regions[0] = LogRegion::default();
            self.regions[1] = LogRegion::default();
        } else if self.regions[1].contains(ptr.offset) {
            self.regions[0] = LogRegion::default();
        }
        debug!(offset = ptr.offset, regions = ?self.regions, "log regions reclaimed");
    }

    // --------------------------------------------------------------------------------------------
    // Space reuse
    // --------------------------------------------------------------------------------------------

    /// Start offset of the nearest live region above the append
    /// position, if the append region is bounded by one.
    fn append_bound(&self) -> Option<u64> {
        [&self.regions[0], &self.regions[1]]
            .into_iter()
            .filter(|r| !r.is_free() && r.start >= self.write_off)
            .map(|r| r.start)
            .min()
    }

    /// Make sure a frame of `need` bytes can be appended, hopping over
    /// a live region with a JUMP when the bounded low region fills.
    fn make_room(&mut self, need: u64) -> Result<(), LogError> {
        if let Some(bound) = self.append_bound() {
            if self.write_off + need + JUMP_RESERVE > bound {
                let target = self
                    .regions
                    .iter()
                    .map(|r| r.end)
                    .max()
                    .unwrap_or(self.write_off);
                self.relocate(target)?;
            }
        }
        Ok(())
    }

    /// Wrap the append region back to the file start when the prefix is
    /// dead. Called between transactions, never inside one, so rollback
    /// offsets never cross the relocation.
    pub fn maybe_reuse(&mut self) -> Result<(), LogError> {
        if self.append_bound().is_none() && self.write_off > self.log_size && self.can_wrap() {
            self.relocate(0)?;
        }
        Ok(())
    }

    /// True when the whole file prefix behind the last checkpoint is
    /// dead and the stream may wrap to offset zero.
    fn can_wrap(&self) -> bool {
        self.regions[0].is_free()
            && self.regions[1].is_free()
            && self.regions[2].contains(self.last_ckpt_off)
            && self.last_ckpt_off > self.regions[2].start
            && self.last_ckpt_off > JUMP_RESERVE
    }

    /// Write a JUMP frame and rotate regions so appends continue at
    /// `target`.
    fn relocate(&mut self, target: u64) -> Result<(), LogError> {
        let body = encode_body(&LogRecord::Jump { offset: target });
        let (frame, new_cksum) = seal(&body, self.cksum);
        self.file.write_at(self.write_off, &frame)?;
        self.cksum = new_cksum;
        let jump_end = self.write_off + frame.len() as u64;

        if target == 0 {
            // Wrap: the live tail of the old append region (from the
            // last checkpoint pointer) becomes region 0.
            self.regions[0] = LogRegion {
                start: self.last_ckpt_off,
                end: jump_end,
            };
            self.regions[1] = LogRegion::default();
        } else {
            // Hop: the old (low) append region slots in as region 1,
            // logically after region 0.
            self.regions[1] = LogRegion {
                start: self.regions[2].start,
                end: jump_end,
            };
        }
        self.regions[2] = LogRegion {
            start: target,
            end: target,
        };
        self.write_off = target;

        info!(target, regions = ?self.regions, "log append region relocated");
        Ok(())
    }

}

/// Fold `body` into the rolling checksum seeded by `seed` and return
/// the sealed frame bytes plus the new running checksum.
fn seal(body: &[u8], seed: [u32; 2]) -> (Vec<u8>, [u32; 2]) {
    let cksum = encoding::rolling_sum(body, seed);
    let mut frame = Vec::with_capacity(body.len() + CKSUM_SIZE);
    frame.extend_from_slice(body);
    encoding::put_u32(&mut frame, cksum[0]);
    encoding::put_u32(&mut frame, cksum[1]);
    (frame, cksum)
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("write_off", &self.write_off)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

/// Serialize a record body (kind byte + payload, no checksum).
fn encode_body(record: &LogRecord) -> Vec<u8> {
    let mut body = Vec::new();
    match record {
        LogRecord::Write { key, value } => {
            body.push(KIND_WRITE);
            encoding::put_varint(&mut body, key.len() as u64);
            encoding::put_varint(&mut body, value.len() as u64);
            body.extend_from_slice(key);
            body.extend_from_slice(value);
        }
        LogRecord::Delete { key } => {
            body.push(KIND_DELETE);
            encoding::put_varint(&mut body, key.len() as u64);
            body.extend_from_slice(key);
        }
        LogRecord::Commit => body.push(KIND_COMMIT),
        LogRecord::Jump { offset } => {
            body.push(KIND_JUMP);
            encoding::put_varint(&mut body, *offset);
        }
    }
    body
}

// ------------------------------------------------------------------------------------------------
// LogReader — replay side
// ------------------------------------------------------------------------------------------------

/// Forward replay over the log from a checkpointed position.
///
/// Yields verified records until the first truncated, malformed, or
/// checksum-failing frame. JUMP frames are consumed internally; the
/// caller only sees data and commit records.
pub struct LogReader {
    file: Arc<dyn EnvFile>,
    off: u64,
    cksum: [u32; 2],
    /// Lowest offset visited; bounds the live range after recovery.
    low_water: u64,
    ended: bool,
}

impl LogReader {
    /// Start replay at `ptr`.
    pub fn new(file: Arc<dyn EnvFile>, ptr: LogPtr) -> Self {
        Self {
            file,
            off: ptr.offset,
            cksum: ptr.cksum,
            low_water: ptr.offset,
            ended: false,
        }
    }

    /// Position and seed after the last successfully replayed frame.
    pub fn tell(&self) -> LogPtr {
        LogPtr {
            offset: self.off,
            cksum: self.cksum,
        }
    }

    /// Lowest offset replay visited.
    pub fn low_water(&self) -> u64 {
        self.low_water
    }

    /// Read the next verified record, following jumps.
    ///
    /// `Ok(None)` is the ordinary end of the durable log.
    pub fn next_record(&mut self) -> Result<Option<(LogRecord, LogPtr)>, LogError> {
        loop {
            if self.ended {
                return Ok(None);
            }
            let Some((record, frame_len)) = self.read_frame()? else {
                self.ended = true;
                return Ok(None);
            };

            self.off += frame_len;
            self.low_water = self.low_water.min(self.off);
            let after = self.tell();

            if let LogRecord::Jump { offset } = record {
                trace!(target = offset, "log replay following jump");
                self.off = offset;
                self.low_water = self.low_water.min(offset);
                continue;
            }
            return Ok(Some((record, after)));
        }
    }

    /// Parse and verify one frame at the current offset.
    ///
    /// Returns `None` when the frame is truncated, malformed, or fails
    /// its checksum — the end of the durable log.
    fn read_frame(&mut self) -> Result<Option<(LogRecord, u64)>, LogError> {
        // Peek enough for the kind byte and any varints.
        let mut head = [0u8; 32];
        let got = self.file.read_at(self.off, &mut head)?;
        if got == 0 {
            return Ok(None);
        }
        let head = &head[..got];

        let (record_shape, body_len) = match parse_head(head) {
            Some(v) => v,
            None => return Ok(None),
        };

        let frame_len = body_len + CKSUM_SIZE;
        let mut frame = vec![0u8; frame_len];
        if self.file.read_at(self.off, &mut frame)? != frame_len {
            return Ok(None);
        }

        let computed = encoding::rolling_sum(&frame[..body_len], self.cksum);
        let stored0 = match encoding::get_u32_at(&frame, body_len) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let stored1 = match encoding::get_u32_at(&frame, body_len + 4) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        if computed != [stored0, stored1] {
            debug!(offset = self.off, "log replay stopped at checksum mismatch");
            return Ok(None);
        }
        self.cksum = computed;

        let record = materialize(record_shape, &frame[..body_len]);
        Ok(record.map(|r| (r, frame_len as u64)))
    }
}

/// Parsed frame shape: kind plus decoded lengths/offsets.
enum HeadShape {
    Write { klen: usize, vlen: usize, key_at: usize },
    Delete { klen: usize, key_at: usize },
    Commit,
    Jump { offset: u64 },
}

/// Parse the frame head; `None` means malformed or truncated.
fn parse_head(head: &[u8]) -> Option<(HeadShape, usize)> {
    let kind = *head.first()?;
    let rest = &head[1..];
    match kind {
        KIND_WRITE => {
            let (klen, n1) = encoding::get_varint_len(rest).ok()?;
            let (vlen, n2) = encoding::get_varint_len(&rest[n1..]).ok()?;
            let key_at = 1 + n1 + n2;
            Some((
                HeadShape::Write { klen, vlen, key_at },
                key_at + klen + vlen,
            ))
        }
        KIND_DELETE => {
            let (klen, n1) = encoding::get_varint_len(rest).ok()?;
            let key_at = 1 + n1;
            Some((HeadShape::Delete { klen, key_at }, key_at + klen))
        }
        KIND_COMMIT => Some((HeadShape::Commit, 1)),
        KIND_JUMP => {
            let (offset, n1) = encoding::get_varint(rest).ok()?;
            Some((HeadShape::Jump { offset }, 1 + n1))
        }
        _ => None,
    }
}

/// Slice the verified body into an owned record.
fn materialize(shape: HeadShape, body: &[u8]) -> Option<LogRecord> {
    match shape {
        HeadShape::Write { klen, vlen, key_at } => Some(LogRecord::Write {
            key: body.get(key_at..key_at + klen)?.to_vec(),
            value: body.get(key_at + klen..key_at + klen + vlen)?.to_vec(),
        }),
        HeadShape::Delete { klen, key_at } => Some(LogRecord::Delete {
            key: body.get(key_at..key_at + klen)?.to_vec(),
        }),
        HeadShape::Commit => Some(LogRecord::Commit),
        HeadShape::Jump { offset } => Some(LogRecord::Jump { offset }),
    }
}
