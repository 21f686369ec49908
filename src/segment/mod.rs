//! Segments — immutable sorted runs inside the database file.
//!
//! A segment is produced whole by a flush or incrementally by a merge
//! and never modified afterwards (except that a paused merge output
//! grows at its tail). Its pages live in blocks handed out by the
//! worker's allocator; each block belongs to exactly one segment.
//!
//! # Page layout
//!
//! Every page is a slotted page:
//!
//! ```text
//! [n_cells u16][flags u16][prev_pgno u32][next_pgno u32]   header, 12 B
//! [cell bodies, growing forward…]
//! [… cell pointer array of u16 offsets, growing backward]
//! [crc32 u32]                                               stamped by the pager
//! ```
//!
//! Data pages form a doubly-linked chain through `prev`/`next`.
//! Separator pages (`flags` bit 0) form their own chain per index
//! level, which lets both index traversal and block reclamation walk
//! the structure from the root alone.
//!
//! # Cell format
//!
//! | kind | body |
//! |------|------|
//! | 1 write     | `key_len varint, value_len varint, key, value` |
//! | 2 tombstone | `key_len varint, key` |
//! | 3 system    | `key_len varint, value_len varint, key, value` |
//! | 4 separator | `ns(1), key_len varint, key, child_pgno u32` |
//!
//! # Ordering
//!
//! Records are ordered by `(namespace, key)`: user records (writes and
//! tombstones, namespace 0) sort before system records (namespace 1),
//! and within a namespace keys compare as unsigned byte strings. The
//! system namespace carries the engine's own LEVELS/FREELIST records;
//! client cursors never observe it.

pub mod reader;
pub mod writer;

#[cfg(test)]
pub(crate) mod tests;

pub use reader::SegmentCursor;
pub use writer::SegmentWriter;

use std::cmp::Ordering;

use thiserror::Error;

use crate::encoding;
use crate::pager::{PAGE_CKSUM_SIZE, Pager, PagerError};
use crate::snapshot::SegmentRecord;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const PAGE_HDR_SIZE: usize = 12;
pub(crate) const FLAG_SEPARATOR: u16 = 0x0001;

const OFF_NCELL: usize = 0;
const OFF_FLAGS: usize = 2;
const OFF_PREV: usize = 4;
pub(crate) const OFF_NEXT: usize = 8;

const CELL_WRITE: u8 = 1;
const CELL_DELETE: u8 = 2;
const CELL_SYS: u8 = 3;
const CELL_SEP: u8 = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment reading and writing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SegmentError {
    /// Underlying pager failure (I/O or page checksum).
    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    /// A page decoded structurally wrong (bad offsets, bad cell kind).
    #[error("segment page {0} is corrupt")]
    Corrupt(u32),

    /// A record is too large to fit in one page.
    #[error("record of {0} bytes exceeds the page capacity")]
    RecordTooLarge(usize),

    /// No block could be allocated for a new page.
    #[error("database is full")]
    Full,

    /// Records were pushed out of `(namespace, key)` order.
    #[error("record out of order")]
    OutOfOrder,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// The kind of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A user key/value pair.
    Write,
    /// A user delete tombstone (no value).
    Delete,
    /// An engine-internal record in the system namespace.
    Sys,
}

impl RecordKind {
    /// Namespace rank: user records order before system records.
    pub fn ns(self) -> u8 {
        match self {
            RecordKind::Write | RecordKind::Delete => 0,
            RecordKind::Sys => 1,
        }
    }
}

/// One record flowing into or out of a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub key: Vec<u8>,
    /// Empty for tombstones.
    pub value: Vec<u8>,
}

impl Record {
    /// A user write.
    pub fn write(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Write,
            key,
            value,
        }
    }

    /// A user tombstone.
    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Delete,
            key,
            value: Vec::new(),
        }
    }

    /// A system record.
    pub fn system(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Sys,
            key,
            value,
        }
    }
}

/// Compare two records by `(namespace, key)`.
pub fn cmp_ns_key(ns_a: u8, key_a: &[u8], ns_b: u8, key_b: &[u8]) -> Ordering {
    ns_a.cmp(&ns_b).then_with(|| key_a.cmp(key_b))
}

// ------------------------------------------------------------------------------------------------
// Cell codec
// ------------------------------------------------------------------------------------------------

/// A decoded cell.
#[derive(Debug, Clone)]
pub(crate) struct Cell {
    pub(crate) kind: u8,
    /// Namespace rank (derived for data cells, stored for separators).
    pub(crate) ns: u8,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    /// Child page for separator cells; 0 otherwise.
    pub(crate) child: u32,
}

impl Cell {
    pub(crate) fn record_kind(&self) -> Option<RecordKind> {
        match self.kind {
            CELL_WRITE => Some(RecordKind::Write),
            CELL_DELETE => Some(RecordKind::Delete),
            CELL_SYS => Some(RecordKind::Sys),
            _ => None,
        }
    }
}

/// Encode a data record as a cell body.
pub(crate) fn encode_record_cell(rec: &Record) -> Vec<u8> {
    let mut out = Vec::with_capacity(rec.key.len() + rec.value.len() + 12);
    match rec.kind {
        RecordKind::Write => {
            out.push(CELL_WRITE);
            encoding::put_varint(&mut out, rec.key.len() as u64);
            encoding::put_varint(&mut out, rec.value.len() as u64);
            out.extend_from_slice(&rec.key);
            out.extend_from_slice(&rec.value);
        }
        RecordKind::Delete => {
            out.push(CELL_DELETE);
            encoding::put_varint(&mut out, rec.key.len() as u64);
            out.extend_from_slice(&rec.key);
        }
        RecordKind::Sys => {
            out.push(CELL_SYS);
            encoding::put_varint(&mut out, rec.key.len() as u64);
            encoding::put_varint(&mut out, rec.value.len() as u64);
            out.extend_from_slice(&rec.key);
            out.extend_from_slice(&rec.value);
        }
    }
    out
}

/// Encode a separator cell body.
pub(crate) fn encode_sep_cell(ns: u8, key: &[u8], child: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 10);
    out.push(CELL_SEP);
    out.push(ns);
    encoding::put_varint(&mut out, key.len() as u64);
    out.extend_from_slice(key);
    encoding::put_u32(&mut out, child);
    out
}

/// Decode one cell starting at `buf[0]`.
fn decode_cell(buf: &[u8], pgno: u32) -> Result<Cell, SegmentError> {
    let kind = *buf.first().ok_or(SegmentError::Corrupt(pgno))?;
    let rest = &buf[1..];
    match kind {
        CELL_WRITE | CELL_SYS => {
            let (klen, n1) =
                encoding::get_varint_len(rest).map_err(|_| SegmentError::Corrupt(pgno))?;
            let (vlen, n2) =
                encoding::get_varint_len(&rest[n1..]).map_err(|_| SegmentError::Corrupt(pgno))?;
            let key_at = n1 + n2;
            let key = rest
                .get(key_at..key_at + klen)
                .ok_or(SegmentError::Corrupt(pgno))?
                .to_vec();
            let value = rest
                .get(key_at + klen..key_at + klen + vlen)
                .ok_or(SegmentError::Corrupt(pgno))?
                .to_vec();
            Ok(Cell {
                kind,
                ns: if kind == CELL_SYS { 1 } else { 0 },
                key,
                value,
                child: 0,
            })
        }
        CELL_DELETE => {
            let (klen, n1) =
                encoding::get_varint_len(rest).map_err(|_| SegmentError::Corrupt(pgno))?;
            let key = rest
                .get(n1..n1 + klen)
                .ok_or(SegmentError::Corrupt(pgno))?
                .to_vec();
            Ok(Cell {
                kind,
                ns: 0,
                key,
                value: Vec::new(),
                child: 0,
            })
        }
        CELL_SEP => {
            let ns = *rest.first().ok_or(SegmentError::Corrupt(pgno))?;
            let rest = &rest[1..];
            let (klen, n1) =
                encoding::get_varint_len(rest).map_err(|_| SegmentError::Corrupt(pgno))?;
            let key = rest
                .get(n1..n1 + klen)
                .ok_or(SegmentError::Corrupt(pgno))?
                .to_vec();
            let child = encoding::get_u32_at(rest, n1 + klen)
                .map_err(|_| SegmentError::Corrupt(pgno))?;
            Ok(Cell {
                kind,
                ns,
                key,
                value: Vec::new(),
                child,
            })
        }
        _ => Err(SegmentError::Corrupt(pgno)),
    }
}

// ------------------------------------------------------------------------------------------------
// Page builder / view
// ------------------------------------------------------------------------------------------------

/// Builds one slotted page in memory.
pub(crate) struct PageBuilder {
    buf: Vec<u8>,
    page_size: usize,
    n_cells: u16,
    /// Next free byte for cell bodies.
    cell_top: usize,
}

impl PageBuilder {
    pub(crate) fn new(page_size: usize, flags: u16) -> Self {
        let mut buf = vec![0u8; page_size];
        // Header fields default to zero; flags set below.
        let _ = encoding::put_u16_at(&mut buf, OFF_FLAGS, flags);
        Self {
            buf,
            page_size,
            n_cells: 0,
            cell_top: PAGE_HDR_SIZE,
        }
    }

    /// Bytes available for one more cell (body + pointer slot).
    fn free_space(&self) -> usize {
        let ptr_array = 2 * (self.n_cells as usize + 1);
        (self.page_size - PAGE_CKSUM_SIZE)
            .saturating_sub(self.cell_top)
            .saturating_sub(ptr_array)
    }

    /// Largest cell body an empty page can hold.
    pub(crate) fn max_cell_size(page_size: usize) -> usize {
        page_size - PAGE_CKSUM_SIZE - PAGE_HDR_SIZE - 2
    }

    /// Append a cell body; `false` when it does not fit.
    pub(crate) fn try_add_cell(&mut self, cell: &[u8]) -> bool {
        if cell.len() > self.free_space() {
            return false;
        }
        let off = self.cell_top;
        self.buf[off..off + cell.len()].copy_from_slice(cell);
        self.cell_top += cell.len();

        let slot = self.page_size - PAGE_CKSUM_SIZE - 2 * (self.n_cells as usize + 1);
        let _ = encoding::put_u16_at(&mut self.buf, slot, off as u16);
        self.n_cells += 1;
        let _ = encoding::put_u16_at(&mut self.buf, OFF_NCELL, self.n_cells);
        true
    }

    pub(crate) fn n_cells(&self) -> u16 {
        self.n_cells
    }

    pub(crate) fn set_prev(&mut self, pgno: u32) {
        let _ = encoding::put_u32_at(&mut self.buf, OFF_PREV, pgno);
    }

    pub(crate) fn set_next(&mut self, pgno: u32) {
        let _ = encoding::put_u32_at(&mut self.buf, OFF_NEXT, pgno);
    }

    /// Hand the finished buffer to the pager.
    pub(crate) fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}

/// A fully decoded page.
#[derive(Debug, Clone)]
pub(crate) struct PageView {
    pub(crate) pgno: u32,
    pub(crate) flags: u16,
    pub(crate) prev: u32,
    pub(crate) next: u32,
    pub(crate) cells: Vec<Cell>,
}

impl PageView {
    /// Read and decode page `pgno`.
    pub(crate) fn load(pager: &Pager, pgno: u32) -> Result<Self, SegmentError> {
        let buf = pager.read_page(pgno)?;
        Self::decode(&buf, pgno, pager.page_size())
    }

    fn decode(buf: &[u8], pgno: u32, page_size: usize) -> Result<Self, SegmentError> {
        let n_cells =
            encoding::get_u16_at(buf, OFF_NCELL).map_err(|_| SegmentError::Corrupt(pgno))?;
        let flags =
            encoding::get_u16_at(buf, OFF_FLAGS).map_err(|_| SegmentError::Corrupt(pgno))?;
        let prev = encoding::get_u32_at(buf, OFF_PREV).map_err(|_| SegmentError::Corrupt(pgno))?;
        let next = encoding::get_u32_at(buf, OFF_NEXT).map_err(|_| SegmentError::Corrupt(pgno))?;

        let mut cells = Vec::with_capacity(n_cells as usize);
        for i in 0..n_cells as usize {
            let slot = page_size - PAGE_CKSUM_SIZE - 2 * (i + 1);
            let off =
                encoding::get_u16_at(buf, slot).map_err(|_| SegmentError::Corrupt(pgno))? as usize;
            if off < PAGE_HDR_SIZE || off >= page_size - PAGE_CKSUM_SIZE {
                return Err(SegmentError::Corrupt(pgno));
            }
            cells.push(decode_cell(&buf[off..], pgno)?);
        }

        Ok(Self {
            pgno,
            flags,
            prev,
            next,
            cells,
        })
    }

    pub(crate) fn is_separator(&self) -> bool {
        self.flags & FLAG_SEPARATOR != 0
    }

    /// Index of the first cell with `(ns, key) >= (target_ns, target)`.
    pub(crate) fn lower_bound(&self, target_ns: u8, target: &[u8]) -> usize {
        self.cells
            .partition_point(|c| cmp_ns_key(c.ns, &c.key, target_ns, target) == Ordering::Less)
    }
}

// ------------------------------------------------------------------------------------------------
// Page allocation
// ------------------------------------------------------------------------------------------------

/// Source of fresh pages for a segment writer.
///
/// Implemented by the worker over its private snapshot: pages come from
/// free blocks when the reader horizon allows, otherwise from growing
/// the file. Whole blocks are handed to one writer at a time, so every
/// block belongs to exactly one segment.
pub trait PageAlloc {
    /// Allocate the next page for the run being written.
    fn next_page(&mut self) -> Result<u32, SegmentError>;
}

// ------------------------------------------------------------------------------------------------
// Block reclamation
// ------------------------------------------------------------------------------------------------

/// Collect every distinct block owned by `seg`, walking the data chain
/// and each separator level.
pub fn collect_blocks(pager: &Pager, seg: &SegmentRecord) -> Result<Vec<u32>, SegmentError> {
    let mut blocks = Vec::new();
    let push = |pgno: u32, blocks: &mut Vec<u32>| {
        let b = pager.block_of_page(pgno);
        if !blocks.contains(&b) {
            blocks.push(b);
        }
    };

    // Data chain.
    let mut pgno = seg.first_pg;
    let mut guard = 0u32;
    while pgno != 0 {
        push(pgno, &mut blocks);
        if pgno == seg.last_pg {
            break;
        }
        let page = PageView::load(pager, pgno)?;
        pgno = page.next;
        guard += 1;
        if guard > seg.n_pages.saturating_add(8) {
            return Err(SegmentError::Internal(format!(
                "data page chain of segment at {} does not terminate",
                seg.first_pg
            )));
        }
    }

    // Separator levels: descend leftmost from the root, walking each
    // level's chain.
    let mut level_first = seg.root_pg;
    while level_first != 0 {
        let mut pgno = level_first;
        let mut first_view: Option<PageView> = None;
        while pgno != 0 {
            let page = PageView::load(pager, pgno)?;
            if !page.is_separator() {
                // Reached the data level, already collected above.
                first_view = None;
                break;
            }
            push(pgno, &mut blocks);
            if first_view.is_none() {
                first_view = Some(page.clone());
            }
            pgno = page.next;
            guard += 1;
            if guard > seg.n_pages.saturating_add(8) {
                return Err(SegmentError::Internal(format!(
                    "separator chain of segment at {} does not terminate",
                    seg.first_pg
                )));
            }
        }
        level_first = match first_view {
            Some(view) => view.cells.first().map(|c| c.child).unwrap_or(0),
            None => 0,
        };
        // Stop when the next level down is the data chain.
        if level_first != 0 {
            let probe = PageView::load(pager, level_first)?;
            if !probe.is_separator() {
                break;
            }
        }
    }

    Ok(blocks)
}
