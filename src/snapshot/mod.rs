//! Snapshots — the unit of crash-consistent publication.
//!
//! A [`Snapshot`] describes the whole on-disk structure at one instant:
//! the list of [`Level`]s (most recent first), the free-block list, the
//! geometry, and the log pointer. The worker owns a private mutable
//! snapshot; readers see immutable published snapshots shared by `Arc`.
//! The `Arc` count doubles as the reader reference count: a segment's
//! blocks may be reused only once every snapshot that references them
//! has been dropped (tracked through the per-free-block checkpoint id
//! and the reader horizon).
//!
//! Levels are held in a contiguous `Vec` and referenced by index —
//! never by pointer — so a snapshot clones cheaply and deep-copies
//! cleanly.

use crate::log::LogPtr;

// ------------------------------------------------------------------------------------------------
// Segment record
// ------------------------------------------------------------------------------------------------

/// The four-word description of one immutable sorted run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRecord {
    /// First data page of the run.
    pub first_pg: u32,

    /// Last data page of the run.
    pub last_pg: u32,

    /// Root page of the separator index, or 0 when none exists (a
    /// single-page run, or a merge output still being written).
    pub root_pg: u32,

    /// Total pages in the run, separator pages included.
    pub n_pages: u32,
}

impl SegmentRecord {
    /// True for the all-zero record (no segment).
    pub fn is_empty(&self) -> bool {
        self.first_pg == 0
    }
}

// ------------------------------------------------------------------------------------------------
// Merge state
// ------------------------------------------------------------------------------------------------

/// Where one merge input stream paused: next cell to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeInput {
    /// Page of the next cell, or 0 when the input is exhausted.
    pub pgno: u32,

    /// Cell index within that page.
    pub cell: u32,
}

/// Persistent cursor of an in-progress merge.
///
/// Serialized into the checkpoint so a crash mid-merge resumes at the
/// same split key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeState {
    /// One entry per input segment, in the level's `rhs` order.
    pub inputs: Vec<MergeInput>,

    /// Inputs already fully drained and detached from the front of the
    /// list (kept for checkpoint compatibility accounting).
    pub n_skip: u32,

    /// Page holding the current split key (last key merged).
    pub split_pg: u32,

    /// Cell of the current split key within `split_pg`.
    pub split_cell: u32,
}

// ------------------------------------------------------------------------------------------------
// Level
// ------------------------------------------------------------------------------------------------

/// Observable state of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelState {
    /// `rhs` is empty; `lhs` holds the level's entire content.
    Stable,
    /// Input segments are still being merged into `lhs`.
    Merging,
}

/// One stage of the LSM hierarchy.
///
/// Invariant: `merge.is_some()` exactly when `rhs` is non-empty.
/// During a merge, every record already merged lives in `lhs` and is
/// `<=` the split key; records still pending live in the `rhs` inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Level {
    /// Age of the level; higher is older.
    pub age: u32,

    /// The level's own (output) segment.
    pub lhs: SegmentRecord,

    /// Input segments being merged into `lhs`, youngest first.
    pub rhs: Vec<SegmentRecord>,

    /// Merge cursor; present exactly while `rhs` is non-empty.
    pub merge: Option<MergeState>,
}

impl Level {
    /// A stable level holding a single segment.
    pub fn stable(age: u32, lhs: SegmentRecord) -> Self {
        Self {
            age,
            lhs,
            rhs: Vec::new(),
            merge: None,
        }
    }

    /// Current state per the merge state machine.
    pub fn state(&self) -> LevelState {
        debug_assert_eq!(self.rhs.is_empty(), self.merge.is_none());
        if self.rhs.is_empty() {
            LevelState::Stable
        } else {
            LevelState::Merging
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Free-block list
// ------------------------------------------------------------------------------------------------

/// A block available for reuse, tagged with the checkpoint id that was
/// current when it was freed.
///
/// The tag gates reuse: a reader holding a snapshot older than
/// `freed_at` may still be iterating pages in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// 1-based block number.
    pub block: u32,

    /// Checkpoint id current when the block was freed.
    pub freed_at: u64,
}

// ------------------------------------------------------------------------------------------------
// Snapshot
// ------------------------------------------------------------------------------------------------

/// A consistent description of the database structure.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Monotonically increasing checkpoint id.
    pub ckpt_id: u64,

    /// Levels, most recent first.
    pub levels: Vec<Level>,

    /// Total data blocks in the file.
    pub n_block: u32,

    /// Page size the file was created with.
    pub page_size: u32,

    /// Block size the file was created with.
    pub block_size: u32,

    /// Log position this snapshot is consistent with.
    pub log_ptr: LogPtr,

    /// Blocks available for allocation.
    pub free: Vec<FreeBlock>,
}

impl Snapshot {
    /// Fresh snapshot for a newly created database.
    pub fn initial(page_size: u32, block_size: u32) -> Self {
        Self {
            ckpt_id: 0,
            levels: Vec::new(),
            n_block: 0,
            page_size,
            block_size,
            log_ptr: LogPtr::default(),
            free: Vec::new(),
        }
    }

    /// Every segment a cursor must consult, youngest source first.
    ///
    /// Within a level the `rhs` inputs are younger than the partially
    /// merged `lhs` output, so they come first.
    pub fn reader_segments(&self) -> Vec<SegmentRecord> {
        let mut out = Vec::new();
        for level in &self.levels {
            for seg in &level.rhs {
                if !seg.is_empty() {
                    out.push(*seg);
                }
            }
            if !level.lhs.is_empty() {
                out.push(level.lhs);
            }
        }
        out
    }

    /// Return `block` to the free list, tagged with the current
    /// checkpoint id.
    pub fn free_block(&mut self, block: u32, freed_at: u64) {
        debug_assert!(self.free.iter().all(|fb| fb.block != block));
        self.free.push(FreeBlock { block, freed_at });
    }
}
