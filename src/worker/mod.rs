//! The worker — flush, merge, checkpoint.
//!
//! The worker is the only writer of segments and the only mutator of
//! the worker snapshot. The database serializes entry through the
//! worker lock; each operation here is idempotent and leaves the
//! snapshot untouched on failure (blocks allocated for an abandoned
//! segment go straight back to the free list — they were never
//! referenced by any published snapshot).
//!
//! # Operations
//!
//! - **flush** — drain a frozen tree view into a new level-0 segment,
//!   embedding LEVELS/FREELIST system records when the next checkpoint
//!   is planned to overflow the meta page.
//! - **merge** — advance the oldest in-progress merge by a page
//!   budget, or start one per the `segment_ratio` policy; the merge
//!   cursor is persisted in the level so a crash resumes at the same
//!   split key.
//! - **checkpoint** — serialize the snapshot, sync the data file,
//!   write the meta page opposite the last one, sync again. The
//!   second sync is the publication point.
//!
//! # Merge policy
//!
//! Adjacent levels must keep a size ratio of at least `segment_ratio`:
//! when `lhs(i).pages × ratio >= lhs(i+1).pages`, level *i* is merged
//! into *i+1*. With OPTIMIZE set the ratio is ignored and merging
//! continues until a single stable level remains. Tombstones are
//! emitted through every merge except one producing the oldest level,
//! where nothing older can be shadowed.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::checkpoint::{self, CheckpointError, FreePayload};
use crate::log::LogPtr;
use crate::pager::{Pager, PagerError};
use crate::segment::{
    self, PageAlloc, Record, RecordKind, SegmentCursor, SegmentError, SegmentWriter, cmp_ns_key,
};
use crate::snapshot::{FreeBlock, Level, LevelState, MergeInput, MergeState, SegmentRecord};
use crate::tree::TreeView;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by worker operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Segment read/write failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Pager failure.
    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    /// Checkpoint serialization failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A checkpoint needs fresh LEVELS/FREELIST system records, which
    /// only a flush can write. The database layer flushes and retries.
    #[error("checkpoint requires a flush to refresh overflow records")]
    NeedsFlush,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Page allocation over the worker snapshot
// ------------------------------------------------------------------------------------------------

/// Hands whole blocks from the snapshot's free list (or file growth)
/// to one segment writer, page by page.
struct BlockPages<'a> {
    pager: &'a Pager,
    free: &'a mut Vec<FreeBlock>,
    n_block: &'a mut u32,
    horizon: u64,
    /// `(next page, last page)` of the block being consumed.
    cur: Option<(u32, u32)>,
    /// Blocks taken during this session, for abandon-on-error.
    taken: Vec<u32>,
}

impl<'a> BlockPages<'a> {
    fn new(
        pager: &'a Pager,
        free: &'a mut Vec<FreeBlock>,
        n_block: &'a mut u32,
        horizon: u64,
    ) -> Self {
        Self {
            pager,
            free,
            n_block,
            horizon,
            cur: None,
            taken: Vec::new(),
        }
    }

    fn alloc_block(&mut self) -> Result<u32, SegmentError> {
        // Tail-first, mirroring Snapshot::alloc_block: keeps the free
        // list's front a stable prefix of the FREELIST system record.
        if let Some(idx) = self.free.iter().rposition(|fb| fb.freed_at <= self.horizon) {
            let fb = self.free.remove(idx);
            self.taken.push(fb.block);
            return Ok(fb.block);
        }
        *self.n_block += 1;
        self.pager.extend_to_blocks(*self.n_block)?;
        self.taken.push(*self.n_block);
        Ok(*self.n_block)
    }

    /// Return this session's blocks to the free list after an error.
    /// They were never referenced, so they are reusable immediately.
    fn abandon(self) {
        for block in self.taken {
            self.free.push(FreeBlock { block, freed_at: 0 });
        }
    }
}

impl PageAlloc for BlockPages<'_> {
    fn next_page(&mut self) -> Result<u32, SegmentError> {
        if let Some((next, last)) = self.cur {
            if next <= last {
                self.cur = Some((next + 1, last));
                return Ok(next);
            }
        }
        let block = self.alloc_block()?;
        let first = self.pager.first_page_of_block(block);
        let last = self.pager.last_page_of_block(block);
        self.cur = Some((first + 1, last));
        Ok(first)
    }
}

// ------------------------------------------------------------------------------------------------
// Worker
// ------------------------------------------------------------------------------------------------

/// Outcome of one checkpoint operation.
pub struct CheckpointOutcome {
    /// Meta slot that now holds the live checkpoint.
    pub slot: u8,

    /// Log pointer the installed checkpoint carries.
    pub log_ptr: LogPtr,
}

/// The worker state: the private snapshot plus overflow bookkeeping.
pub struct Worker {
    pager: Arc<Pager>,

    /// The only mutable snapshot in the system.
    snap: crate::snapshot::Snapshot,

    /// Meta slot holding the most recent durable checkpoint (0 when
    /// the file is fresh).
    last_meta_slot: u8,

    /// Snapshot changed since the last checkpoint.
    dirty: bool,

    /// Free list as last written to the FREELIST system record, plus
    /// the levels tail written to LEVELS, when overflow is active.
    ovfl_free_base: Option<Vec<u32>>,
    ovfl_levels_tail: Option<Vec<Level>>,
}

impl Worker {
    /// Build the worker over a recovered (or fresh) snapshot.
    pub fn new(pager: Arc<Pager>, snap: crate::snapshot::Snapshot, last_meta_slot: u8) -> Self {
        Self {
            pager,
            snap,
            last_meta_slot,
            dirty: false,
            ovfl_free_base: None,
            ovfl_levels_tail: None,
        }
    }

    /// The worker snapshot (read-only outside this module).
    pub fn snapshot(&self) -> &crate::snapshot::Snapshot {
        &self.snap
    }

    /// Clone the snapshot for publication to readers.
    pub fn publish_clone(&self) -> crate::snapshot::Snapshot {
        self.snap.clone()
    }

    /// True when the snapshot has changes no checkpoint covers yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // --------------------------------------------------------------------------------------------
    // FLUSH
    // --------------------------------------------------------------------------------------------

    /// Drain a frozen tree view into a new level-0 segment.
    ///
    /// `log_ptr` is the log position the view is consistent with — it
    /// becomes the snapshot's log pointer. The caller must hold the
    /// writer quiescent (no open transaction) and clear the tree only
    /// after this returns `Ok`.
    ///
    /// Returns the number of pages written (zero when there was
    /// nothing to flush).
    pub fn flush(
        &mut self,
        view: &TreeView,
        log_ptr: LogPtr,
        horizon: u64,
    ) -> Result<u32, WorkerError> {
        // Decide up front whether this segment must carry overflow
        // records; the plan reserves room for the level being created.
        let plan = checkpoint::overflow_plan(&self.snap);
        let tail: Vec<Level> = if plan.ovfl {
            self.snap.levels[plan.inline_levels..].to_vec()
        } else {
            Vec::new()
        };

        if view.is_empty() && !plan.ovfl {
            return Ok(0);
        }

        // The system records serialize the pre-flush free list.
        // Allocation takes from the list's tail, so whatever this
        // flush consumes leaves the recorded front a valid prefix for
        // the checkpoint delta.
        let sys = plan.ovfl.then(|| {
            (
                free_base_of(&self.snap.free),
                checkpoint::encode_free_record(&self.snap.free),
                checkpoint::encode_levels_record(&tail),
            )
        });

        let mut free = std::mem::take(&mut self.snap.free);
        let mut n_block = self.snap.n_block;
        let mut alloc = BlockPages::new(&self.pager, &mut free, &mut n_block, horizon);
        let result = write_flush_segment(
            &self.pager,
            &mut alloc,
            view,
            sys.as_ref().map(|(_, f, l)| (f.as_slice(), l.as_slice())),
        );

        match result {
            Ok(seg) => {
                drop(alloc);
                self.snap.free = free;
                self.snap.n_block = n_block;
                self.snap.levels.insert(0, Level::stable(0, seg));
                self.snap.log_ptr = log_ptr;
                self.dirty = true;
                if let Some((free_base, _, _)) = sys {
                    self.ovfl_free_base = Some(free_base);
                    self.ovfl_levels_tail = Some(tail);
                }
                info!(
                    pages = seg.n_pages,
                    entries = view.len(),
                    ovfl = plan.ovfl,
                    "flushed tree to level-0 segment"
                );
                Ok(seg.n_pages)
            }
            Err(e) => {
                // Abandon: the partial segment was never referenced.
                warn!(error = %e, "flush abandoned");
                alloc.abandon();
                self.snap.free = free;
                self.snap.n_block = n_block;
                Err(e.into())
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // MERGE
    // --------------------------------------------------------------------------------------------

    /// Perform up to `n_page` pages of merge output.
    ///
    /// Continues an in-progress merge first; otherwise starts one per
    /// the size-ratio policy (ignored under `optimize`). Returns pages
    /// written — zero when nothing is eligible.
    pub fn merge(
        &mut self,
        n_page: u32,
        segment_ratio: u32,
        optimize: bool,
        horizon: u64,
    ) -> Result<u32, WorkerError> {
        let budget = n_page.max(1);

        let idx = match self.pick_merge(segment_ratio, optimize) {
            Some(idx) => idx,
            None => return Ok(0),
        };
        let written = self.merge_step(idx, budget, horizon)?;
        if written > 0 {
            self.dirty = true;
        }
        Ok(written)
    }

    /// Choose the level to work on: an existing merge, or a new one.
    fn pick_merge(&mut self, segment_ratio: u32, optimize: bool) -> Option<usize> {
        if let Some(idx) = self
            .snap
            .levels
            .iter()
            .position(|l| l.state() == LevelState::Merging)
        {
            return Some(idx);
        }

        let levels = &self.snap.levels;
        let start = if optimize {
            (levels.len() >= 2).then_some(0)
        } else {
            (0..levels.len().saturating_sub(1)).find(|&i| {
                let young = levels[i].lhs.n_pages as u64;
                let old = levels[i + 1].lhs.n_pages as u64;
                young * segment_ratio as u64 >= old
            })
        };

        let idx = start?;
        self.start_merge(idx);
        self.dirty = true;
        Some(idx)
    }

    /// Collapse levels `idx` and `idx + 1` into one MERGING level.
    fn start_merge(&mut self, idx: usize) {
        let old = self.snap.levels.remove(idx + 1);
        let young = std::mem::take(&mut self.snap.levels[idx]);

        let rhs = vec![young.lhs, old.lhs];
        let inputs = rhs
            .iter()
            .map(|seg| MergeInput {
                pgno: seg.first_pg,
                cell: 0,
            })
            .collect();

        self.snap.levels[idx] = Level {
            age: young.age.max(old.age) + 1,
            lhs: SegmentRecord::default(),
            rhs,
            merge: Some(MergeState {
                inputs,
                n_skip: 0,
                split_pg: 0,
                split_cell: 0,
            }),
        };
        debug!(
            level = idx,
            age = self.snap.levels[idx].age,
            "merge started"
        );
    }

    /// Advance the merge at `idx` by up to `budget` output pages.
    fn merge_step(&mut self, idx: usize, budget: u32, horizon: u64) -> Result<u32, WorkerError> {
        let level = self.snap.levels[idx].clone();
        let merge = level
            .merge
            .clone()
            .ok_or_else(|| WorkerError::Internal("merge_step on a stable level".into()))?;
        // Tombstones may be dropped only when producing the oldest level.
        let drop_tombstones = idx == self.snap.levels.len() - 1;

        // Input cursors at their persisted positions.
        let mut inputs: Vec<SegmentCursor> = Vec::with_capacity(level.rhs.len());
        for (seg, pos) in level.rhs.iter().zip(&merge.inputs) {
            let mut cursor = SegmentCursor::new(Arc::clone(&self.pager), *seg);
            cursor.position_at(pos.pgno, pos.cell)?;
            inputs.push(cursor);
        }

        let mut free = std::mem::take(&mut self.snap.free);
        let mut n_block = self.snap.n_block;
        let mut alloc = BlockPages::new(&self.pager, &mut free, &mut n_block, horizon);
        let result = run_merge(
            &self.pager,
            &mut alloc,
            &mut inputs,
            &level,
            budget,
            drop_tombstones,
        );

        match result {
            Ok(step) => {
                drop(alloc);
                self.snap.free = free;
                self.snap.n_block = n_block;
                self.apply_merge_step(idx, &inputs, step)
            }
            Err(e) => {
                warn!(error = %e, level = idx, "merge step abandoned");
                alloc.abandon();
                self.snap.free = free;
                self.snap.n_block = n_block;
                Err(e.into())
            }
        }
    }

    /// Fold a completed merge step back into the level list.
    fn apply_merge_step(
        &mut self,
        idx: usize,
        inputs: &[SegmentCursor],
        step: MergeStepResult,
    ) -> Result<u32, WorkerError> {
        if step.exhausted {
            // COMPLETE: the inputs drain back to the free list and the
            // level becomes STABLE with the merged output — or
            // disappears entirely when everything was annihilated by
            // tombstones.
            let rhs = std::mem::take(&mut self.snap.levels[idx].rhs);
            self.snap.levels[idx].merge = None;
            self.snap.levels[idx].lhs = step.output;

            let freed_at = self.snap.ckpt_id + 1;
            let mut freed = Vec::new();
            for seg in &rhs {
                for block in segment::collect_blocks(&self.pager, seg)? {
                    freed.push(block);
                }
            }
            for block in freed {
                self.snap.free_block(block, freed_at);
            }

            if step.output.is_empty() {
                self.snap.levels.remove(idx);
            }
            info!(level = idx, pages = step.pages, "merge complete");
        } else {
            let level = &mut self.snap.levels[idx];
            level.lhs = step.output;
            let merge = level
                .merge
                .as_mut()
                .ok_or_else(|| WorkerError::Internal("merging level lost its state".into()))?;
            for (input, cursor) in merge.inputs.iter_mut().zip(inputs.iter()) {
                *input = match cursor.position() {
                    Some((pgno, cell)) => MergeInput { pgno, cell },
                    None => MergeInput { pgno: 0, cell: 0 },
                };
            }
            merge.split_pg = step.split.0;
            merge.split_cell = step.split.1;
            trace!(
                level = idx,
                pages = step.pages,
                split_pg = merge.split_pg,
                "merge paused"
            );
        }
        Ok(step.pages)
    }

    // --------------------------------------------------------------------------------------------
    // CHECKPOINT
    // --------------------------------------------------------------------------------------------

    /// Serialize and durably install the worker snapshot.
    ///
    /// `sync` is false only under safety level *off*. Returns `None`
    /// when the snapshot is already covered by the live checkpoint.
    pub fn checkpoint(&mut self, sync: bool) -> Result<Option<CheckpointOutcome>, WorkerError> {
        if !self.dirty {
            return Ok(None);
        }

        let plan = checkpoint::overflow_plan(&self.snap);
        let payload = if plan.ovfl {
            self.overflow_delta(plan.inline_levels)?
        } else {
            FreePayload::Full(&self.snap.free)
        };

        let mut snap = self.snap.clone();
        snap.ckpt_id += 1;
        let blob = checkpoint::encode(&snap, plan.inline_levels, payload)?;

        // Data first, then the meta page, then the barrier that makes
        // the new checkpoint live. The previous slot stays intact
        // throughout, so a crash at any point leaves a valid meta page.
        if sync {
            self.pager.sync()?;
        }
        let slot = if self.last_meta_slot == 1 { 2 } else { 1 };
        self.pager.write_meta(slot, &blob)?;
        if sync {
            self.pager.sync()?;
        }

        self.snap.ckpt_id = snap.ckpt_id;
        self.last_meta_slot = slot;
        self.dirty = false;
        info!(
            ckpt_id = self.snap.ckpt_id,
            slot,
            levels = self.snap.levels.len(),
            ovfl = plan.ovfl,
            "checkpoint installed"
        );
        Ok(Some(CheckpointOutcome {
            slot,
            log_ptr: self.snap.log_ptr,
        }))
    }

    /// Build the overflow delta, or demand a flush when the system
    /// records are stale.
    fn overflow_delta(&self, inline_levels: usize) -> Result<FreePayload<'_>, WorkerError> {
        let base = self.ovfl_free_base.as_ref().ok_or(WorkerError::NeedsFlush)?;
        let tail = self
            .ovfl_levels_tail
            .as_ref()
            .ok_or(WorkerError::NeedsFlush)?;

        // The LEVELS record must describe exactly the levels that will
        // not be inline.
        if self.snap.levels.len() < inline_levels
            || self.snap.levels[inline_levels..] != tail[..]
        {
            return Err(WorkerError::NeedsFlush);
        }

        // Longest prefix of the recorded list still present, in order.
        let mut keep = 0usize;
        for fb in &self.snap.free {
            if keep < base.len() && base[keep] == fb.block {
                keep += 1;
            } else {
                break;
            }
        }
        let extras: Vec<u32> = self.snap.free[keep..]
            .iter()
            .map(|fb| fb.block)
            .filter(|b| !base[..keep].contains(b))
            .collect();
        if extras.len() > 2 {
            return Err(WorkerError::NeedsFlush);
        }
        let mut refree = [0u32; 2];
        for (slot, block) in refree.iter_mut().zip(extras.iter()) {
            *slot = *block;
        }
        Ok(FreePayload::Delta([keep as u32, refree[0], refree[1]]))
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("ckpt_id", &self.snap.ckpt_id)
            .field("levels", &self.snap.levels.len())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

fn free_base_of(free: &[FreeBlock]) -> Vec<u32> {
    free.iter().map(|fb| fb.block).collect()
}

// ------------------------------------------------------------------------------------------------
// Flush and merge inner loops
// ------------------------------------------------------------------------------------------------

/// Stream a tree view (plus optional FREELIST/LEVELS payloads) into a
/// brand-new segment.
fn write_flush_segment(
    pager: &Pager,
    alloc: &mut BlockPages<'_>,
    view: &TreeView,
    sys: Option<(&[u8], &[u8])>,
) -> Result<SegmentRecord, SegmentError> {
    let mut writer = SegmentWriter::new(pager, alloc);
    for (key, value) in view.entries() {
        let rec = match value {
            Some(v) => Record::write(key.clone(), v.clone()),
            None => Record::tombstone(key.clone()),
        };
        writer.push(&rec)?;
    }

    if let Some((free_blob, levels_blob)) = sys {
        // System records sort after every user record, FREELIST before
        // LEVELS by key; each blob is chunked to fit page cells.
        let max_chunk = sys_chunk_payload(pager.page_size());
        for (base, blob) in [
            (checkpoint::SYS_FREELIST_KEY, free_blob),
            (checkpoint::SYS_LEVELS_KEY, levels_blob),
        ] {
            for (index, value) in checkpoint::chunk_blob(blob, max_chunk).into_iter().enumerate() {
                writer.push(&Record::system(
                    checkpoint::sys_chunk_key(base, index as u32),
                    value,
                ))?;
            }
        }
    }

    writer.finish(true)
}

/// Largest chunk value that safely fits a page cell next to its key.
pub(crate) fn sys_chunk_payload(page_size: usize) -> usize {
    crate::segment::PageBuilder::max_cell_size(page_size).saturating_sub(64)
}

struct MergeStepResult {
    output: SegmentRecord,
    pages: u32,
    split: (u32, u32),
    exhausted: bool,
}

/// Drain up to `budget` output pages from the input cursors into the
/// level's output segment. Younger inputs (lower index) win key ties;
/// tombstones shadow older records and are dropped entirely only when
/// `drop_tombstones` is set.
fn run_merge(
    pager: &Pager,
    alloc: &mut BlockPages<'_>,
    inputs: &mut [SegmentCursor],
    level: &Level,
    budget: u32,
    drop_tombstones: bool,
) -> Result<MergeStepResult, SegmentError> {
    let mut writer = if level.lhs.is_empty() {
        SegmentWriter::new(pager, alloc)
    } else {
        SegmentWriter::resume(pager, alloc, level.lhs)
    };

    let mut split = (
        level.merge.as_ref().map(|m| m.split_pg).unwrap_or(0),
        level.merge.as_ref().map(|m| m.split_cell).unwrap_or(0),
    );

    loop {
        if writer.session_pages() >= budget {
            break;
        }

        // Front record with the smallest (namespace, key); youngest
        // input wins ties.
        let mut winner: Option<usize> = None;
        for (i, cursor) in inputs.iter().enumerate() {
            let (Some(ns), Some(key)) = (cursor.ns(), cursor.key()) else {
                continue;
            };
            winner = match winner {
                None => Some(i),
                Some(w) => {
                    let w_ns = inputs[w].ns().unwrap_or(0);
                    let w_key = inputs[w].key().unwrap_or(&[]);
                    if cmp_ns_key(ns, key, w_ns, w_key) == std::cmp::Ordering::Less {
                        Some(i)
                    } else {
                        Some(w)
                    }
                }
            };
        }
        let Some(w) = winner else { break };

        let record = inputs[w]
            .record()
            .ok_or_else(|| SegmentError::Internal("merge winner lost its record".into()))?;

        // Advance every input sitting on the same key: older duplicates
        // are superseded by the winner.
        let ns = record.kind.ns();
        for cursor in inputs.iter_mut() {
            if cursor.valid()
                && cursor.ns() == Some(ns)
                && cursor.key() == Some(record.key.as_slice())
            {
                cursor.next()?;
            }
        }

        if record.kind == RecordKind::Delete && drop_tombstones {
            continue;
        }
        split = writer.push(&record)?;
    }

    let exhausted = inputs.iter().all(|c| !c.valid());
    let before = level.lhs.n_pages;
    let output = if exhausted && writer.is_empty() {
        // Every record was annihilated (tombstones at the oldest
        // level): the output segment does not exist.
        SegmentRecord::default()
    } else {
        writer.finish(exhausted)?
    };

    Ok(MergeStepResult {
        output,
        pages: output.n_pages.saturating_sub(before),
        split,
        exhausted,
    })
}
