//! Database cursors — merged iteration over one pinned snapshot.
//!
//! A cursor merges one sub-cursor over the frozen in-memory tree with
//! one sub-cursor per segment of a pinned [`Snapshot`]. Sources are
//! ranked youngest first (the tree, then segments from the newest level
//! down); on a key collision the youngest source wins and shadows the
//! rest, and a winning tombstone makes the cursor skip the key in the
//! current scan direction.
//!
//! Cursor results are stable: the snapshot is pinned by `Arc` (which
//! also keeps its blocks from being reused — the reader registry tracks
//! the pin) and the tree image is an immutable frozen view, so writes
//! and worker activity after `open` are never observed.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;

use crate::pager::Pager;
use crate::segment::reader::SeekBias;
use crate::segment::{RecordKind, SegmentCursor, SegmentError};
use crate::snapshot::Snapshot;
use crate::tree::TreeView;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by cursor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CursorError {
    /// Underlying segment read failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),
}

// ------------------------------------------------------------------------------------------------
// Public types
// ------------------------------------------------------------------------------------------------

/// Seek relation, mirroring the public API contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Exact key only.
    Eq,
    /// Smallest key `>=` the target.
    Ge,
    /// Largest key `<=` the target.
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

// ------------------------------------------------------------------------------------------------
// Sub-cursor sources
// ------------------------------------------------------------------------------------------------

/// Sub-cursor over the frozen tree view.
struct TreeSource {
    view: Arc<TreeView>,
    idx: usize,
    valid: bool,
}

impl TreeSource {
    fn first(&mut self) {
        self.idx = 0;
        self.valid = !self.view.is_empty();
    }

    fn last(&mut self) {
        self.valid = !self.view.is_empty();
        self.idx = self.view.len().saturating_sub(1);
    }

    fn next(&mut self) {
        if self.valid {
            self.idx += 1;
            self.valid = self.idx < self.view.len();
        }
    }

    fn prev(&mut self) {
        if self.valid {
            if self.idx == 0 {
                self.valid = false;
            } else {
                self.idx -= 1;
            }
        }
    }

    fn seek(&mut self, key: &[u8], bias: SeekBias) {
        let lb = self.view.lower_bound(key);
        match bias {
            SeekBias::Ge | SeekBias::Eq => {
                self.idx = lb;
                self.valid = lb < self.view.len();
            }
            SeekBias::Le => {
                let at = self
                    .view
                    .entries()
                    .get(lb)
                    .map(|(k, _)| k.as_slice() == key)
                    .unwrap_or(false);
                if at {
                    self.idx = lb;
                    self.valid = true;
                } else if lb > 0 {
                    self.idx = lb - 1;
                    self.valid = true;
                } else {
                    self.valid = false;
                }
            }
        }
    }

    fn key(&self) -> Option<&[u8]> {
        if !self.valid {
            return None;
        }
        self.view.entries().get(self.idx).map(|(k, _)| k.as_slice())
    }

    fn is_tombstone(&self) -> bool {
        self.view
            .entries()
            .get(self.idx)
            .is_some_and(|(_, v)| v.is_none())
    }

    fn value(&self) -> Option<&[u8]> {
        self.view
            .entries()
            .get(self.idx)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// One merge source: the tree or a segment, youngest rank first.
enum Source {
    Tree(TreeSource),
    Segment(SegmentCursor),
}

impl Source {
    fn first(&mut self) -> Result<(), CursorError> {
        match self {
            Source::Tree(t) => {
                t.first();
                Ok(())
            }
            Source::Segment(s) => {
                s.first()?;
                // A run that begins with system records has no user
                // records at all.
                if s.valid() && s.ns() == Some(1) {
                    clamp_invalid(s);
                }
                Ok(())
            }
        }
    }

    fn last(&mut self) -> Result<(), CursorError> {
        match self {
            Source::Tree(t) => {
                t.last();
                Ok(())
            }
            Source::Segment(s) => {
                s.last()?;
                // Walk backward off any trailing system records.
                while s.valid() && s.ns() == Some(1) {
                    s.prev()?;
                }
                Ok(())
            }
        }
    }

    fn next(&mut self) -> Result<(), CursorError> {
        match self {
            Source::Tree(t) => {
                t.next();
                Ok(())
            }
            Source::Segment(s) => {
                s.next()?;
                if s.valid() && s.ns() == Some(1) {
                    clamp_invalid(s);
                }
                Ok(())
            }
        }
    }

    fn prev(&mut self) -> Result<(), CursorError> {
        match self {
            Source::Tree(t) => {
                t.prev();
                Ok(())
            }
            Source::Segment(s) => {
                s.prev()?;
                Ok(())
            }
        }
    }

    fn seek(&mut self, key: &[u8], bias: SeekBias) -> Result<(), CursorError> {
        match self {
            Source::Tree(t) => {
                t.seek(key, bias);
                Ok(())
            }
            Source::Segment(s) => {
                s.seek(0, key, bias)?;
                if s.valid() && s.ns() == Some(1) {
                    clamp_invalid(s);
                }
                Ok(())
            }
        }
    }

    fn valid(&self) -> bool {
        match self {
            Source::Tree(t) => t.valid,
            Source::Segment(s) => s.valid(),
        }
    }

    fn key(&self) -> Option<&[u8]> {
        match self {
            Source::Tree(t) => t.key(),
            Source::Segment(s) => s.key(),
        }
    }

    fn is_tombstone(&self) -> bool {
        match self {
            Source::Tree(t) => t.is_tombstone(),
            Source::Segment(s) => s.kind() == Some(RecordKind::Delete),
        }
    }

    fn value(&self) -> Option<&[u8]> {
        match self {
            Source::Tree(t) => t.value(),
            Source::Segment(s) => s.value(),
        }
    }
}

/// Invalidate a segment cursor that ran into the system namespace: user
/// iteration never crosses into it going forward.
fn clamp_invalid(s: &mut SegmentCursor) {
    s.invalidate();
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// A merged, snapshot-pinned database cursor.
pub struct Cursor {
    /// Pinned snapshot; the `Arc` doubles as the reader reference.
    snapshot: Arc<Snapshot>,

    /// Merge sources, youngest rank first (tree, then segments).
    sources: Vec<Source>,

    direction: Direction,

    /// Winning source index when valid.
    current: Option<usize>,
}

impl Cursor {
    /// Open a cursor over `snapshot` and a frozen tree image.
    pub fn new(pager: Arc<Pager>, snapshot: Arc<Snapshot>, view: Arc<TreeView>) -> Self {
        let mut sources = vec![Source::Tree(TreeSource {
            view,
            idx: 0,
            valid: false,
        })];
        for seg in snapshot.reader_segments() {
            sources.push(Source::Segment(SegmentCursor::new(Arc::clone(&pager), seg)));
        }
        Self {
            snapshot,
            sources,
            direction: Direction::Forward,
            current: None,
        }
    }

    /// The snapshot this cursor pins.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// True when positioned on a record.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Key of the current record.
    pub fn key(&self) -> Option<&[u8]> {
        self.current.and_then(|i| self.sources[i].key())
    }

    /// Value of the current record.
    pub fn value(&self) -> Option<&[u8]> {
        self.current.and_then(|i| self.sources[i].value())
    }

    /// Position on the smallest key.
    pub fn first(&mut self) -> Result<(), CursorError> {
        for source in &mut self.sources {
            source.first()?;
        }
        self.direction = Direction::Forward;
        self.settle_forward()
    }

    /// Position on the largest key.
    pub fn last(&mut self) -> Result<(), CursorError> {
        for source in &mut self.sources {
            source.last()?;
        }
        self.direction = Direction::Reverse;
        self.settle_backward()
    }

    /// Position relative to `key` per `mode`.
    pub fn seek(&mut self, key: &[u8], mode: SeekMode) -> Result<(), CursorError> {
        match mode {
            SeekMode::Ge | SeekMode::Eq => {
                for source in &mut self.sources {
                    source.seek(key, SeekBias::Ge)?;
                }
                self.direction = Direction::Forward;
                self.settle_forward()?;
                if mode == SeekMode::Eq && self.key() != Some(key) {
                    self.current = None;
                }
            }
            SeekMode::Le => {
                for source in &mut self.sources {
                    source.seek(key, SeekBias::Le)?;
                }
                self.direction = Direction::Reverse;
                self.settle_backward()?;
            }
        }
        Ok(())
    }

    /// Advance to the next visible key.
    pub fn next(&mut self) -> Result<(), CursorError> {
        let Some(cur) = self.current else {
            return Ok(());
        };
        let key = match self.sources[cur].key() {
            Some(k) => k.to_vec(),
            None => return Ok(()),
        };
        if self.direction == Direction::Reverse {
            // Re-align every source for forward motion from this key.
            for source in &mut self.sources {
                source.seek(&key, SeekBias::Ge)?;
            }
            self.direction = Direction::Forward;
        }
        self.step_past_forward(&key)?;
        self.settle_forward()
    }

    /// Retreat to the previous visible key.
    pub fn prev(&mut self) -> Result<(), CursorError> {
        let Some(cur) = self.current else {
            return Ok(());
        };
        let key = match self.sources[cur].key() {
            Some(k) => k.to_vec(),
            None => return Ok(()),
        };
        if self.direction == Direction::Forward {
            for source in &mut self.sources {
                source.seek(&key, SeekBias::Le)?;
            }
            self.direction = Direction::Reverse;
        }
        self.step_past_backward(&key)?;
        self.settle_backward()
    }

    // --------------------------------------------------------------------------------------------
    // Merge mechanics
    // --------------------------------------------------------------------------------------------

    /// Advance every source positioned at `key`.
    fn step_past_forward(&mut self, key: &[u8]) -> Result<(), CursorError> {
        for source in &mut self.sources {
            if source.valid() && source.key() == Some(key) {
                source.next()?;
            }
        }
        Ok(())
    }

    /// Retreat every source positioned at `key`.
    fn step_past_backward(&mut self, key: &[u8]) -> Result<(), CursorError> {
        for source in &mut self.sources {
            if source.valid() && source.key() == Some(key) {
                source.prev()?;
            }
        }
        Ok(())
    }

    /// Choose the forward winner: smallest key, youngest source on
    /// ties; skip keys whose winner is a tombstone.
    fn settle_forward(&mut self) -> Result<(), CursorError> {
        loop {
            let mut winner: Option<usize> = None;
            for (i, source) in self.sources.iter().enumerate() {
                let Some(k) = source.key() else { continue };
                winner = match winner {
                    None => Some(i),
                    // Strictly-less replaces: on equal keys the earlier
                    // (younger) source already holds the win.
                    Some(w) if k < self.sources[w].key().unwrap_or(&[]) => Some(i),
                    Some(w) => Some(w),
                };
            }
            let Some(w) = winner else {
                self.current = None;
                return Ok(());
            };
            if self.sources[w].is_tombstone() {
                let key = self.sources[w].key().map(<[u8]>::to_vec).unwrap_or_default();
                self.step_past_forward(&key)?;
                continue;
            }
            self.current = Some(w);
            return Ok(());
        }
    }

    /// Choose the reverse winner: largest key, youngest source on ties.
    fn settle_backward(&mut self) -> Result<(), CursorError> {
        loop {
            let mut winner: Option<usize> = None;
            for (i, source) in self.sources.iter().enumerate() {
                let Some(k) = source.key() else { continue };
                winner = match winner {
                    None => Some(i),
                    Some(w) if k > self.sources[w].key().unwrap_or(&[]) => Some(i),
                    Some(w) => Some(w),
                };
            }
            let Some(w) = winner else {
                self.current = None;
                return Ok(());
            };
            if self.sources[w].is_tombstone() {
                let key = self.sources[w].key().map(<[u8]>::to_vec).unwrap_or_default();
                self.step_past_backward(&key)?;
                continue;
            }
            self.current = Some(w);
            return Ok(());
        }
    }
}
