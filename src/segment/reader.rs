//! Segment cursor — bidirectional, seekable reads over one run.
//!
//! The cursor descends the separator b-tree to land on a data page
//! (falling back to a linear chain walk when the run has no index yet,
//! as with a paused merge output), then moves cell-by-cell, crossing
//! pages through the `prev`/`next` chain. It surfaces raw records —
//! system records included; callers that speak only the user namespace
//! filter on [`RecordKind`].

use std::cmp::Ordering;
use std::sync::Arc;

use crate::pager::Pager;
use crate::snapshot::SegmentRecord;

use super::{PageView, Record, RecordKind, SegmentError, cmp_ns_key};

/// Seek bias, mirroring the public cursor contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekBias {
    /// Exact match only.
    Eq,
    /// Smallest record `>=` the target.
    Ge,
    /// Largest record `<=` the target.
    Le,
}

/// A cursor over one segment.
pub struct SegmentCursor {
    pager: Arc<Pager>,
    seg: SegmentRecord,
    page: Option<PageView>,
    cell: usize,
    valid: bool,
}

impl SegmentCursor {
    /// Open a cursor; initially invalid.
    pub fn new(pager: Arc<Pager>, seg: SegmentRecord) -> Self {
        Self {
            pager,
            seg,
            page: None,
            cell: 0,
            valid: false,
        }
    }

    /// True when positioned on a record.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Drop the current position.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Namespace of the current record.
    pub fn ns(&self) -> Option<u8> {
        self.current().map(|c| c.ns)
    }

    /// Kind of the current record.
    pub fn kind(&self) -> Option<RecordKind> {
        self.current().and_then(|c| c.record_kind())
    }

    /// Key of the current record.
    pub fn key(&self) -> Option<&[u8]> {
        self.current().map(|c| c.key.as_slice())
    }

    /// Value of the current record (empty for tombstones).
    pub fn value(&self) -> Option<&[u8]> {
        self.current().map(|c| c.value.as_slice())
    }

    /// Owned copy of the current record.
    pub fn record(&self) -> Option<Record> {
        let cell = self.current()?;
        let kind = cell.record_kind()?;
        Some(Record {
            kind,
            key: cell.key.clone(),
            value: cell.value.clone(),
        })
    }

    /// Current `(page, cell)` position, for merge state persistence.
    pub fn position(&self) -> Option<(u32, u32)> {
        if !self.valid {
            return None;
        }
        self.page.as_ref().map(|p| (p.pgno, self.cell as u32))
    }

    fn current(&self) -> Option<&super::Cell> {
        if !self.valid {
            return None;
        }
        self.page.as_ref().and_then(|p| p.cells.get(self.cell))
    }

    // --------------------------------------------------------------------------------------------
    // Positioning
    // --------------------------------------------------------------------------------------------

    /// Position on the first record.
    pub fn first(&mut self) -> Result<(), SegmentError> {
        if self.seg.is_empty() {
            self.valid = false;
            return Ok(());
        }
        self.load(self.seg.first_pg)?;
        self.cell = 0;
        self.valid = self.page.as_ref().is_some_and(|p| !p.cells.is_empty());
        Ok(())
    }

    /// Position on the last record.
    pub fn last(&mut self) -> Result<(), SegmentError> {
        if self.seg.is_empty() {
            self.valid = false;
            return Ok(());
        }
        self.load(self.seg.last_pg)?;
        match self.page.as_ref().map(|p| p.cells.len()) {
            Some(n) if n > 0 => {
                self.cell = n - 1;
                self.valid = true;
            }
            _ => self.valid = false,
        }
        Ok(())
    }

    /// Advance to the next record; invalid past the end.
    pub fn next(&mut self) -> Result<(), SegmentError> {
        if !self.valid {
            return Ok(());
        }
        let Some(page) = self.page.as_ref() else {
            self.valid = false;
            return Ok(());
        };
        if self.cell + 1 < page.cells.len() {
            self.cell += 1;
            return Ok(());
        }
        if page.pgno == self.seg.last_pg || page.next == 0 {
            self.valid = false;
            return Ok(());
        }
        let next = page.next;
        self.load(next)?;
        self.cell = 0;
        self.valid = self.page.as_ref().is_some_and(|p| !p.cells.is_empty());
        Ok(())
    }

    /// Retreat to the previous record; invalid before the start.
    pub fn prev(&mut self) -> Result<(), SegmentError> {
        if !self.valid {
            return Ok(());
        }
        if self.cell > 0 {
            self.cell -= 1;
            return Ok(());
        }
        let prev = match self.page.as_ref() {
            Some(p) if p.pgno != self.seg.first_pg && p.prev != 0 => p.prev,
            _ => {
                self.valid = false;
                return Ok(());
            }
        };
        self.load(prev)?;
        match self.page.as_ref().map(|p| p.cells.len()) {
            Some(n) if n > 0 => {
                self.cell = n - 1;
                self.valid = true;
            }
            _ => self.valid = false,
        }
        Ok(())
    }

    /// Position at an exact `(page, cell)` recorded by a merge.
    pub fn position_at(&mut self, pgno: u32, cell: u32) -> Result<(), SegmentError> {
        if pgno == 0 {
            self.valid = false;
            return Ok(());
        }
        self.load(pgno)?;
        let n = self.page.as_ref().map(|p| p.cells.len()).unwrap_or(0);
        if (cell as usize) < n {
            self.cell = cell as usize;
            self.valid = true;
            Ok(())
        } else {
            Err(SegmentError::Corrupt(pgno))
        }
    }

    /// Position per `bias` relative to `(ns, key)`.
    pub fn seek(&mut self, ns: u8, key: &[u8], bias: SeekBias) -> Result<(), SegmentError> {
        if self.seg.is_empty() {
            self.valid = false;
            return Ok(());
        }
        let pgno = self.find_data_page(ns, key)?;
        self.load(pgno)?;

        let idx = self
            .page
            .as_ref()
            .map(|p| p.lower_bound(ns, key))
            .unwrap_or(0);
        let n = self.page.as_ref().map(|p| p.cells.len()).unwrap_or(0);

        match bias {
            SeekBias::Ge | SeekBias::Eq => {
                if idx < n {
                    self.cell = idx;
                    self.valid = true;
                } else {
                    // Past the page: the first cell of the next page is
                    // the answer, if any.
                    self.cell = n.saturating_sub(1);
                    self.valid = n > 0;
                    self.next()?;
                }
                if bias == SeekBias::Eq {
                    let exact = self
                        .current()
                        .map(|c| cmp_ns_key(c.ns, &c.key, ns, key) == Ordering::Equal)
                        .unwrap_or(false);
                    if !exact {
                        self.valid = false;
                    }
                }
            }
            SeekBias::Le => {
                if idx < n
                    && self
                        .page
                        .as_ref()
                        .map(|p| cmp_ns_key(p.cells[idx].ns, &p.cells[idx].key, ns, key))
                        == Some(Ordering::Equal)
                {
                    self.cell = idx;
                    self.valid = true;
                } else if idx > 0 {
                    self.cell = idx - 1;
                    self.valid = true;
                } else {
                    // Everything on this page is greater; step back.
                    self.cell = 0;
                    self.valid = n > 0;
                    self.prev()?;
                }
            }
        }
        Ok(())
    }

    /// Exact lookup in the system namespace.
    pub fn seek_sys(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, SegmentError> {
        self.seek(1, key, SeekBias::Eq)?;
        if self.valid && self.kind() == Some(RecordKind::Sys) {
            Ok(self.value().map(<[u8]>::to_vec))
        } else {
            Ok(None)
        }
    }

    // --------------------------------------------------------------------------------------------
    // Page location
    // --------------------------------------------------------------------------------------------

    fn load(&mut self, pgno: u32) -> Result<(), SegmentError> {
        if self.page.as_ref().map(|p| p.pgno) != Some(pgno) {
            self.page = Some(PageView::load(&self.pager, pgno)?);
        }
        Ok(())
    }

    /// Find the data page whose range covers `(ns, key)`.
    fn find_data_page(&self, ns: u8, key: &[u8]) -> Result<u32, SegmentError> {
        if self.seg.root_pg != 0 {
            return self.descend(ns, key);
        }

        // No index (single page, or a merge output still being built):
        // walk the chain until a page's last cell reaches the target.
        let mut pgno = self.seg.first_pg;
        loop {
            let page = PageView::load(&self.pager, pgno)?;
            let covers = page
                .cells
                .last()
                .map(|c| cmp_ns_key(c.ns, &c.key, ns, key) != Ordering::Less)
                .unwrap_or(false);
            if covers || page.next == 0 || pgno == self.seg.last_pg {
                return Ok(pgno);
            }
            pgno = page.next;
        }
    }

    /// Descend the separator tree from the root.
    fn descend(&self, ns: u8, key: &[u8]) -> Result<u32, SegmentError> {
        let mut pgno = self.seg.root_pg;
        loop {
            let page = PageView::load(&self.pager, pgno)?;
            if !page.is_separator() {
                return Ok(pgno);
            }
            if page.cells.is_empty() {
                return Err(SegmentError::Corrupt(pgno));
            }
            // Rightmost child whose first key <= target; the leftmost
            // child catches targets before the whole run.
            let ub = page
                .cells
                .partition_point(|c| cmp_ns_key(c.ns, &c.key, ns, key) != Ordering::Greater);
            let idx = ub.saturating_sub(1);
            pgno = page.cells[idx].child;
            if pgno == 0 {
                return Err(SegmentError::Corrupt(page.pgno));
            }
        }
    }
}
