//! Segment writer — streams sorted records into a chained page run.
//!
//! The writer consumes records in strict `(namespace, key)` order and
//! lays them into slotted data pages linked through `prev`/`next`. A
//! flush builds a whole segment in one session; a merge builds its
//! output across many sessions, pausing at page granularity and
//! resuming with [`SegmentWriter::resume`]. The separator index is
//! built only when the run is complete — a paused merge output has
//! `root_pg = 0` and is scanned linearly until then.

use tracing::{debug, trace};

use crate::pager::Pager;
use crate::snapshot::SegmentRecord;

use super::{
    PageAlloc, PageBuilder, PageView, Record, SegmentError, encode_record_cell, encode_sep_cell,
    FLAG_SEPARATOR, cmp_ns_key,
};

// ------------------------------------------------------------------------------------------------
// SegmentWriter
// ------------------------------------------------------------------------------------------------

/// Streams sorted records into a new or resumed segment.
pub struct SegmentWriter<'a> {
    pager: &'a Pager,
    alloc: &'a mut dyn PageAlloc,

    /// Page being filled, if any.
    cur: Option<(u32, PageBuilder)>,

    /// First data page of the run (0 until the first page exists).
    first_pg: u32,

    /// Last fully written data page.
    prev_pg: u32,

    /// Pages in the run so far (data + separator).
    n_pages: u32,

    /// Pages physically written in this session (merge budget).
    session_pages: u32,

    /// Existing tail page whose `next` pointer must be patched when
    /// this session writes its first page (resume only).
    patch_next_of: u32,

    /// Ordering enforcement across `push` calls.
    last_rec: Option<(u8, Vec<u8>)>,
}

impl<'a> SegmentWriter<'a> {
    /// Start a brand-new segment.
    pub fn new(pager: &'a Pager, alloc: &'a mut dyn PageAlloc) -> Self {
        Self {
            pager,
            alloc,
            cur: None,
            first_pg: 0,
            prev_pg: 0,
            n_pages: 0,
            session_pages: 0,
            patch_next_of: 0,
            last_rec: None,
        }
    }

    /// Continue a paused merge output.
    ///
    /// `seg` is the partial record from the merge state; new pages are
    /// chained onto its tail. Ordering against the resumed tail is the
    /// merge engine's responsibility.
    pub fn resume(pager: &'a Pager, alloc: &'a mut dyn PageAlloc, seg: SegmentRecord) -> Self {
        Self {
            pager,
            alloc,
            cur: None,
            first_pg: seg.first_pg,
            prev_pg: seg.last_pg,
            n_pages: seg.n_pages,
            session_pages: 0,
            patch_next_of: seg.last_pg,
            last_rec: None,
        }
    }

    /// Pages physically written in this session.
    pub fn session_pages(&self) -> u32 {
        self.session_pages
    }

    /// True when the run has no pages at all — nothing written in this
    /// session or any earlier one.
    pub fn is_empty(&self) -> bool {
        self.first_pg == 0 && self.cur.is_none()
    }

    /// Append one record.
    ///
    /// Returns the `(page, cell)` position the record landed at, which
    /// the merge engine records as its split key.
    pub fn push(&mut self, rec: &Record) -> Result<(u32, u32), SegmentError> {
        if let Some((last_ns, last_key)) = &self.last_rec {
            if cmp_ns_key(rec.kind.ns(), &rec.key, *last_ns, last_key)
                != std::cmp::Ordering::Greater
            {
                return Err(SegmentError::OutOfOrder);
            }
        }

        let cell = encode_record_cell(rec);
        if cell.len() > PageBuilder::max_cell_size(self.pager.page_size()) {
            return Err(SegmentError::RecordTooLarge(cell.len()));
        }

        if self.cur.is_none() {
            self.start_page()?;
        }
        // The page is full: chain a fresh one and retry there.
        if !self
            .cur
            .as_mut()
            .map(|(_, b)| b.try_add_cell(&cell))
            .unwrap_or(false)
        {
            self.start_next_page()?;
            let (_, builder) = self
                .cur
                .as_mut()
                .ok_or_else(|| SegmentError::Internal("no current page after chain".into()))?;
            if !builder.try_add_cell(&cell) {
                return Err(SegmentError::RecordTooLarge(cell.len()));
            }
        }

        self.last_rec = Some((rec.kind.ns(), rec.key.clone()));
        let (pgno, builder) = self
            .cur
            .as_ref()
            .ok_or_else(|| SegmentError::Internal("no current page after push".into()))?;
        Ok((*pgno, builder.n_cells() as u32 - 1))
    }

    /// Complete the session.
    ///
    /// With `build_index` set the separator b-tree is constructed and
    /// the returned record carries its root; otherwise the record has
    /// `root_pg = 0` (a paused merge output).
    pub fn finish(mut self, build_index: bool) -> Result<SegmentRecord, SegmentError> {
        if let Some((pgno, builder)) = self.cur.take() {
            self.write_page(pgno, builder, 0)?;
            self.prev_pg = pgno;
        }
        if self.first_pg == 0 {
            return Err(SegmentError::Internal("empty segment".into()));
        }

        let mut record = SegmentRecord {
            first_pg: self.first_pg,
            last_pg: self.prev_pg,
            root_pg: 0,
            n_pages: self.n_pages,
        };

        if build_index {
            record.root_pg = self.build_index(record.first_pg, record.last_pg)?;
            record.n_pages = self.n_pages;
        }

        debug!(
            first_pg = record.first_pg,
            last_pg = record.last_pg,
            root_pg = record.root_pg,
            n_pages = record.n_pages,
            "segment session finished"
        );
        Ok(record)
    }

    // --------------------------------------------------------------------------------------------
    // Page management
    // --------------------------------------------------------------------------------------------

    /// Begin the first page of this session.
    fn start_page(&mut self) -> Result<(), SegmentError> {
        let pgno = self.alloc.next_page()?;
        if self.first_pg == 0 {
            self.first_pg = pgno;
        }
        if self.patch_next_of != 0 {
            self.patch_next(self.patch_next_of, pgno)?;
            self.patch_next_of = 0;
        }
        let mut builder = PageBuilder::new(self.pager.page_size(), 0);
        builder.set_prev(self.prev_pg);
        self.cur = Some((pgno, builder));
        Ok(())
    }

    /// Flush the full current page chained to a fresh successor.
    fn start_next_page(&mut self) -> Result<(), SegmentError> {
        let next = self.alloc.next_page()?;
        if let Some((pgno, builder)) = self.cur.take() {
            self.write_page(pgno, builder, next)?;
            self.prev_pg = pgno;
        }
        let mut builder = PageBuilder::new(self.pager.page_size(), 0);
        builder.set_prev(self.prev_pg);
        self.cur = Some((next, builder));
        Ok(())
    }

    fn write_page(
        &mut self,
        pgno: u32,
        mut builder: PageBuilder,
        next: u32,
    ) -> Result<(), SegmentError> {
        builder.set_next(next);
        let mut buf = builder.into_buf();
        self.pager.write_page(pgno, &mut buf)?;
        self.n_pages += 1;
        self.session_pages += 1;
        trace!(pgno, next, "segment page written");
        Ok(())
    }

    /// Rewrite an existing page's `next` pointer (resume only).
    fn patch_next(&mut self, pgno: u32, next: u32) -> Result<(), SegmentError> {
        let mut buf = self.pager.read_page(pgno)?;
        crate::encoding::put_u32_at(&mut buf, super::OFF_NEXT, next)
            .map_err(|_| SegmentError::Corrupt(pgno))?;
        self.pager.write_page(pgno, &mut buf)?;
        trace!(pgno, next, "tail page re-linked");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Separator index
    // --------------------------------------------------------------------------------------------

    /// Build the separator b-tree bottom-up over the finished data
    /// chain; returns the root page (0 when one data page suffices).
    fn build_index(&mut self, first_pg: u32, last_pg: u32) -> Result<u32, SegmentError> {
        // Collect (ns, first key, page) for every data page.
        let mut entries: Vec<(u8, Vec<u8>, u32)> = Vec::new();
        let mut pgno = first_pg;
        loop {
            let page = PageView::load(self.pager, pgno)?;
            if let Some(cell) = page.cells.first() {
                entries.push((cell.ns, cell.key.clone(), pgno));
            }
            if pgno == last_pg || page.next == 0 {
                break;
            }
            pgno = page.next;
        }

        if entries.len() <= 1 {
            return Ok(0);
        }

        loop {
            let (level_entries, n_written) = self.write_separator_level(&entries)?;
            self.n_pages += n_written;
            self.session_pages += n_written;
            if level_entries.len() == 1 {
                return Ok(level_entries[0].2);
            }
            entries = level_entries;
        }
    }

    /// Write one separator level; returns the entries describing it.
    fn write_separator_level(
        &mut self,
        entries: &[(u8, Vec<u8>, u32)],
    ) -> Result<(Vec<(u8, Vec<u8>, u32)>, u32), SegmentError> {
        let mut above: Vec<(u8, Vec<u8>, u32)> = Vec::new();
        let mut n_written = 0u32;
        let mut prev_pg = 0u32;
        let mut cur: Option<(u32, PageBuilder)> = None;

        for (ns, key, child) in entries {
            let cell = encode_sep_cell(*ns, key, *child);
            if cell.len() > PageBuilder::max_cell_size(self.pager.page_size()) {
                return Err(SegmentError::RecordTooLarge(cell.len()));
            }

            let fits = match cur.as_mut() {
                Some((_, builder)) => builder.try_add_cell(&cell),
                None => false,
            };
            if !fits {
                // Chain the current separator page to a fresh one.
                let next = self.alloc.next_page()?;
                if let Some((pgno, builder)) = cur.take() {
                    self.write_sep_page(pgno, builder, next)?;
                    n_written += 1;
                    prev_pg = pgno;
                }
                let mut builder = PageBuilder::new(self.pager.page_size(), FLAG_SEPARATOR);
                builder.set_prev(prev_pg);
                if !builder.try_add_cell(&cell) {
                    return Err(SegmentError::RecordTooLarge(cell.len()));
                }
                above.push((*ns, key.clone(), next));
                cur = Some((next, builder));
            }
        }

        if let Some((pgno, builder)) = cur.take() {
            self.write_sep_page(pgno, builder, 0)?;
            n_written += 1;
        }

        Ok((above, n_written))
    }

    fn write_sep_page(
        &mut self,
        pgno: u32,
        mut builder: PageBuilder,
        next: u32,
    ) -> Result<(), SegmentError> {
        builder.set_next(next);
        let mut buf = builder.into_buf();
        self.pager.write_page(pgno, &mut buf)?;
        trace!(pgno, next, "separator page written");
        Ok(())
    }
}
