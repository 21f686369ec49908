use std::sync::Arc;

use tempfile::TempDir;

use crate::env::{Env, PosixEnv};
use crate::pager::Pager;
use crate::segment::{PageAlloc, SegmentError};

/// Hands out pages sequentially, growing the file block by block.
pub struct SeqAlloc {
    pager: Arc<Pager>,
    next: u32,
}

impl SeqAlloc {
    pub fn new(pager: Arc<Pager>) -> Self {
        Self { pager, next: 1 }
    }
}

impl PageAlloc for SeqAlloc {
    fn next_page(&mut self) -> Result<u32, SegmentError> {
        let pg = self.next;
        self.next += 1;
        let block = self.pager.block_of_page(pg);
        self.pager.extend_to_blocks(block)?;
        Ok(pg)
    }
}

/// A pager over a scratch file with small pages so multi-page and
/// multi-level-index segments are cheap to produce.
pub fn small_pager(tmp: &TempDir) -> Arc<Pager> {
    let file = PosixEnv.open_file(&tmp.path().join("db"), true).unwrap();
    Arc::new(Pager::new(file, 512, 4 * 512).unwrap())
}
