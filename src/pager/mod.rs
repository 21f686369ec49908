//! Paged access to the database file.
//!
//! The database is a single file laid out as:
//!
//! ```text
//! [meta page slot 1 — 4096 B][meta page slot 2 — 4096 B][data blocks…]
//! ```
//!
//! Data blocks are `block_size` bytes each and are carved into pages of
//! `page_size` bytes. Pages are addressed by a 1-based page number;
//! block *b* (1-based) covers pages `[(b-1)·ppb + 1, b·ppb]` where
//! `ppb = block_size / page_size`. The pager translates page numbers to
//! file offsets, stamps and verifies per-page trailing CRC32 checksums,
//! and serves the two fixed meta page slots used for checkpoints.
//!
//! # Read path
//!
//! Reads are served from a shared read-only memory map when the
//! environment provides one; the map is refreshed after the file grows.
//! Pages beyond the mapped range fall back to positioned reads.
//!
//! # Integrity
//!
//! `write_page` stamps a CRC32 over the first `page_size - 4` bytes
//! into the final 4 bytes; `read_page` verifies it and reports
//! [`PagerError::Corrupt`] on mismatch. Meta pages are raw — the
//! checkpoint blob they carry has its own two-word checksum.

#[cfg(test)]
mod tests;

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU64, Ordering},
};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::env::{EnvError, EnvFile};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of each of the two meta page slots, independent of `page_size`.
pub const META_PAGE_SIZE: usize = 4096;

/// File offset of the first data block.
pub const DATA_OFFSET: u64 = 2 * META_PAGE_SIZE as u64;

/// Bytes reserved at the end of every data page for the trailing CRC32.
pub const PAGE_CKSUM_SIZE: usize = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by pager operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PagerError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment-level failure.
    #[error("environment error: {0}")]
    Env(#[from] EnvError),

    /// A page failed its trailing checksum or could not be read whole.
    #[error("page {0} is corrupt")]
    Corrupt(u32),

    /// Page or block geometry is invalid.
    #[error("invalid geometry: {0}")]
    Geometry(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Pager
// ------------------------------------------------------------------------------------------------

/// Translates page numbers to file offsets and performs checksummed
/// page I/O against a single database file.
pub struct Pager {
    /// Database file handle.
    file: Arc<dyn EnvFile>,

    /// Configured page size in bytes.
    page_size: usize,

    /// Configured block size in bytes; a multiple of `page_size`.
    block_size: usize,

    /// Read-only map over the file prefix, refreshed after growth.
    map: RwLock<Option<Mmap>>,

    /// Pages read through this pager (diagnostics).
    n_read: AtomicU64,

    /// Pages written through this pager (diagnostics).
    n_write: AtomicU64,
}

impl Pager {
    /// Create a pager over `file` with the given geometry.
    ///
    /// `page_size` must be a power of two of at least 512 bytes and
    /// `block_size` a multiple of `page_size`.
    pub fn new(
        file: Arc<dyn EnvFile>,
        page_size: usize,
        block_size: usize,
    ) -> Result<Self, PagerError> {
        // The upper bound keeps in-page cell offsets within u16.
        if page_size < 512 || page_size > 32768 || !page_size.is_power_of_two() {
            return Err(PagerError::Geometry(format!(
                "page size {page_size} must be a power of two in [512, 32768]"
            )));
        }
        if block_size < page_size || block_size % page_size != 0 {
            return Err(PagerError::Geometry(format!(
                "block size {block_size} must be a multiple of page size {page_size}"
            )));
        }

        let pager = Self {
            file,
            page_size,
            block_size,
            map: RwLock::new(None),
            n_read: AtomicU64::new(0),
            n_write: AtomicU64::new(0),
        };
        pager.refresh_map()?;
        Ok(pager)
    }

    /// Configured page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Configured block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pages per block.
    pub fn pages_per_block(&self) -> u32 {
        (self.block_size / self.page_size) as u32
    }

    /// File offset of page `pgno` (1-based).
    pub fn page_offset(&self, pgno: u32) -> u64 {
        DATA_OFFSET + (pgno as u64 - 1) * self.page_size as u64
    }

    /// Block containing page `pgno`.
    pub fn block_of_page(&self, pgno: u32) -> u32 {
        (pgno - 1) / self.pages_per_block() + 1
    }

    /// First page of block `block` (1-based).
    pub fn first_page_of_block(&self, block: u32) -> u32 {
        (block - 1) * self.pages_per_block() + 1
    }

    /// Last page of block `block` (1-based).
    pub fn last_page_of_block(&self, block: u32) -> u32 {
        block * self.pages_per_block()
    }

    /// Pages read so far (diagnostics).
    pub fn pages_read(&self) -> u64 {
        self.n_read.load(Ordering::Relaxed)
    }

    /// Pages written so far (diagnostics).
    pub fn pages_written(&self) -> u64 {
        self.n_write.load(Ordering::Relaxed)
    }

    // --------------------------------------------------------------------------------------------
    // Page I/O
    // --------------------------------------------------------------------------------------------

    /// Read page `pgno` and verify its trailing checksum.
    pub fn read_page(&self, pgno: u32) -> Result<Vec<u8>, PagerError> {
        if pgno == 0 {
            return Err(PagerError::Internal("page number 0".into()));
        }
        let off = self.page_offset(pgno);
        let mut page = vec![0u8; self.page_size];

        let served_from_map = {
            let guard = self
                .map
                .read()
                .map_err(|_| PagerError::Internal("map lock poisoned".into()))?;
            match guard.as_ref() {
                Some(map) if (off + self.page_size as u64) <= map.len() as u64 => {
                    let start = off as usize;
                    page.copy_from_slice(&map[start..start + self.page_size]);
                    true
                }
                _ => false,
            }
        };

        if !served_from_map {
            let n = self.file.read_at(off, &mut page)?;
            if n != self.page_size {
                return Err(PagerError::Corrupt(pgno));
            }
        }

        let stored = crate::encoding::get_u32_at(&page, self.page_size - PAGE_CKSUM_SIZE)
            .map_err(|_| PagerError::Corrupt(pgno))?;
        let mut hasher = Crc32::new();
        hasher.update(&page[..self.page_size - PAGE_CKSUM_SIZE]);
        if hasher.finalize() != stored {
            return Err(PagerError::Corrupt(pgno));
        }

        self.n_read.fetch_add(1, Ordering::Relaxed);
        trace!(pgno, "page read");
        Ok(page)
    }

    /// Stamp the trailing checksum into `page` and write it as `pgno`.
    ///
    /// `page` must be exactly `page_size` bytes; its last 4 bytes are
    /// overwritten with the checksum.
    pub fn write_page(&self, pgno: u32, page: &mut [u8]) -> Result<(), PagerError> {
        if page.len() != self.page_size {
            return Err(PagerError::Internal(format!(
                "write_page buffer is {} bytes, page size is {}",
                page.len(),
                self.page_size
            )));
        }
        let mut hasher = Crc32::new();
        hasher.update(&page[..self.page_size - PAGE_CKSUM_SIZE]);
        let cksum = hasher.finalize();
        crate::encoding::put_u32_at(page, self.page_size - PAGE_CKSUM_SIZE, cksum)
            .map_err(|e| PagerError::Internal(e.to_string()))?;

        self.file.write_at(self.page_offset(pgno), page)?;
        self.n_write.fetch_add(1, Ordering::Relaxed);
        trace!(pgno, "page written");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Meta pages
    // --------------------------------------------------------------------------------------------

    /// Read meta page `slot` (1 or 2) raw.
    ///
    /// A slot that has never been written reads as zeroes.
    pub fn read_meta(&self, slot: u8) -> Result<Vec<u8>, PagerError> {
        debug_assert!(slot == 1 || slot == 2);
        let off = (slot as u64 - 1) * META_PAGE_SIZE as u64;
        let mut page = vec![0u8; META_PAGE_SIZE];
        let n = self.file.read_at(off, &mut page)?;
        // Short reads are fine here: a fresh file has no meta pages yet
        // and zeroes decode as "no valid checkpoint".
        let _ = n;
        Ok(page)
    }

    /// Write `data` (at most 4096 bytes, zero-padded) to meta slot 1 or 2.
    pub fn write_meta(&self, slot: u8, data: &[u8]) -> Result<(), PagerError> {
        debug_assert!(slot == 1 || slot == 2);
        if data.len() > META_PAGE_SIZE {
            return Err(PagerError::Internal(format!(
                "meta blob of {} bytes exceeds the {META_PAGE_SIZE}-byte slot",
                data.len()
            )));
        }
        let mut page = vec![0u8; META_PAGE_SIZE];
        page[..data.len()].copy_from_slice(data);
        let off = (slot as u64 - 1) * META_PAGE_SIZE as u64;
        self.file.write_at(off, &page)?;
        debug!(slot, len = data.len(), "meta page written");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Growth and durability
    // --------------------------------------------------------------------------------------------

    /// Extend the file so blocks `1..=n_block` exist, then refresh the
    /// read map.
    pub fn extend_to_blocks(&self, n_block: u32) -> Result<(), PagerError> {
        let want = DATA_OFFSET + n_block as u64 * self.block_size as u64;
        if self.file.len()? < want {
            self.file.truncate(want)?;
            debug!(n_block, bytes = want, "database file grown");
        }
        self.refresh_map()
    }

    /// Re-map the file prefix after growth or external writes.
    pub fn refresh_map(&self) -> Result<(), PagerError> {
        let len = self.file.len()?;
        let new_map = self.file.map(len)?;
        let mut guard = self
            .map
            .write()
            .map_err(|_| PagerError::Internal("map lock poisoned".into()))?;
        *guard = new_map;
        Ok(())
    }

    /// Durability barrier on the database file.
    pub fn sync(&self) -> Result<(), PagerError> {
        self.file.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_size", &self.page_size)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}
