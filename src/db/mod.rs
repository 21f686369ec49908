//! The database handle — transactions, reads, writes, and work.
//!
//! [`Db`] ties the subsystems together:
//!
//! - the **writer path** (write/delete under nested transactions) owns
//!   the in-memory tree and the log behind the writer lock;
//! - the **worker path** (`work`: flush / merge / checkpoint) owns the
//!   worker snapshot behind the worker lock;
//! - **readers** never block either: a cursor pins an immutable
//!   published snapshot plus a frozen tree view.
//!
//! # Transactions
//!
//! Nesting level 0 is auto-commit. `begin(n)` opens levels up to `n`,
//! pushing a `(log offset, tree mark)` frame per level. `commit(n)`
//! folds levels down to `n`; closing the outermost level appends a
//! COMMIT record and syncs per the safety level. `rollback(n)`
//! restores the tree from the mark and truncates the log to the saved
//! offset.
//!
//! # Recovery
//!
//! `open` reads both meta pages, loads the newest valid checkpoint
//! (pulling overflowed levels and the free list out of the LEVELS and
//! FREELIST system records when flagged), then replays the log forward
//! from the checkpoint's pointer, applying only record runs closed by
//! a COMMIT. The uncommitted tail, if any, is discarded.
//!
//! # Lock order
//!
//! Worker lock before writer lock, never the reverse. Reads take
//! neither for longer than a tree freeze.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam::sync::ShardedLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checkpoint::{self, CheckpointError, FreeDecoded};
use crate::cursor::{Cursor, CursorError, SeekMode};
use crate::env::{Env, EnvError, PosixEnv};
use crate::log::{Log, LogError, LogPtr, LogReader, LogRecord};
use crate::pager::{META_PAGE_SIZE, Pager, PagerError};
use crate::segment::{PageBuilder, SegmentCursor, SegmentError};
use crate::snapshot::{FreeBlock, Snapshot};
use crate::tree::{Tree, TreeError, TreeMark};
use crate::worker::{Worker, WorkerError};

// ------------------------------------------------------------------------------------------------
// Public enums and flags
// ------------------------------------------------------------------------------------------------

/// Crash robustness level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyLevel {
    /// No syncs at all; a crash may corrupt the database.
    Off,
    /// The data file is synced before a checkpoint is installed; the
    /// file survives a crash but recent commits may be lost.
    Normal,
    /// Additionally sync the log on every outermost commit; no
    /// committed transaction is lost.
    Full,
}

/// Work request flags, combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkFlags(u32);

impl WorkFlags {
    /// Flush the in-memory tree to a level-0 segment.
    pub const FLUSH: WorkFlags = WorkFlags(0x1);
    /// Install a checkpoint.
    pub const CHECKPOINT: WorkFlags = WorkFlags(0x2);
    /// Advance a merge by the page budget.
    pub const MERGE: WorkFlags = WorkFlags(0x4);
    /// With MERGE: ignore the size ratio and compact to one level.
    pub const OPTIMIZE: WorkFlags = WorkFlags(0x8);

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: WorkFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for WorkFlags {
    type Output = WorkFlags;

    fn bitor(self, rhs: WorkFlags) -> WorkFlags {
        WorkFlags(self.0 | rhs.0)
    }
}

/// Public error taxonomy, by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Error,
    Busy,
    Nomem,
    Ioerr,
    Corrupt,
    Full,
    Cantopen,
    Misuse,
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by database operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Environment failure.
    #[error("environment error: {0}")]
    Env(#[from] EnvError),

    /// Pager failure.
    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    /// Log failure.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Tree failure.
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    /// Segment failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Checkpoint codec failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Worker failure.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Cursor failure.
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),

    /// A required lock is held by another operation.
    #[error("busy")]
    Busy,

    /// API misuse: bad nesting, bad argument, closed handle.
    #[error("misuse: {0}")]
    Misuse(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Collapse to the public error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            DbError::Env(EnvError::CantOpen { .. }) => ErrorCode::Cantopen,
            DbError::Env(_) => ErrorCode::Ioerr,
            DbError::Pager(e) => pager_code(e),
            DbError::Log(LogError::Io(_)) => ErrorCode::Ioerr,
            DbError::Log(LogError::Encoding(_)) => ErrorCode::Corrupt,
            DbError::Log(_) => ErrorCode::Error,
            DbError::Tree(_) => ErrorCode::Error,
            DbError::Segment(e) => segment_code(e),
            DbError::Checkpoint(CheckpointError::Malformed) => ErrorCode::Corrupt,
            DbError::Checkpoint(_) => ErrorCode::Error,
            DbError::Worker(WorkerError::Segment(e)) => segment_code(e),
            DbError::Worker(WorkerError::Pager(e)) => pager_code(e),
            DbError::Worker(WorkerError::Checkpoint(CheckpointError::Malformed)) => {
                ErrorCode::Corrupt
            }
            DbError::Worker(_) => ErrorCode::Error,
            DbError::Cursor(CursorError::Segment(e)) => segment_code(e),
            DbError::Busy => ErrorCode::Busy,
            DbError::Misuse(_) => ErrorCode::Misuse,
            DbError::Internal(_) => ErrorCode::Error,
        }
    }
}

fn pager_code(e: &PagerError) -> ErrorCode {
    match e {
        PagerError::Io(_) | PagerError::Env(_) => ErrorCode::Ioerr,
        PagerError::Corrupt(_) => ErrorCode::Corrupt,
        PagerError::Geometry(_) => ErrorCode::Misuse,
        PagerError::Internal(_) => ErrorCode::Error,
    }
}

fn segment_code(e: &SegmentError) -> ErrorCode {
    match e {
        SegmentError::Pager(p) => pager_code(p),
        SegmentError::Corrupt(_) => ErrorCode::Corrupt,
        SegmentError::RecordTooLarge(_) => ErrorCode::Misuse,
        SegmentError::Full => ErrorCode::Full,
        SegmentError::OutOfOrder | SegmentError::Internal(_) => ErrorCode::Error,
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Static configuration passed to [`Db::open_with`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Bytes of in-memory tree before a flush is invited.
    pub write_buffer: usize,

    /// Page size in bytes; power of two, at least 512. Fixed at
    /// database creation.
    pub page_size: usize,

    /// Block size in bytes; a multiple of the page size. Fixed at
    /// database creation.
    pub block_size: usize,

    /// Approximate maximum size ratio between adjacent levels; >= 2.
    pub segment_ratio: u32,

    /// Crash robustness level.
    pub safety: SafetyLevel,

    /// Run flush/merge/checkpoint automatically after commits.
    pub autowork: bool,

    /// Soft log size target that triggers log space reuse.
    pub log_size: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            write_buffer: 1024 * 1024,
            page_size: 4096,
            block_size: 1024 * 1024,
            segment_ratio: 4,
            safety: SafetyLevel::Normal,
            autowork: true,
            log_size: 1024 * 1024,
        }
    }
}

/// Runtime-adjustable configuration, for [`Db::config`].
#[derive(Debug, Clone, Copy)]
pub enum ConfigParam {
    /// New write buffer size in bytes.
    WriteBuffer(usize),
    /// New segment ratio; >= 2.
    SegmentRatio(u32),
    /// New safety level.
    Safety(SafetyLevel),
    /// Toggle autowork.
    Autowork(bool),
    /// New soft log size target.
    LogSize(u64),
    /// Page size — fixed at database creation; rejected at runtime.
    PageSize(usize),
    /// Block size — fixed at database creation; rejected at runtime.
    BlockSize(usize),
}

/// Operational counters returned by [`Db::info`].
#[derive(Debug, Clone)]
pub struct DbInfo {
    /// Pages read from the database file since open.
    pub pages_read: u64,

    /// Pages written to the database file since open.
    pub pages_written: u64,

    /// Id of the current worker snapshot's checkpoint lineage.
    pub ckpt_id: u64,

    /// Levels in the current snapshot.
    pub n_levels: usize,

    /// Approximate bytes buffered in the in-memory tree.
    pub tree_bytes: usize,

    /// Blocks on the free list.
    pub n_free_blocks: usize,
}

// ------------------------------------------------------------------------------------------------
// Db
// ------------------------------------------------------------------------------------------------

/// One open transaction level.
struct TxnFrame {
    log_ptr: LogPtr,
    mark: TreeMark,
}

/// State behind the writer lock.
struct WriterState {
    tree: Tree,
    log: Log,
    txns: Vec<TxnFrame>,
}

/// Mutable runtime configuration.
struct RuntimeConfig {
    write_buffer: usize,
    segment_ratio: u32,
    safety: SafetyLevel,
    autowork: bool,
}

struct DbInner {
    pager: Arc<Pager>,
    path: PathBuf,

    writer: Mutex<WriterState>,
    worker: Mutex<Worker>,

    /// Snapshot visible to new readers; swapped whole by the worker.
    published: ShardedLock<Arc<Snapshot>>,

    /// Snapshots pinned by live cursors, for the reuse horizon.
    readers: Mutex<Vec<Weak<Snapshot>>>,

    config: Mutex<RuntimeConfig>,

    /// Invoked after any work pass that wrote to the database file.
    work_hook: Mutex<Option<Box<dyn Fn() + Send>>>,

    closed: AtomicBool,
}

/// An open database handle.
///
/// Cheap to clone; all clones share one connection. Multiple threads
/// may read in parallel; writes and work serialize on their locks.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Clone for Db {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Db {
    // --------------------------------------------------------------------------------------------
    // Open / close
    // --------------------------------------------------------------------------------------------

    /// Open or create a database with the default environment and
    /// configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Db, DbError> {
        Self::open_with(Arc::new(PosixEnv), path, DbConfig::default())
    }

    /// Open or create a database.
    ///
    /// An existing file's page and block sizes come from its newest
    /// checkpoint and override the configured ones. The log is
    /// replayed; uncommitted trailing records are discarded.
    pub fn open_with(
        env: Arc<dyn Env>,
        path: impl AsRef<Path>,
        config: DbConfig,
    ) -> Result<Db, DbError> {
        validate_config(&config)?;
        let path = path.as_ref().to_path_buf();
        let file = env.open_file(&path, true)?;

        // Pick the newest valid checkpoint of the two meta slots.
        let mut slot_data = [vec![0u8; META_PAGE_SIZE], vec![0u8; META_PAGE_SIZE]];
        for (i, buf) in slot_data.iter_mut().enumerate() {
            let _ = file.read_at(i as u64 * META_PAGE_SIZE as u64, buf).map_err(EnvError::Io)?;
        }
        let mut best: Option<(checkpoint::DecodedCkpt, u8)> = None;
        for (i, buf) in slot_data.iter().enumerate() {
            if let Some(decoded) = checkpoint::decode(buf)? {
                let slot = i as u8 + 1;
                best = match best {
                    Some((prev, prev_slot)) if prev.ckpt_id >= decoded.ckpt_id => {
                        Some((prev, prev_slot))
                    }
                    _ => Some((decoded, slot)),
                };
            }
        }

        let (page_size, block_size) = match &best {
            Some((ckpt, _)) => (ckpt.page_size as usize, ckpt.block_size as usize),
            None => (config.page_size, config.block_size),
        };
        let pager = Arc::new(Pager::new(Arc::clone(&file), page_size, block_size)?);

        let (snap, last_slot) = match best {
            None => (Snapshot::initial(page_size as u32, block_size as u32), 0u8),
            Some((ckpt, slot)) => (load_snapshot(&pager, ckpt)?, slot),
        };

        // Replay the log from the checkpoint's pointer.
        let log_path = log_path_of(&path);
        let log_file = env.open_file(&log_path, true)?;
        let mut reader = LogReader::new(Arc::clone(&log_file), snap.log_ptr);
        let mut tree = Tree::new();
        let mut pending: Vec<LogRecord> = Vec::new();
        let mut committed_ptr = snap.log_ptr;
        let mut n_replayed = 0usize;
        while let Some((record, after)) = reader.next_record()? {
            match record {
                LogRecord::Write { .. } | LogRecord::Delete { .. } => pending.push(record),
                LogRecord::Commit => {
                    for rec in pending.drain(..) {
                        match rec {
                            LogRecord::Write { key, value } => tree.insert(key, value),
                            LogRecord::Delete { key } => tree.delete(key),
                            _ => {}
                        }
                        n_replayed += 1;
                    }
                    committed_ptr = after;
                }
                LogRecord::Jump { .. } => {}
            }
        }
        let end = reader.tell();
        let low_water = reader.low_water();
        let mut log = Log::open(log_file, end, low_water, config.log_size);
        if end != committed_ptr {
            // Trailing records with no COMMIT: discard.
            log.truncate_to(committed_ptr)?;
        }

        info!(
            path = %path.display(),
            ckpt_id = snap.ckpt_id,
            levels = snap.levels.len(),
            replayed = n_replayed,
            "database opened"
        );

        let worker = Worker::new(Arc::clone(&pager), snap.clone(), last_slot);
        let inner = DbInner {
            pager,
            path,
            writer: Mutex::new(WriterState {
                tree,
                log,
                txns: Vec::new(),
            }),
            worker: Mutex::new(worker),
            published: ShardedLock::new(Arc::new(snap)),
            readers: Mutex::new(Vec::new()),
            config: Mutex::new(RuntimeConfig {
                write_buffer: config.write_buffer,
                segment_ratio: config.segment_ratio,
                safety: config.safety,
                autowork: config.autowork,
            }),
            work_hook: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        Ok(Db {
            inner: Arc::new(inner),
        })
    }

    /// Flush, checkpoint, and mark the handle closed.
    ///
    /// An open transaction is rolled back first. Dropping a `Db`
    /// without closing is safe — it is equivalent to a crash, and the
    /// log replays on the next open.
    pub fn close(&self) -> Result<(), DbError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.rollback(0)?;
        self.work(WorkFlags::FLUSH | WorkFlags::CHECKPOINT, 0)?;
        self.inner.closed.store(true, Ordering::SeqCst);
        info!(path = %self.inner.path.display(), "database closed");
        Ok(())
    }

    fn check_open(&self) -> Result<(), DbError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::Misuse("database handle is closed".into()));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Insert or replace `key` with `value`.
    ///
    /// Outside a transaction the write commits by itself (level 0 is
    /// auto-commit).
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        self.validate_record(key, value)?;
        self.apply_write(
            LogRecord::Write {
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )
    }

    /// Write a delete tombstone for `key`. Deleting an absent key is
    /// not an error.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        self.validate_record(key, &[])?;
        self.apply_write(LogRecord::Delete { key: key.to_vec() })
    }

    fn validate_record(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        if key.is_empty() {
            return Err(DbError::Misuse("empty key".into()));
        }
        // A record must fit one segment page cell.
        let max = PageBuilder::max_cell_size(self.inner.pager.page_size());
        let need = 1 + 10 + 10 + key.len() + value.len();
        if need > max {
            return Err(DbError::Misuse(format!(
                "record of {} bytes exceeds the page capacity of {max}",
                key.len() + value.len()
            )));
        }
        Ok(())
    }

    fn apply_write(&self, record: LogRecord) -> Result<(), DbError> {
        let mut autowork = false;
        {
            let mut writer = self.lock_writer()?;
            let auto_commit = writer.txns.is_empty();

            writer.log.append(&record)?;
            match record {
                LogRecord::Write { key, value } => writer.tree.insert(key, value),
                LogRecord::Delete { key } => writer.tree.delete(key),
                _ => return Err(DbError::Internal("non-data record in write path".into())),
            }

            if auto_commit {
                self.finish_commit(&mut writer)?;
                autowork = self.autowork_due(&writer);
            }
        }
        if autowork {
            self.autowork();
        }
        Ok(())
    }

    /// Append COMMIT, sync per the safety level, and let the log reuse
    /// space. Called with the outermost transaction closing.
    fn finish_commit(&self, writer: &mut WriterState) -> Result<(), DbError> {
        writer.log.append(&LogRecord::Commit)?;
        if self.safety() == SafetyLevel::Full {
            writer.log.sync()?;
        }
        writer.log.maybe_reuse()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Point lookup. `Ok(None)` when the key is absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let mut cursor = self.cursor()?;
        cursor.seek(key, SeekMode::Eq)?;
        Ok(cursor.value().map(<[u8]>::to_vec))
    }

    /// Open a snapshot-pinned cursor.
    ///
    /// The cursor sees every write that returned before this call
    /// (including the caller's own uncommitted transaction) and
    /// nothing that happens after.
    pub fn cursor(&self) -> Result<Cursor, DbError> {
        self.check_open()?;
        let view = {
            let mut writer = self.lock_writer()?;
            writer.tree.freeze()
        };
        let snap = {
            let published = self
                .inner
                .published
                .read()
                .map_err(|_| DbError::Internal("published lock poisoned".into()))?;
            Arc::clone(&published)
        };
        {
            let mut readers = self.lock_readers()?;
            readers.retain(|w| w.strong_count() > 0);
            readers.push(Arc::downgrade(&snap));
        }
        Ok(Cursor::new(Arc::clone(&self.inner.pager), snap, view))
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    /// Ensure at least `level` nested transactions are open.
    pub fn begin(&self, level: usize) -> Result<(), DbError> {
        self.check_open()?;
        let mut writer = self.lock_writer()?;
        while writer.txns.len() < level {
            let log_ptr = writer.log.tell();
            let mark = writer.tree.mark();
            writer.txns.push(TxnFrame { log_ptr, mark });
        }
        debug!(depth = writer.txns.len(), "transaction open");
        Ok(())
    }

    /// Commit nested transactions until at most `level` remain.
    ///
    /// `commit(0)` closes the outermost transaction, appending a
    /// COMMIT record and syncing per the safety level. A `level` at or
    /// above the current depth is a no-op.
    pub fn commit(&self, level: usize) -> Result<(), DbError> {
        self.check_open()?;
        let mut autowork = false;
        {
            let mut writer = self.lock_writer()?;
            let had_any = writer.txns.len() > level;
            while writer.txns.len() > level {
                let frame = match writer.txns.pop() {
                    Some(f) => f,
                    None => break,
                };
                writer.tree.release_to(frame.mark)?;
            }
            if had_any && writer.txns.is_empty() {
                self.finish_commit(&mut writer)?;
                autowork = self.autowork_due(&writer);
            }
        }
        if autowork {
            self.autowork();
        }
        Ok(())
    }

    /// Roll back to the state at which transaction `level` was opened.
    ///
    /// `rollback(0)` undoes and closes the outermost transaction;
    /// `rollback(n)` for `n >= 1` restores the state at `begin` of
    /// level `n` and leaves exactly `n` levels open. A `level` above
    /// the current depth is a no-op.
    pub fn rollback(&self, level: usize) -> Result<(), DbError> {
        self.check_open()?;
        let mut writer = self.lock_writer()?;
        if writer.txns.is_empty() || level > writer.txns.len() {
            return Ok(());
        }

        let restore_idx = level.saturating_sub(1);
        let log_ptr = writer.txns[restore_idx].log_ptr;
        let mark = writer.txns[restore_idx].mark;

        writer.log.truncate_to(log_ptr)?;
        writer.tree.rollback_to(mark)?;
        writer.txns.truncate(restore_idx);

        if level >= 1 {
            // The rolled-back level stays open on a fresh mark.
            let mark = writer.tree.mark();
            writer.txns.push(TxnFrame { log_ptr, mark });
        }
        debug!(depth = writer.txns.len(), "transaction rolled back");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Work
    // --------------------------------------------------------------------------------------------

    /// Perform flush / merge / checkpoint work on the caller's thread.
    ///
    /// Returns the number of pages written. `BUSY` when another thread
    /// holds the worker lock, or when FLUSH is requested while a
    /// transaction is open.
    pub fn work(&self, flags: WorkFlags, n_page: u32) -> Result<u32, DbError> {
        self.check_open()?;
        let mut worker = match self.inner.worker.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => return Err(DbError::Busy),
            Err(_) => return Err(DbError::Internal("worker lock poisoned".into())),
        };

        let mut written = 0u32;

        if flags.contains(WorkFlags::FLUSH) {
            written += self.do_flush(&mut worker)?;
        }

        if flags.contains(WorkFlags::MERGE) {
            let ratio = self.segment_ratio();
            let optimize = flags.contains(WorkFlags::OPTIMIZE);
            let budget = if n_page == 0 { 32 } else { n_page };
            let mut merged = 0u32;
            while merged < budget {
                let horizon = self.reader_horizon()?;
                let n = worker.merge(budget - merged, ratio, optimize, horizon)?;
                merged += n;
                self.publish(&worker)?;
                if n == 0 || !optimize {
                    break;
                }
            }
            written += merged;
        }

        if flags.contains(WorkFlags::CHECKPOINT) {
            written += self.do_checkpoint(&mut worker)?;
        }

        self.publish(&worker)?;
        drop(worker);

        if written > 0 {
            if let Ok(hook) = self.inner.work_hook.lock() {
                if let Some(hook) = hook.as_ref() {
                    hook();
                }
            }
        }
        Ok(written)
    }

    /// Flush the tree under the writer lock; requires no open
    /// transaction.
    fn do_flush(&self, worker: &mut Worker) -> Result<u32, DbError> {
        let mut writer = self.lock_writer()?;
        if !writer.txns.is_empty() {
            return Err(DbError::Busy);
        }
        let view = writer.tree.freeze();
        let log_ptr = writer.log.tell();
        let horizon = self.reader_horizon()?;

        let pages = worker.flush(&view, log_ptr, horizon)?;
        if pages > 0 {
            // Publish before clearing so every record stays visible in
            // either the tree or the published snapshot.
            self.publish(worker)?;
            if !view.is_empty() {
                writer.tree.clear();
            }
        }
        Ok(pages)
    }

    /// Install a checkpoint, flushing first when the worker needs
    /// fresh overflow records.
    fn do_checkpoint(&self, worker: &mut Worker) -> Result<u32, DbError> {
        let sync = self.safety() != SafetyLevel::Off;
        let mut written = 0u32;
        loop {
            match worker.checkpoint(sync) {
                Ok(None) => return Ok(written),
                Ok(Some(outcome)) => {
                    let mut writer = self.lock_writer()?;
                    writer.log.checkpointed(outcome.log_ptr);
                    writer.log.maybe_reuse()?;
                    return Ok(written);
                }
                Err(WorkerError::NeedsFlush) => {
                    written += self.do_flush(worker)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Best-effort background pass after a commit filled the write
    /// buffer.
    fn autowork(&self) {
        let flags = WorkFlags::FLUSH | WorkFlags::MERGE | WorkFlags::CHECKPOINT;
        match self.work(flags, 64) {
            Ok(_) => {}
            Err(DbError::Busy) => {}
            Err(e) => warn!(error = %e, "autowork failed"),
        }
    }

    fn autowork_due(&self, writer: &WriterState) -> bool {
        let cfg = match self.inner.config.lock() {
            Ok(cfg) => cfg,
            Err(_) => return false,
        };
        cfg.autowork && writer.tree.mem_used() > cfg.write_buffer
    }

    // --------------------------------------------------------------------------------------------
    // Configuration and info
    // --------------------------------------------------------------------------------------------

    /// Adjust a runtime parameter.
    pub fn config(&self, param: ConfigParam) -> Result<(), DbError> {
        self.check_open()?;
        let mut cfg = self
            .inner
            .config
            .lock()
            .map_err(|_| DbError::Internal("config lock poisoned".into()))?;
        match param {
            ConfigParam::WriteBuffer(bytes) => {
                if bytes == 0 {
                    return Err(DbError::Misuse("write buffer must be non-zero".into()));
                }
                cfg.write_buffer = bytes;
            }
            ConfigParam::SegmentRatio(ratio) => {
                if ratio < 2 {
                    return Err(DbError::Misuse("segment ratio must be >= 2".into()));
                }
                cfg.segment_ratio = ratio;
            }
            ConfigParam::Safety(level) => cfg.safety = level,
            ConfigParam::Autowork(on) => cfg.autowork = on,
            ConfigParam::LogSize(bytes) => {
                drop(cfg);
                let mut writer = self.lock_writer()?;
                writer.log.set_log_size(bytes);
            }
            ConfigParam::PageSize(_) | ConfigParam::BlockSize(_) => {
                return Err(DbError::Misuse(
                    "page and block sizes are fixed at creation; set them in DbConfig".into(),
                ));
            }
        }
        Ok(())
    }

    /// Operational counters.
    pub fn info(&self) -> Result<DbInfo, DbError> {
        let snap = {
            let published = self
                .inner
                .published
                .read()
                .map_err(|_| DbError::Internal("published lock poisoned".into()))?;
            Arc::clone(&published)
        };
        let tree_bytes = self.lock_writer()?.tree.mem_used();
        Ok(DbInfo {
            pages_read: self.inner.pager.pages_read(),
            pages_written: self.inner.pager.pages_written(),
            ckpt_id: snap.ckpt_id,
            n_levels: snap.levels.len(),
            tree_bytes,
            n_free_blocks: snap.free.len(),
        })
    }

    /// Register a callback invoked after any work pass that wrote to
    /// the database file.
    pub fn set_work_hook(&self, hook: impl Fn() + Send + 'static) {
        if let Ok(mut slot) = self.inner.work_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, WriterState>, DbError> {
        self.inner
            .writer
            .lock()
            .map_err(|_| DbError::Internal("writer lock poisoned".into()))
    }

    fn lock_readers(&self) -> Result<std::sync::MutexGuard<'_, Vec<Weak<Snapshot>>>, DbError> {
        self.inner
            .readers
            .lock()
            .map_err(|_| DbError::Internal("reader registry poisoned".into()))
    }

    /// Smallest checkpoint id pinned by a live reader, or `u64::MAX`.
    fn reader_horizon(&self) -> Result<u64, DbError> {
        let mut readers = self.lock_readers()?;
        readers.retain(|w| w.strong_count() > 0);
        Ok(readers
            .iter()
            .filter_map(Weak::upgrade)
            .map(|snap| snap.ckpt_id)
            .min()
            .unwrap_or(u64::MAX))
    }

    /// Swap the published snapshot for the worker's current state.
    fn publish(&self, worker: &Worker) -> Result<(), DbError> {
        let mut published = self
            .inner
            .published
            .write()
            .map_err(|_| DbError::Internal("published lock poisoned".into()))?;
        *published = Arc::new(worker.publish_clone());
        Ok(())
    }

    fn safety(&self) -> SafetyLevel {
        self.inner
            .config
            .lock()
            .map(|cfg| cfg.safety)
            .unwrap_or(SafetyLevel::Full)
    }

    fn segment_ratio(&self) -> u32 {
        self.inner
            .config
            .lock()
            .map(|cfg| cfg.segment_ratio)
            .unwrap_or(4)
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Open helpers
// ------------------------------------------------------------------------------------------------

fn validate_config(config: &DbConfig) -> Result<(), DbError> {
    if config.segment_ratio < 2 {
        return Err(DbError::Misuse("segment ratio must be >= 2".into()));
    }
    if config.write_buffer == 0 {
        return Err(DbError::Misuse("write buffer must be non-zero".into()));
    }
    if config.page_size < 512 || !config.page_size.is_power_of_two() {
        return Err(DbError::Misuse(
            "page size must be a power of two >= 512".into(),
        ));
    }
    if config.block_size < config.page_size || config.block_size % config.page_size != 0 {
        return Err(DbError::Misuse(
            "block size must be a multiple of the page size".into(),
        ));
    }
    Ok(())
}

/// `<db path>-log`, next to the database file.
fn log_path_of(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-log");
    PathBuf::from(name)
}

/// Rebuild the full snapshot from a decoded checkpoint, resolving the
/// LEVELS and FREELIST system records when the overflow flag is set.
fn load_snapshot(
    pager: &Arc<Pager>,
    ckpt: checkpoint::DecodedCkpt,
) -> Result<Snapshot, DbError> {
    let mut snap = Snapshot {
        ckpt_id: ckpt.ckpt_id,
        levels: ckpt.inline_levels,
        n_block: ckpt.n_block,
        page_size: ckpt.page_size,
        block_size: ckpt.block_size,
        log_ptr: ckpt.log_ptr,
        free: Vec::new(),
    };

    if ckpt.ovfl {
        if let Some(blob) = lookup_sys(pager, &snap, checkpoint::SYS_LEVELS_KEY)? {
            let tail = checkpoint::decode_levels_record(&blob)?;
            snap.levels.extend(tail);
        }
    }

    snap.free = match ckpt.free {
        FreeDecoded::Full(list) => list
            .into_iter()
            .map(|block| FreeBlock { block, freed_at: 0 })
            .collect(),
        FreeDecoded::Delta { keep, refree } => {
            let blob = lookup_sys(pager, &snap, checkpoint::SYS_FREELIST_KEY)?
                .ok_or(DbError::Pager(PagerError::Corrupt(0)))?;
            let mut list = checkpoint::decode_free_record(&blob)?;
            list.truncate(keep as usize);
            for block in refree {
                if block != 0 {
                    list.push(block);
                }
            }
            list.into_iter()
                .map(|block| FreeBlock { block, freed_at: 0 })
                .collect()
        }
    };

    Ok(snap)
}

/// Find a system record, searching segments youngest first.
///
/// System payloads are chunked (see the checkpoint codec); all chunks
/// of the newest version live in the segment holding its chunk 0, so
/// the remaining chunks are read from that segment alone.
fn lookup_sys(
    pager: &Arc<Pager>,
    snap: &Snapshot,
    base: &[u8],
) -> Result<Option<Vec<u8>>, DbError> {
    for seg in snap.reader_segments() {
        let mut cursor = SegmentCursor::new(Arc::clone(pager), seg);
        let Some(head) = cursor.seek_sys(&checkpoint::sys_chunk_key(base, 0))? else {
            continue;
        };
        let (count, payload) = checkpoint::chunk_head(&head)?;
        let mut blob = payload.to_vec();
        for index in 1..count {
            let chunk = cursor
                .seek_sys(&checkpoint::sys_chunk_key(base, index))?
                .ok_or(DbError::Pager(PagerError::Corrupt(seg.first_pg)))?;
            blob.extend_from_slice(&chunk);
        }
        return Ok(Some(blob));
    }
    Ok(None)
}
