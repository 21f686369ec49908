//! # StrataDB
//!
//! An embeddable, ordered key-value storage engine: a **log-structured
//! merge tree** in a single database file plus a write-ahead log, with
//! nestable transactions and crash-safe checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          Db                               │
//! │  ┌────────────┐   ┌───────────────────────────────────┐   │
//! │  │  In-memory │   │  Levels (one segment each,        │   │
//! │  │  Tree      │   │  newest → oldest, merged in the   │   │
//! │  │  + Log     │   │  background)                      │   │
//! │  └─────┬──────┘   └──────────────┬────────────────────┘   │
//! │        │   flush                 │  merge                 │
//! │        └─────────►  level 0  ────┘                        │
//! │                                                           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │  Snapshot → checkpoint (two alternating meta pages) │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Public handle — open, read, write, transactions, work |
//! | [`tree`] | In-memory ordered write buffer with transaction marks |
//! | [`log`] | Framed, checksummed write-ahead log with space reuse |
//! | [`segment`] | Immutable sorted runs: slotted pages + separator index |
//! | [`snapshot`] | Levels, merge state, free-block list |
//! | [`worker`] | Flush, budgeted merges, checkpoint publication |
//! | [`checkpoint`] | Snapshot ↔ meta-page blob codec with overflow |
//! | [`cursor`] | Merged, snapshot-pinned iteration |
//! | [`pager`] | Paged file I/O with per-page checksums |
//! | [`env`] | Injectable filesystem environment |
//! | [`encoding`] | Big-endian integers, varints, rolling checksums |
//!
//! ## Key properties
//!
//! - **Write-ahead logging** — every mutation hits the log before the
//!   in-memory tree; commits are totally ordered by log offset.
//! - **Nested transactions** — `begin`/`commit`/`rollback` to any
//!   depth, mapped onto log offsets and tree marks.
//! - **Snapshot reads** — cursors pin an immutable snapshot and never
//!   block writers or the worker.
//! - **Atomic checkpoints** — two alternating meta pages; the newer
//!   valid one wins at recovery, so a torn checkpoint write is
//!   harmless.
//! - **Crash recovery** — replay the log forward from the live
//!   checkpoint, discarding any uncommitted tail.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{Db, SeekMode, WorkFlags};
//!
//! let db = Db::open("/tmp/my.db")?;
//!
//! db.write(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//!
//! db.begin(1)?;
//! db.write(b"draft", b"v1")?;
//! db.rollback(0)?;
//! assert_eq!(db.get(b"draft")?, None);
//!
//! let mut cursor = db.cursor()?;
//! cursor.seek(b"h", SeekMode::Ge)?;
//! while cursor.valid() {
//!     println!("{:?} = {:?}", cursor.key(), cursor.value());
//!     cursor.next()?;
//! }
//!
//! db.work(WorkFlags::FLUSH | WorkFlags::CHECKPOINT, 0)?;
//! db.close()?;
//! # Ok::<(), stratadb::DbError>(())
//! ```

pub mod checkpoint;
pub mod cursor;
pub mod db;
pub mod encoding;
pub mod env;
pub mod log;
pub mod pager;
pub mod segment;
pub mod snapshot;
pub mod tree;
pub mod worker;

pub use cursor::{Cursor, SeekMode};
pub use db::{ConfigParam, Db, DbConfig, DbError, DbInfo, ErrorCode, SafetyLevel, WorkFlags};
pub use env::{Env, FaultEnv, FaultState, PosixEnv};
