//! Runtime environment — injectable file I/O.
//!
//! Every byte stratadb reads or writes goes through an [`Env`], so the
//! whole engine can be pointed at an alternative filesystem
//! implementation. Two implementations ship with the crate:
//!
//! - [`PosixEnv`] — positioned reads and writes on `std::fs::File`,
//!   with optional memory mapping for the read path.
//! - [`FaultEnv`] — wraps another environment and fails I/O after a
//!   countdown. Crash and torn-write tests are built on it; the hook
//!   lives on the environment rather than any process-global state.
//!
//! # Concurrency model
//!
//! [`EnvFile`] methods take `&self` and are positioned (no shared file
//! cursor), so a single handle may be used from several threads at
//! once. Callers serialize logically conflicting writes themselves.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by environment operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnvError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file could not be opened or created.
    #[error("cannot open {path}: {source}")]
    CantOpen {
        /// Path that failed to open.
        path: String,
        /// Underlying error.
        source: io::Error,
    },
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// An open file handle.
///
/// All operations are positioned; there is no shared cursor.
pub trait EnvFile: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `off`.
    ///
    /// Returns the number of bytes actually available; a short count
    /// means the read crossed end-of-file.
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` starting at `off`, extending the file if
    /// needed.
    fn write_at(&self, off: u64, data: &[u8]) -> io::Result<()>;

    /// Durability barrier: flush file content and metadata to stable
    /// storage.
    fn sync(&self) -> io::Result<()>;

    /// Truncate (or extend with zeroes) to `len` bytes.
    fn truncate(&self, len: u64) -> io::Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Memory-map the first `len` bytes for reading, if this
    /// environment supports it. `None` falls callers back to
    /// [`EnvFile::read_at`].
    fn map(&self, len: u64) -> io::Result<Option<Mmap>>;
}

/// A runtime environment: opens files and nothing else.
pub trait Env: Send + Sync {
    /// Open `path`, creating it when `create` is set.
    fn open_file(&self, path: &Path, create: bool) -> Result<Arc<dyn EnvFile>, EnvError>;

    /// Remove the file at `path`.
    fn remove_file(&self, path: &Path) -> Result<(), EnvError>;
}

// ------------------------------------------------------------------------------------------------
// PosixEnv — the default environment
// ------------------------------------------------------------------------------------------------

/// Default environment backed by `std::fs`.
#[derive(Debug, Default)]
pub struct PosixEnv;

struct PosixFile {
    file: std::fs::File,
    path: String,
}

impl EnvFile for PosixFile {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], off + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        trace!(path = %self.path, off, len = buf.len(), read, "read_at");
        Ok(read)
    }

    fn write_at(&self, off: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, off)?;
        trace!(path = %self.path, off, len = data.len(), "write_at");
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn map(&self, len: u64) -> io::Result<Option<Mmap>> {
        if len == 0 {
            return Ok(None);
        }
        // SAFETY: the map is used read-only, and the pager re-maps
        // after every file grow, so the mapped range never exceeds the
        // file length it was created against.
        let map = unsafe { memmap2::MmapOptions::new().len(len as usize).map(&self.file)? };
        Ok(Some(map))
    }
}

impl Env for PosixEnv {
    fn open_file(&self, path: &Path, create: bool) -> Result<Arc<dyn EnvFile>, EnvError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|source| EnvError::CantOpen {
                path: path.display().to_string(),
                source,
            })?;
        debug!(path = %path.display(), create, "file opened");
        Ok(Arc::new(PosixFile {
            file,
            path: path.display().to_string(),
        }))
    }

    fn remove_file(&self, path: &Path) -> Result<(), EnvError> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FaultEnv — fault injection for crash tests
// ------------------------------------------------------------------------------------------------

/// Shared fault-injection state.
///
/// `remaining == u64::MAX` means faults are disarmed. Arming with `n`
/// lets the next `n` write-class operations (writes, syncs, truncates)
/// succeed; every one after that fails with `io::ErrorKind::Other`.
#[derive(Debug)]
pub struct FaultState {
    remaining: AtomicU64,
}

impl FaultState {
    /// Create a disarmed fault state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicU64::new(u64::MAX),
        })
    }

    /// Allow `n` more write-class operations, then start failing.
    pub fn arm(&self, n: u64) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    /// Stop injecting faults.
    pub fn disarm(&self) {
        self.remaining.store(u64::MAX, Ordering::SeqCst);
    }

    fn check(&self) -> io::Result<()> {
        let prev = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v == u64::MAX || v == 0 {
                    None
                } else {
                    Some(v - 1)
                }
            });
        match prev {
            Ok(_) => Ok(()),
            Err(u64::MAX) => Ok(()),
            Err(_) => Err(io::Error::other("injected I/O fault")),
        }
    }
}

/// An environment wrapper that injects write-path I/O failures.
pub struct FaultEnv {
    inner: Arc<dyn Env>,
    state: Arc<FaultState>,
}

impl FaultEnv {
    /// Wrap `inner`, sharing the given fault state.
    pub fn new(inner: Arc<dyn Env>, state: Arc<FaultState>) -> Self {
        Self { inner, state }
    }
}

struct FaultFile {
    inner: Arc<dyn EnvFile>,
    state: Arc<FaultState>,
}

impl EnvFile for FaultFile {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_at(off, buf)
    }

    fn write_at(&self, off: u64, data: &[u8]) -> io::Result<()> {
        self.state.check()?;
        self.inner.write_at(off, data)
    }

    fn sync(&self) -> io::Result<()> {
        self.state.check()?;
        self.inner.sync()
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.state.check()?;
        self.inner.truncate(len)
    }

    fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }

    fn map(&self, len: u64) -> io::Result<Option<Mmap>> {
        self.inner.map(len)
    }
}

impl Env for FaultEnv {
    fn open_file(&self, path: &Path, create: bool) -> Result<Arc<dyn EnvFile>, EnvError> {
        let inner = self.inner.open_file(path, create)?;
        Ok(Arc::new(FaultFile {
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    fn remove_file(&self, path: &Path) -> Result<(), EnvError> {
        self.inner.remove_file(path)
    }
}
