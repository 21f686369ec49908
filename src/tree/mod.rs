//! In-memory tree — the ordered write buffer.
//!
//! The tree holds every mutation since the last flush as an ordered
//! map from key to value-or-tombstone. It supports point-in-time
//! **marks**: a mark captures the exact key/value state, and rolling
//! back to it discards every later mutation without replaying a
//! journal. Transactions map one nesting level to one mark.
//!
//! # Representation
//!
//! The tree is a stack of `BTreeMap` overlays. All writes land in the
//! top overlay; a mark pushes a fresh empty overlay; rollback truncates
//! the stack; commit folds upper overlays into the one below. Reads
//! resolve newest-overlay-first, so point operations stay O(log n) and
//! restoring a mark is O(1) plus the dropped overlays.
//!
//! # Frozen views
//!
//! Cursors need a stable image of the tree that later writes cannot
//! disturb. [`Tree::freeze`] flattens the overlays into an immutable,
//! sorted [`TreeView`] shared by `Arc`; the result is cached and only
//! rebuilt after the tree changes. Flushing consumes the same view, so
//! the worker and cursors agree byte-for-byte on what the tree held.
//!
//! # Size accounting
//!
//! `mem_used` tracks an approximate footprint (key + value + fixed
//! overhead per entry). The database compares it against the configured
//! write buffer size to decide when to invite a flush.


use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A mark token does not correspond to a live overlay.
    #[error("stale tree mark (depth {depth}, live {live})")]
    StaleMark {
        /// Depth encoded in the token.
        depth: usize,
        /// Current overlay count.
        live: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Core types
// ------------------------------------------------------------------------------------------------

/// Per-entry bookkeeping overhead added to `mem_used`.
const ENTRY_OVERHEAD: usize = 48;

/// A point-in-time token returned by [`Tree::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMark(usize);

/// An immutable, sorted image of the tree at one instant.
///
/// Entries are `(key, value)` where `None` is a delete tombstone.
/// Shadowing between overlays is already resolved.
#[derive(Debug, Default)]
pub struct TreeView {
    entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl TreeView {
    /// All entries in key order.
    pub fn entries(&self) -> &[(Vec<u8>, Option<Vec<u8>>)] {
        &self.entries
    }

    /// Number of entries (tombstones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the view holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first entry with key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() < key)
    }
}

// ------------------------------------------------------------------------------------------------
// Tree
// ------------------------------------------------------------------------------------------------

/// The mutable in-memory tree.
///
/// Callers serialize mutation externally (the database's writer lock);
/// freezing for reads is cheap once cached.
pub struct Tree {
    /// Overlay stack; index 0 is the base, the last is the write target.
    overlays: Vec<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,

    /// Approximate memory footprint of all overlays.
    approx_size: usize,

    /// Cached frozen view; invalidated by every mutation.
    view_cache: Option<Arc<TreeView>>,
}

impl Tree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            overlays: vec![BTreeMap::new()],
            approx_size: 0,
            view_cache: None,
        }
    }

    /// Insert or replace `key` with `value`.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.approx_size += ENTRY_OVERHEAD + key.len() + value.len();
        self.top().insert(key, Some(value));
        self.view_cache = None;
    }

    /// Record a delete tombstone for `key`.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.approx_size += ENTRY_OVERHEAD + key.len();
        self.top().insert(key, None);
        self.view_cache = None;
    }

    /// Look up `key`, newest overlay first.
    ///
    /// `Some(None)` is a tombstone; `None` means the tree has no entry
    /// for the key at all.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        for overlay in self.overlays.iter().rev() {
            if let Some(entry) = overlay.get(key) {
                return Some(entry.as_deref());
            }
        }
        None
    }

    /// Capture the current state; later mutations can be undone with
    /// [`Tree::rollback_to`].
    pub fn mark(&mut self) -> TreeMark {
        self.overlays.push(BTreeMap::new());
        trace!(depth = self.overlays.len(), "tree mark pushed");
        TreeMark(self.overlays.len())
    }

    /// Discard every mutation made after `mark`.
    pub fn rollback_to(&mut self, mark: TreeMark) -> Result<(), TreeError> {
        if mark.0 > self.overlays.len() || mark.0 < 1 {
            return Err(TreeError::StaleMark {
                depth: mark.0,
                live: self.overlays.len(),
            });
        }
        while self.overlays.len() >= mark.0 {
            let dropped = self.overlays.pop().unwrap_or_default();
            for (k, v) in &dropped {
                self.approx_size = self
                    .approx_size
                    .saturating_sub(ENTRY_OVERHEAD + k.len() + v.as_ref().map_or(0, Vec::len));
            }
        }
        if self.overlays.is_empty() {
            self.overlays.push(BTreeMap::new());
        }
        self.view_cache = None;
        trace!(depth = self.overlays.len(), "tree rolled back");
        Ok(())
    }

    /// Keep every mutation made after `mark` but release the mark
    /// itself, folding upper overlays into the one below.
    pub fn release_to(&mut self, mark: TreeMark) -> Result<(), TreeError> {
        if mark.0 > self.overlays.len() || mark.0 < 1 {
            return Err(TreeError::StaleMark {
                depth: mark.0,
                live: self.overlays.len(),
            });
        }
        while self.overlays.len() >= mark.0 && self.overlays.len() > 1 {
            let top = self.overlays.pop().unwrap_or_default();
            if let Some(below) = self.overlays.last_mut() {
                for (k, v) in top {
                    below.insert(k, v);
                }
            }
        }
        self.view_cache = None;
        Ok(())
    }

    /// Drop everything (after a flush has persisted the contents).
    pub fn clear(&mut self) {
        self.overlays = vec![BTreeMap::new()];
        self.approx_size = 0;
        self.view_cache = None;
    }

    /// Approximate memory footprint in bytes.
    pub fn mem_used(&self) -> usize {
        self.approx_size
    }

    /// True when no entries exist in any overlay.
    pub fn is_empty(&self) -> bool {
        self.overlays.iter().all(BTreeMap::is_empty)
    }

    /// Flatten the overlays into a shared immutable view.
    ///
    /// The result is cached until the next mutation, so back-to-back
    /// cursor opens between writes cost one `Arc` clone.
    pub fn freeze(&mut self) -> Arc<TreeView> {
        if let Some(view) = &self.view_cache {
            return Arc::clone(view);
        }

        let mut merged: BTreeMap<&[u8], &Option<Vec<u8>>> = BTreeMap::new();
        for overlay in &self.overlays {
            for (k, v) in overlay {
                merged.insert(k.as_slice(), v);
            }
        }
        let entries = merged
            .into_iter()
            .map(|(k, v)| (k.to_vec(), v.clone()))
            .collect();

        let view = Arc::new(TreeView { entries });
        self.view_cache = Some(Arc::clone(&view));
        view
    }

    fn top(&mut self) -> &mut BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        if self.overlays.is_empty() {
            self.overlays.push(BTreeMap::new());
        }
        // The stack is never empty; the guard above restores the
        // invariant even if a caller misused rollback.
        self.overlays.last_mut().unwrap()
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("overlays", &self.overlays.len())
            .field("approx_size", &self.approx_size)
            .finish()
    }
}
