//! Change-set scanning: select the regular files of a tree whose modification
//! time falls inside a sync window.
//!
//! Scanning is a pure read. Nothing is opened for writing, renamed or locked,
//! since adapters may still be writing new files into the tree.

use crate::error::ScanError;
use crate::window::{SyncWindow, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One selected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    /// Path relative to the scan root.
    pub relative_path: PathBuf,
    /// Modification time captured at scan time.
    pub mtime: Timestamp,
    /// Size in bytes captured at scan time.
    pub size: u64,
}

/// Files modified inside a window, ordered by relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    window: SyncWindow,
    scope: Vec<PathBuf>,
    entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    /// Build a change-set; entries are sorted and deduplicated by path (the
    /// last entry for a path wins).
    pub fn new(window: SyncWindow, entries: impl IntoIterator<Item = ChangeEntry>) -> Self {
        let by_path: BTreeMap<PathBuf, ChangeEntry> = entries
            .into_iter()
            .map(|e| (e.relative_path.clone(), e))
            .collect();
        Self {
            window,
            scope: Vec::new(),
            entries: by_path.into_values().collect(),
        }
    }

    /// An empty change-set for `window`.
    pub fn empty(window: SyncWindow) -> Self {
        Self::new(window, Vec::new())
    }

    fn with_scope(mut self, scope: Vec<PathBuf>) -> Self {
        self.scope = scope;
        self
    }

    /// The window this change-set was selected for.
    pub fn window(&self) -> SyncWindow {
        self.window
    }

    /// Subtrees (relative to the root) the scan was restricted to; empty means
    /// the whole root.
    pub fn scope(&self) -> &[PathBuf] {
        &self.scope
    }

    /// Entries in path order.
    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no file was selected.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `relative_path` was selected.
    pub fn contains(&self, relative_path: &Path) -> bool {
        self.entries
            .binary_search_by(|e| e.relative_path.as_path().cmp(relative_path))
            .is_ok()
    }

    /// Sum of the captured file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// What the walker saw for one regular file.
#[derive(Debug, Clone)]
pub(crate) struct WalkedFile {
    pub relative_path: PathBuf,
    /// `None` when the modification time could not be read.
    pub mtime: Option<Timestamp>,
    pub size: u64,
}

/// Walks a PHOENIX root, optionally restricted to some top-level subtrees.
#[derive(Debug, Clone)]
pub struct ChangeSetScanner {
    root: PathBuf,
    subtrees: Vec<PathBuf>,
}

impl ChangeSetScanner {
    /// Scanner over the whole of `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subtrees: Vec::new(),
        }
    }

    /// Restrict the walk to `root/subtree`. Paths stay relative to `root`.
    pub fn with_subtree(mut self, subtree: impl Into<PathBuf>) -> Self {
        self.subtrees.push(subtree.into());
        self
    }

    /// The scan root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Select every regular file with `window.start <= mtime < window.end`.
    ///
    /// Symlinks and other non-regular files are skipped, as are files whose
    /// mtime cannot be read (logged). A zero-width window returns the empty
    /// set without touching the tree.
    pub fn scan(&self, window: SyncWindow) -> Result<ChangeSet, ScanError> {
        if window.is_empty() {
            debug!(%window, "zero-width window; nothing to scan");
            return Ok(ChangeSet::empty(window).with_scope(self.subtrees.clone()));
        }

        let mut selected = Vec::new();
        self.walk(|file| {
            if let Some(mtime) = file.mtime {
                if window.contains(mtime) {
                    selected.push(ChangeEntry {
                        relative_path: file.relative_path,
                        mtime,
                        size: file.size,
                    });
                }
            }
        })?;

        let change_set = ChangeSet::new(window, selected).with_scope(self.subtrees.clone());
        debug!(
            root = %self.root.display(),
            %window,
            files = change_set.len(),
            bytes = change_set.total_bytes(),
            "scan complete"
        );
        Ok(change_set)
    }

    /// Visit every regular file in scope, including those whose mtime could
    /// not be read.
    pub(crate) fn walk(&self, mut visit: impl FnMut(WalkedFile)) -> Result<(), ScanError> {
        let root_meta = std::fs::metadata(&self.root).map_err(|source| ScanError::RootUnavailable {
            path: self.root.clone(),
            source,
        })?;
        if !root_meta.is_dir() {
            return Err(ScanError::RootUnavailable {
                path: self.root.clone(),
                source: std::io::Error::other("not a directory"),
            });
        }

        let starts: Vec<PathBuf> = if self.subtrees.is_empty() {
            vec![self.root.clone()]
        } else {
            self.subtrees.iter().map(|s| self.root.join(s)).collect()
        };

        for start in starts {
            if !start.is_dir() {
                debug!(path = %start.display(), "subtree missing; skipping");
                continue;
            }
            let walker = WalkDir::new(&start)
                .follow_links(false)
                .sort_by_file_name();
            for item in walker {
                let entry = match item {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable path during scan");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative_path = match entry.path().strip_prefix(&self.root) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => continue,
                };
                let (mtime, size) = match entry.metadata() {
                    Ok(meta) => (modified(&meta, entry.path()), meta.len()),
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "cannot stat file; excluded");
                        (None, 0)
                    }
                };
                visit(WalkedFile {
                    relative_path,
                    mtime,
                    size,
                });
            }
        }
        Ok(())
    }
}

fn modified(meta: &Metadata, path: &Path) -> Option<Timestamp> {
    match meta.modified() {
        Ok(t) => Some(Timestamp::from_system_time(t)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read mtime; excluded");
            None
        }
    }
}

/// Scan the whole of `root` for `window`.
pub fn scan(root: &Path, window: SyncWindow) -> Result<ChangeSet, ScanError> {
    ChangeSetScanner::new(root).scan(window)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::window::Timestamp;
    use std::fs::File;
    use std::path::Path;

    /// Write `contents` to `root/rel` and set its mtime.
    pub fn write_file_at(root: &Path, rel: &str, contents: &[u8], mtime: Timestamp) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime.to_system_time()).unwrap();
    }
}
