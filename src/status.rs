//! Change detection.
//!
//! Three-way comparison of the live sandbox tree, the recorded metadata and
//! the ignore rules. The walk is read-only: neither the filesystem nor the
//! metadata is touched.

use crate::error::{Result, SyncError};
use crate::metadata::{MetadataRecord, PathMap};
use crate::sandbox::digest::{digest_file, FileStat};
use crate::sandbox::ignore::{is_ignored_within, SharedIgnore};
use crate::sandbox::Sandbox;
use ignore::{Walk, WalkBuilder};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// What the walk found on disk for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEntry {
    pub is_dir: bool,
    pub size: u64,
}

/// A tracked path whose local state no longer matches its record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub record: MetadataRecord,
    pub local: LocalEntry,
}

impl Modification {
    /// File replaced by a directory or the other way around
    pub fn kind_changed(&self) -> bool {
        self.record.is_dir != self.local.is_dir
    }
}

/// Local changes keyed by sandbox-relative path.
///
/// Modified and deleted entries carry the record they were compared
/// against, so callers can address the remote item without a second lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeMap<PathBuf, LocalEntry>,
    pub modified: BTreeMap<PathBuf, Modification>,
    pub deleted: BTreeMap<PathBuf, MetadataRecord>,
}

impl ChangeSet {
    pub fn unchanged(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unchanged()
    }
}

/// Whether the entry at `path` still matches `record`.
///
/// Files compare by size first, then by content digest. A record without a
/// digest never matches.
pub fn matches_record(path: &Path, record: &MetadataRecord) -> Result<bool> {
    let stat = FileStat::capture(path)?;
    if stat.is_dir || record.is_dir {
        return Ok(stat.is_dir == record.is_dir);
    }
    if stat.size != record.size {
        return Ok(false);
    }
    match &record.hash {
        Some(hash) => Ok(digest_file(path)? == *hash),
        None => Ok(false),
    }
}

/// Walk the sandbox in file name order, pruning the reserved root entries and
/// everything the ignore predicate matches. Symbolic links are not followed.
pub(crate) fn sandbox_walker(sandbox: &Sandbox, ignore: &SharedIgnore) -> Walk {
    subtree_walker(sandbox, sandbox.root(), ignore)
}

/// Same pruning as [`sandbox_walker`], starting at `start` inside the sandbox
pub(crate) fn subtree_walker(sandbox: &Sandbox, start: &Path, ignore: &SharedIgnore) -> Walk {
    let filter_root = sandbox.root().to_path_buf();
    let filter_ignore = ignore.clone();

    let mut walker = WalkBuilder::new(start);
    walker
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            if let Ok(rel) = entry.path().strip_prefix(&filter_root) {
                if Sandbox::is_reserved(rel) {
                    return false;
                }
            }
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !filter_ignore.is_ignored(entry.path(), is_dir)
        });
    walker.build()
}

/// Compute the change set for `sandbox` against `records`
pub fn detect_changes(
    sandbox: &Sandbox,
    records: &PathMap,
    ignore: &SharedIgnore,
) -> Result<ChangeSet> {
    let root = sandbox.root().to_path_buf();
    let mut changes = ChangeSet::default();
    let mut visited: HashSet<PathBuf> = HashSet::new();

    for entry in sandbox_walker(sandbox, ignore) {
        let entry = entry.map_err(|e| SyncError::io(&root, std::io::Error::other(e)))?;
        if entry.depth() == 0 {
            continue;
        }

        let path = entry.path();
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            tracing::warn!("Skipping symbolic link {}", path.display());
            continue;
        }

        let rel = sandbox.relative(path)?;
        let is_dir = file_type.is_dir();
        visited.insert(rel.clone());

        match records.get(&rel) {
            None => {
                let size = if is_dir {
                    0
                } else {
                    FileStat::capture(path)?.size
                };
                tracing::debug!("added: {}", rel.display());
                changes.added.insert(rel, LocalEntry { is_dir, size });
            }
            Some(record) => {
                if record.is_dir && is_dir {
                    continue;
                }
                if !matches_record(path, record)? {
                    let stat = FileStat::capture(path)?;
                    tracing::debug!("modified: {}", rel.display());
                    changes.modified.insert(
                        rel,
                        Modification {
                            record: record.clone(),
                            local: LocalEntry {
                                is_dir: stat.is_dir,
                                size: stat.size,
                            },
                        },
                    );
                }
            }
        }
    }

    for (rel, record) in records {
        if visited.contains(rel) {
            continue;
        }
        let abs = sandbox.absolute(rel);
        if is_ignored_within(ignore.as_ref(), &root, &abs, record.is_dir) {
            continue;
        }
        tracing::debug!("deleted: {}", rel.display());
        changes.deleted.insert(rel.clone(), record.clone());
    }

    tracing::debug!(
        "{} added, {} modified, {} deleted",
        changes.added.len(),
        changes.modified.len(),
        changes.deleted.len()
    );
    Ok(changes)
}
