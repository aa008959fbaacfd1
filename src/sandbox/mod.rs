//! Sandbox handle.
//!
//! A sandbox is a local directory mirroring a remote stream or workspace.
//! Two names at its root are reserved: the metadata sidecar and the backup
//! folder used while loading.

pub mod digest;
pub mod ignore;

use crate::error::{IoContext, Result, SyncError};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Metadata sidecar at the sandbox root
pub const METADATA_FILE: &str = ".jazzmeta";

/// Backup folder at the sandbox root
pub const BACKUP_FOLDER: &str = ".jazzbackup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Open an existing sandbox directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let meta = fs::metadata(root).with_path(root)?;
        if !meta.is_dir() {
            return Err(SyncError::Config(format!(
                "sandbox {} is not a directory",
                root.display()
            )));
        }
        let root = fs::canonicalize(root).with_path(root)?;
        Ok(Self { root })
    }

    /// Open a sandbox directory, creating it if needed
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).with_path(root)?;
        Self::open(root)
    }

    /// Find the sandbox containing `start`.
    ///
    /// Walks up from `start` to the first directory holding a metadata file.
    /// Falls back to `start` itself when none of its ancestors is a sandbox.
    pub fn discover(start: impl AsRef<Path>) -> Result<Self> {
        let start = fs::canonicalize(start.as_ref()).with_path(start.as_ref())?;
        let found = start
            .ancestors()
            .find(|dir| dir.join(METADATA_FILE).is_file())
            .map(Path::to_path_buf);

        match found {
            Some(root) => Self::open(root),
            None => Self::open(start),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.root.join(BACKUP_FOLDER)
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata_path().is_file()
    }

    /// Express `path` relative to the sandbox root.
    ///
    /// Relative input is taken as already sandbox-relative.
    pub fn relative(&self, path: &Path) -> Result<PathBuf> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root).map_err(|_| {
                SyncError::Config(format!(
                    "{} is outside of sandbox {}",
                    path.display(),
                    self.root.display()
                ))
            })?
        } else {
            path
        };
        Ok(normalize_relative(rel))
    }

    pub fn absolute(&self, rel: &Path) -> PathBuf {
        if rel.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Whether a sandbox-relative path is the metadata file or backup folder
    pub fn is_reserved(rel: &Path) -> bool {
        rel == Path::new(METADATA_FILE) || rel == Path::new(BACKUP_FOLDER)
    }
}

/// Drop `.` components so equal paths compare equal as map keys
fn normalize_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Validate a single remote entry name before it becomes part of a local path.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::Precondition(
            "remote entry with an empty name".to_string(),
        ));
    }
    if name == "." || name == ".." {
        return Err(SyncError::Precondition(format!(
            "remote entry name not allowed: {}",
            name
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(SyncError::Precondition(format!(
            "remote entry name contains a path separator: {}",
            name
        )));
    }
    Ok(())
}
