//! Backup folder used while loading.
//!
//! Local content that a load would otherwise destroy is moved here, keeping
//! its sandbox-relative path. The folder is created on the first backup of a
//! load; a folder left over from an earlier load is replaced at that moment.

use crate::error::{IoContext, Result};
use crate::sandbox::Sandbox;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct BackupFolder {
    path: PathBuf,
    prepared: bool,
    count: usize,
}

impl BackupFolder {
    pub fn new(sandbox: &Sandbox) -> Self {
        Self {
            path: sandbox.backup_path(),
            prepared: false,
            count: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries moved so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Move the entry at `abs` into the backup folder under `rel`
    pub fn stash(&mut self, abs: &Path, rel: &Path) -> Result<()> {
        self.prepare()?;
        let dest = self.path.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        move_entry(abs, &dest)?;
        self.count += 1;
        tracing::info!("Backed up {}", rel.display());
        Ok(())
    }

    /// Remove the folder if it was set up but nothing landed in it
    pub fn finish(self) -> Result<usize> {
        if self.prepared && self.count == 0 && self.path.exists() {
            fs::remove_dir_all(&self.path).with_path(&self.path)?;
        }
        if self.count > 0 {
            tracing::warn!(
                "{} local entries were moved to {}",
                self.count,
                self.path.display()
            );
        }
        Ok(self.count)
    }

    fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        if self.path.exists() {
            tracing::debug!("Replacing stale backup folder {}", self.path.display());
            remove_entry(&self.path)?;
        }
        fs::create_dir_all(&self.path).with_path(&self.path)?;
        self.prepared = true;
        Ok(())
    }
}

/// Rename `src` to `dest`, merging into an existing directory at `dest`
fn move_entry(src: &Path, dest: &Path) -> Result<()> {
    let src_is_dir = fs::symlink_metadata(src).with_path(src)?.is_dir();
    if src_is_dir && dest.is_dir() {
        for entry in fs::read_dir(src).with_path(src)? {
            let entry = entry.with_path(src)?;
            move_entry(&entry.path(), &dest.join(entry.file_name()))?;
        }
        fs::remove_dir(src).with_path(src)?;
        return Ok(());
    }
    fs::rename(src, dest).with_path(src)
}

/// Delete a file or a whole directory tree
pub(crate) fn remove_entry(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).with_path(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path).with_path(path)
    } else {
        fs::remove_file(path).with_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Sandbox) {
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::open(tmp.path()).unwrap();
        (tmp, sandbox)
    }

    #[test]
    fn test_nothing_stashed_creates_nothing() {
        let (_tmp, sandbox) = setup();
        let backup = BackupFolder::new(&sandbox);
        assert_eq!(backup.finish().unwrap(), 0);
        assert!(!sandbox.backup_path().exists());
    }

    #[test]
    fn test_stash_keeps_relative_path() {
        let (_tmp, sandbox) = setup();
        fs::create_dir(sandbox.root().join("folder")).unwrap();
        fs::write(sandbox.root().join("folder/file1.txt"), b"mine").unwrap();

        let mut backup = BackupFolder::new(&sandbox);
        backup
            .stash(
                &sandbox.root().join("folder/file1.txt"),
                Path::new("folder/file1.txt"),
            )
            .unwrap();

        assert!(!sandbox.root().join("folder/file1.txt").exists());
        assert_eq!(
            fs::read(sandbox.backup_path().join("folder/file1.txt")).unwrap(),
            b"mine"
        );
        assert_eq!(backup.finish().unwrap(), 1);
    }

    #[test]
    fn test_stale_folder_replaced_on_first_stash() {
        let (_tmp, sandbox) = setup();
        fs::create_dir(sandbox.backup_path()).unwrap();
        fs::write(sandbox.backup_path().join("old.txt"), b"old").unwrap();
        fs::write(sandbox.root().join("new.txt"), b"new").unwrap();

        let mut backup = BackupFolder::new(&sandbox);
        backup
            .stash(&sandbox.root().join("new.txt"), Path::new("new.txt"))
            .unwrap();

        assert!(!sandbox.backup_path().join("old.txt").exists());
        assert!(sandbox.backup_path().join("new.txt").is_file());
    }

    #[test]
    fn test_directory_merges_into_existing_backup() {
        let (_tmp, sandbox) = setup();
        fs::create_dir_all(sandbox.root().join("dir/sub")).unwrap();
        fs::write(sandbox.root().join("dir/a.txt"), b"a").unwrap();

        let mut backup = BackupFolder::new(&sandbox);
        backup
            .stash(&sandbox.root().join("dir/a.txt"), Path::new("dir/a.txt"))
            .unwrap();
        backup
            .stash(&sandbox.root().join("dir"), Path::new("dir"))
            .unwrap();

        assert!(!sandbox.root().join("dir").exists());
        assert!(sandbox.backup_path().join("dir/a.txt").is_file());
        assert!(sandbox.backup_path().join("dir/sub").is_dir());
    }
}
