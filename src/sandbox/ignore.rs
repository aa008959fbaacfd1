//! Ignore rules for sandbox contents.
//!
//! `.jazzignore` and `.cfignore` files may appear at any directory level.
//! Their patterns are read with gitignore syntax and apply to the directory
//! holding the file and everything beneath it; a deeper file overrides a
//! shallower one.

use ::ignore::gitignore::{Gitignore, GitignoreBuilder};
use ::ignore::Match;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const IGNORE_FILES: [&str; 2] = [".jazzignore", ".cfignore"];

/// Predicate shared between the walker's filter and its caller
pub type SharedIgnore = Arc<dyn IgnorePredicate>;

/// Decides whether a sandbox entry is excluded from change tracking.
///
/// `path` is absolute. Implementations must be cheap to call repeatedly.
pub trait IgnorePredicate: Send + Sync {
    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool;

    /// Forget cached rules after ignore files may have changed on disk
    fn reset(&self) {}
}

impl<F> IgnorePredicate for F
where
    F: Fn(&Path, bool) -> bool + Send + Sync,
{
    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self(path, is_dir)
    }
}

/// Whether `path` or any directory between it and `root` is ignored
pub fn is_ignored_within(
    ignore: &dyn IgnorePredicate,
    root: &Path,
    path: &Path,
    is_dir: bool,
) -> bool {
    if ignore.is_ignored(path, is_dir) {
        return true;
    }
    path.ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(root) && *dir != root)
        .any(|dir| ignore.is_ignored(dir, true))
}

/// Never ignores anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIgnore;

impl IgnorePredicate for NoIgnore {
    fn is_ignored(&self, _path: &Path, _is_dir: bool) -> bool {
        false
    }
}

/// Matcher backed by the ignore files found in the sandbox
#[derive(Debug)]
pub struct JazzIgnore {
    root: PathBuf,
    // Per directory; None when the directory has no ignore file
    cache: Mutex<HashMap<PathBuf, Option<Arc<Gitignore>>>>,
}

impl JazzIgnore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn matcher_for(&self, dir: &Path) -> Option<Arc<Gitignore>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .entry(dir.to_path_buf())
            .or_insert_with(|| build_matcher(dir))
            .clone()
    }
}

fn build_matcher(dir: &Path) -> Option<Arc<Gitignore>> {
    let mut builder = GitignoreBuilder::new(dir);
    let mut found = false;

    for name in IGNORE_FILES {
        let file = dir.join(name);
        if !file.is_file() {
            continue;
        }
        found = true;
        if let Some(err) = builder.add(&file) {
            tracing::warn!("Ignoring malformed rules in {}: {}", file.display(), err);
        }
    }

    if !found {
        return None;
    }

    match builder.build() {
        Ok(matcher) => Some(Arc::new(matcher)),
        Err(err) => {
            tracing::warn!("Failed to build ignore rules for {}: {}", dir.display(), err);
            None
        }
    }
}

impl IgnorePredicate for JazzIgnore {
    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if !path.starts_with(&self.root) || path == self.root {
            return false;
        }

        // Deepest ignore file first
        let dirs: Vec<&Path> = path
            .ancestors()
            .skip(1)
            .take_while(|dir| dir.starts_with(&self.root))
            .collect();

        for dir in dirs {
            let Some(matcher) = self.matcher_for(dir) else {
                continue;
            };
            match matcher.matched_path_or_any_parents(path, is_dir) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }

        false
    }

    fn reset(&self) {
        match self.cache.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}
