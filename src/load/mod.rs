//! Sandbox loading.
//!
//! Fetches a stream or workspace tree and overlays it onto the sandbox.
//! Local content is never destroyed silently: an entry that would be
//! overwritten or removed is moved to the backup folder unless it still
//! matches what the previous load recorded, is ignored, or the load is
//! forced.

pub mod backup;

use crate::error::{IoContext, Result, SyncError};
use crate::metadata::{MetadataRecord, MetadataStore, PathMap, SandboxMetadata};
use crate::remote::{RemoteNode, RemoteRoot, ScmService};
use crate::sandbox::digest::{digest_bytes, digest_file, FileStat};
use crate::sandbox::ignore::SharedIgnore;
use crate::sandbox::{validate_name, Sandbox};
use crate::status::{matches_record, sandbox_walker, subtree_walker};
use backup::{remove_entry, BackupFolder};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// What to load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadTarget {
    pub project: String,
    /// Stream or workspace name; defaults to "{project} Stream" or
    /// "{project} Workspace"
    pub name: Option<String>,
    /// Load a personal repository workspace instead of a stream
    pub workspace: bool,
    pub user_id: Option<String>,
    /// Skip name resolution and load this root directly
    pub resolved: Option<RemoteRoot>,
}

impl LoadTarget {
    pub fn stream(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    pub fn workspace(project: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            workspace: true,
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Reload whatever the sandbox was last loaded from
    pub fn from_metadata(metadata: &SandboxMetadata) -> Result<Self> {
        if metadata.project_name.is_empty() || metadata.workspace_id.is_empty() {
            return Err(SyncError::Config(
                "sandbox has not been loaded yet; give a project to load".to_string(),
            ));
        }
        let id = metadata.workspace_id.clone();
        Ok(Self {
            project: metadata.project_name.clone(),
            name: None,
            workspace: !metadata.is_stream,
            user_id: Some(metadata.user_id.clone()).filter(|user| !user.is_empty()),
            resolved: Some(if metadata.is_stream {
                RemoteRoot::Stream(id)
            } else {
                RemoteRoot::Workspace(id)
            }),
        })
    }

    pub fn default_stream_name(&self) -> String {
        format!("{} Stream", self.project)
    }

    pub fn default_workspace_name(&self) -> String {
        format!("{} Workspace", self.project)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Delete conflicting local content instead of backing it up
    pub force: bool,
}

/// Counts reported after a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub root: RemoteRoot,
    pub directories: usize,
    pub files: usize,
    /// Files whose local content had to be replaced
    pub written: usize,
    /// Local entries deleted because the target no longer has them
    pub removed: usize,
    pub backed_up: usize,
}

impl LoadSummary {
    fn new(root: RemoteRoot) -> Self {
        Self {
            root,
            directories: 0,
            files: 0,
            written: 0,
            removed: 0,
            backed_up: 0,
        }
    }
}

/// Per-load working state
struct LoadRun {
    /// Records from the previous load
    previous: PathMap,
    backup: BackupFolder,
    options: LoadOptions,
    summary: LoadSummary,
}

pub struct SandboxLoader<'a> {
    service: &'a dyn ScmService,
    sandbox: &'a Sandbox,
    ignore: SharedIgnore,
}

impl<'a> SandboxLoader<'a> {
    pub fn new(
        service: &'a dyn ScmService,
        sandbox: &'a Sandbox,
        ignore: SharedIgnore,
    ) -> Self {
        Self {
            service,
            sandbox,
            ignore,
        }
    }

    pub async fn load(&self, target: &LoadTarget, options: LoadOptions) -> Result<LoadSummary> {
        let root = self.resolve(target).await?;
        tracing::info!(
            "Loading {} {} of {} into {}",
            if root.is_stream() { "stream" } else { "workspace" },
            root.id(),
            target.project,
            self.sandbox.root().display()
        );

        let metadata_path = self.sandbox.metadata_path();
        let mut store = MetadataStore::load(&metadata_path)?;
        let mut run = LoadRun {
            previous: store.take_records()?,
            backup: BackupFolder::new(self.sandbox),
            options,
            summary: LoadSummary::new(root.clone()),
        };

        let root_node = self.service.fetch_root(&root).await?;
        let mut etags = BTreeMap::new();
        let mut incoming: HashSet<PathBuf> = HashSet::new();

        for component in &root_node.children {
            let component_id = component.item_id();
            if component_id.is_empty() {
                return Err(SyncError::protocol(
                    self.service.base_url(),
                    200,
                    format!("component {} has no item id", component.name),
                ));
            }
            tracing::debug!("Fetching component {} ({})", component.name, component_id);

            let tree = self.service.fetch_component(&root, component_id).await?;
            if let Some(etag) = tree.etag {
                etags.insert(component_id.to_string(), etag);
            }

            for (rel, node) in flatten(&tree.node)? {
                if Sandbox::is_reserved(&rel) {
                    tracing::warn!("Skipping remote entry with reserved name {}", rel.display());
                    continue;
                }
                if !incoming.insert(rel.clone()) {
                    tracing::warn!("Skipping duplicate remote entry {}", rel.display());
                    continue;
                }
                let record = self
                    .materialize(&root, component_id, &rel, node, &mut run)
                    .await?;
                store.simple_put(record, self.sandbox)?;
            }
        }

        // Ignore files may have arrived with the new tree
        self.ignore.reset();
        self.sweep(&incoming, &mut run)?;

        let metadata = store.metadata_mut();
        metadata.is_stream = root.is_stream();
        metadata.ccm_base_url = self.service.base_url().to_string();
        metadata.workspace_id = root.id().to_string();
        metadata.project_name = target.project.clone();
        metadata.user_id = target.user_id.clone().unwrap_or_default();
        metadata.component_etag = etags;
        store.save(&metadata_path).await?;

        let mut summary = run.summary;
        summary.backed_up = run.backup.finish()?;
        tracing::info!(
            "Loaded {} files and {} folders ({} replaced, {} removed, {} backed up)",
            summary.files,
            summary.directories,
            summary.written,
            summary.removed,
            summary.backed_up
        );
        Ok(summary)
    }

    async fn resolve(&self, target: &LoadTarget) -> Result<RemoteRoot> {
        if let Some(root) = &target.resolved {
            return Ok(root.clone());
        }
        if target.project.is_empty() {
            return Err(SyncError::Config("no project given to load".to_string()));
        }

        let stream_name = target.default_stream_name();
        if !target.workspace {
            let name = target.name.clone().unwrap_or(stream_name);
            let id = self.find_stream(&target.project, &name).await?;
            return Ok(RemoteRoot::Stream(id));
        }

        let owner = target.user_id.as_deref().ok_or_else(|| {
            SyncError::Config("a user id is required to load a workspace".to_string())
        })?;
        let name = target
            .name
            .clone()
            .unwrap_or_else(|| target.default_workspace_name());

        if let Some(id) = self
            .service
            .find_workspace(&target.project, &name, owner)
            .await?
        {
            return Ok(RemoteRoot::Workspace(id));
        }

        tracing::info!("Workspace {} not found, creating it from {}", name, stream_name);
        let stream_id = self.find_stream(&target.project, &stream_name).await?;
        let id = self
            .service
            .create_workspace(&target.project, &name, &stream_id)
            .await?;
        Ok(RemoteRoot::Workspace(id))
    }

    async fn find_stream(&self, project: &str, name: &str) -> Result<String> {
        self.service
            .find_stream(project, name)
            .await?
            .ok_or_else(|| {
                SyncError::Config(format!("stream '{}' not found in project {}", name, project))
            })
    }

    /// Write one remote entry to disk and build its record
    async fn materialize(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        rel: &Path,
        node: &RemoteNode,
        run: &mut LoadRun,
    ) -> Result<MetadataRecord> {
        let abs = self.sandbox.absolute(rel);
        let existing = match fs::symlink_metadata(&abs) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::io(&abs, e)),
        };
        let identity = &node.scm_extension;
        let record_component = if identity.component_id.is_empty() {
            component_id
        } else {
            identity.component_id.as_str()
        };

        if node.directory {
            if existing.as_ref().is_some_and(|meta| !meta.is_dir()) {
                self.clobber(&abs, rel, run)?;
            }
            fs::create_dir_all(&abs).with_path(&abs)?;
            run.summary.directories += 1;

            let mut record = MetadataRecord::directory(
                rel,
                &identity.item_id,
                &identity.state_id,
                record_component,
            );
            record.last_modified = FileStat::capture(&abs)?.last_modified;
            return Ok(record);
        }

        let data = self.service.download(root, component_id, rel).await?;
        let digest = digest_bytes(&data);
        let unchanged = match &existing {
            Some(meta) if meta.is_file() => digest_file(&abs)? == digest,
            _ => false,
        };

        if !unchanged {
            if existing.is_some() {
                self.clobber(&abs, rel, run)?;
            }
            fs::write(&abs, &data).with_path(&abs)?;
            run.summary.written += 1;
            tracing::debug!("Wrote {}", rel.display());
        }
        run.summary.files += 1;

        let stat = FileStat::capture(&abs)?;
        Ok(MetadataRecord {
            path: rel.to_path_buf(),
            item_id: identity.item_id.clone(),
            state_id: identity.state_id.clone(),
            component_id: record_component.to_string(),
            hash: Some(digest),
            size: stat.size,
            last_modified: stat.last_modified,
            is_dir: false,
        })
    }

    /// Get a conflicting local entry out of the way
    fn clobber(&self, abs: &Path, rel: &Path, run: &mut LoadRun) -> Result<()> {
        let is_dir = fs::symlink_metadata(abs).with_path(abs)?.is_dir();
        let discard = run.options.force
            || self.ignore.is_ignored(abs, is_dir)
            || self.is_pristine(abs, rel, &run.previous)?;
        if discard {
            tracing::debug!("Replacing {}", rel.display());
            return remove_entry(abs);
        }
        run.backup.stash(abs, rel)
    }

    /// Tracked entry still matching what the previous load wrote. A
    /// directory qualifies when everything under it that is not ignored is
    /// tracked and unmodified.
    fn is_pristine(&self, abs: &Path, rel: &Path, previous: &PathMap) -> Result<bool> {
        match previous.get(rel) {
            Some(record) if record.is_dir => self.is_pristine_tree(abs, previous),
            Some(record) => matches_record(abs, record),
            None => Ok(false),
        }
    }

    fn is_pristine_tree(&self, abs: &Path, previous: &PathMap) -> Result<bool> {
        if !fs::symlink_metadata(abs).with_path(abs)?.is_dir() {
            return Ok(false);
        }
        for entry in subtree_walker(self.sandbox, abs, &self.ignore) {
            let entry =
                entry.map_err(|e| SyncError::io(abs, std::io::Error::other(e)))?;
            if entry.depth() == 0 {
                continue;
            }
            if entry.file_type().map_or(true, |t| t.is_symlink()) {
                return Ok(false);
            }
            let rel = self.sandbox.relative(entry.path())?;
            let clean = match previous.get(&rel) {
                Some(record) => matches_record(entry.path(), record)?,
                None => false,
            };
            if !clean {
                tracing::debug!("{} has local changes", rel.display());
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove or back up local entries the new tree does not contain.
    ///
    /// Runs deepest first so a directory is looked at after its contents.
    /// The walk prunes ignored paths, so tracked entries beneath them are
    /// picked up from the previous records: unmodified ones are removed and
    /// the rest stay in place. Untracked ignored entries are never touched.
    fn sweep(&self, incoming: &HashSet<PathBuf>, run: &mut LoadRun) -> Result<()> {
        let mut stale: Vec<StaleEntry> = Vec::new();
        let mut visited: HashSet<PathBuf> = HashSet::new();
        for entry in sandbox_walker(self.sandbox, &self.ignore) {
            let entry = entry
                .map_err(|e| SyncError::io(self.sandbox.root(), std::io::Error::other(e)))?;
            if entry.depth() == 0 {
                continue;
            }
            let rel = self.sandbox.relative(entry.path())?;
            visited.insert(rel.clone());
            if incoming.contains(&rel) {
                continue;
            }
            stale.push(StaleEntry {
                is_dir: entry.file_type().is_some_and(|t| t.is_dir()),
                ignored: false,
                rel,
            });
        }

        for rel in run.previous.keys() {
            if incoming.contains(rel) || visited.contains(rel) {
                continue;
            }
            let abs = self.sandbox.absolute(rel);
            let meta = match fs::symlink_metadata(&abs) {
                Ok(meta) => meta,
                // Gone, or its parent was replaced by a file
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound
                        || abs.parent().is_some_and(|parent| !parent.is_dir()) =>
                {
                    continue
                }
                Err(e) => return Err(SyncError::io(&abs, e)),
            };
            stale.push(StaleEntry {
                rel: rel.clone(),
                is_dir: meta.is_dir(),
                ignored: true,
            });
        }
        stale.sort_by(|a, b| b.rel.cmp(&a.rel));

        for StaleEntry {
            rel,
            is_dir,
            ignored,
        } in stale
        {
            let abs = self.sandbox.absolute(&rel);
            if is_dir {
                let has_content = fs::read_dir(&abs).with_path(&abs)?.next().is_some();
                if has_content {
                    tracing::debug!("Keeping {}, it still has content", rel.display());
                    continue;
                }
                let tracked = run.previous.get(&rel).is_some_and(|record| record.is_dir);
                if run.options.force || tracked {
                    fs::remove_dir(&abs).with_path(&abs)?;
                    run.summary.removed += 1;
                } else if !ignored {
                    run.backup.stash(&abs, &rel)?;
                }
                continue;
            }

            if run.options.force || self.is_pristine(&abs, &rel, &run.previous)? {
                remove_entry(&abs)?;
                run.summary.removed += 1;
                tracing::debug!("Removed {}", rel.display());
            } else if ignored {
                tracing::debug!("Keeping modified ignored file {}", rel.display());
            } else {
                run.backup.stash(&abs, &rel)?;
            }
        }
        Ok(())
    }
}

/// Local entry the new tree does not contain
struct StaleEntry {
    rel: PathBuf,
    is_dir: bool,
    /// Beneath an ignored path, so only found through the previous records
    ignored: bool,
}

/// Pre-order listing of a component's descendants with sandbox-relative
/// paths. The component node itself is not part of the sandbox.
fn flatten(component: &RemoteNode) -> Result<Vec<(PathBuf, &RemoteNode)>> {
    let mut out = Vec::new();
    let mut stack: Vec<(PathBuf, &RemoteNode)> = component
        .children
        .iter()
        .rev()
        .map(|child| (PathBuf::new(), child))
        .collect();

    while let Some((parent, node)) = stack.pop() {
        validate_name(&node.name)?;
        let rel = parent.join(&node.name);
        for child in node.children.iter().rev() {
            stack.push((rel.clone(), child));
        }
        out.push((rel, node));
    }
    Ok(out)
}
