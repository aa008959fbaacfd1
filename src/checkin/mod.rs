//! Check-in of local changes to a repository workspace.
//!
//! Changes are replayed in an order the server accepts: modifications first
//! (any order, bounded concurrency), then additions parent before child, then
//! deletions child before parent. Metadata for adds and modifications flows
//! through the store's concurrent write session, which is drained before any
//! deletion touches the map. A failed request aborts the check-in; whatever
//! already succeeded stays recorded so a rerun picks up the remainder.

use crate::error::{Result, SyncError};
use crate::metadata::{MetadataRecord, MetadataStore, SandboxMetadata};
use crate::remote::{RemoteNode, RemoteRoot, ScmService};
use crate::sandbox::digest::{digest_file, FileStat};
use crate::sandbox::ignore::SharedIgnore;
use crate::sandbox::Sandbox;
use crate::status::{detect_changes, ChangeSet};
use futures::stream::{self, TryStreamExt};
use reqwest::Url;
use std::path::Path;

/// Component name suffix preferred for new top-level entries
pub const DEFAULT_COMPONENT_SUFFIX: &str = "Default Component";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// Nothing to check in
    Unchanged,
    Completed(CheckinSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckinSummary {
    pub modified: usize,
    pub added: usize,
    pub deleted: usize,
}

pub struct CheckinCoordinator<'a> {
    service: &'a dyn ScmService,
    sandbox: &'a Sandbox,
    ignore: SharedIgnore,
    concurrency: usize,
}

impl<'a> CheckinCoordinator<'a> {
    pub fn new(
        service: &'a dyn ScmService,
        sandbox: &'a Sandbox,
        ignore: SharedIgnore,
    ) -> Self {
        Self {
            service,
            sandbox,
            ignore,
            concurrency: crate::config::DEFAULT_UPLOAD_CONCURRENCY,
        }
    }

    /// Limit on modified-file uploads in flight
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn checkin(&self) -> Result<CheckinOutcome> {
        let metadata_path = self.sandbox.metadata_path();
        let mut store = MetadataStore::load(&metadata_path)?;
        ensure_checkin_target(store.metadata())?;

        let changes = detect_changes(self.sandbox, store.records(), &self.ignore)?;
        if changes.unchanged() {
            tracing::info!("Sandbox is unchanged, nothing checked in");
            return Ok(CheckinOutcome::Unchanged);
        }
        if let Some((path, _)) = changes.modified.iter().find(|(_, m)| m.kind_changed()) {
            return Err(SyncError::Precondition(format!(
                "{} changed between file and folder; check in its removal first",
                path.display()
            )));
        }

        let root = RemoteRoot::Workspace(store.metadata().workspace_id.clone());
        let workspace = self.service.fetch_root(&root).await?;
        let default_component = default_component(&workspace)?;
        tracing::debug!("Default component is {}", default_component);

        let replayed = self
            .replay(&root, &mut store, &changes, &default_component)
            .await;
        // Whatever reached the server stays recorded, even after a failure
        let saved = store.save(&metadata_path).await;
        replayed?;
        saved?;

        self.service.refresh(&root).await?;

        let summary = CheckinSummary {
            modified: changes.modified.len(),
            added: changes.added.len(),
            deleted: changes.deleted.len(),
        };
        tracing::info!(
            "Checked in {} modified, {} added, {} deleted",
            summary.modified,
            summary.added,
            summary.deleted
        );
        Ok(CheckinOutcome::Completed(summary))
    }

    async fn replay(
        &self,
        root: &RemoteRoot,
        store: &mut MetadataStore,
        changes: &ChangeSet,
        default_component: &str,
    ) -> Result<()> {
        store.begin_concurrent_writes()?;
        self.check_in_modified(root, store, changes).await?;
        self.check_in_added(root, store, changes, default_component)
            .await?;
        // Deletions edit the map directly
        store.end_concurrent_writes().await?;
        self.check_in_deleted(root, store, changes).await
    }

    async fn check_in_modified(
        &self,
        root: &RemoteRoot,
        store: &MetadataStore,
        changes: &ChangeSet,
    ) -> Result<()> {
        stream::iter(changes.modified.iter().map(Ok::<_, SyncError>))
            .try_for_each_concurrent(self.concurrency, |(rel, modification)| async move {
                tracing::info!("{} (Modified)", rel.display());
                let component = &modification.record.component_id;
                let abs = self.sandbox.absolute(rel);
                let node = self
                    .service
                    .write_content(root, component, rel, &abs)
                    .await?;
                let record = file_record(&abs, &node, component)?;
                store.put(record, self.sandbox)
            })
            .await
    }

    async fn check_in_added(
        &self,
        root: &RemoteRoot,
        store: &MetadataStore,
        changes: &ChangeSet,
        default_component: &str,
    ) -> Result<()> {
        // Ascending order puts every parent before its children
        for (rel, entry) in &changes.added {
            tracing::info!("{} (Added)", rel.display());
            let abs = self.sandbox.absolute(rel);
            let parent = rel.parent().unwrap_or(Path::new(""));
            let name = rel
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    SyncError::Config(format!("cannot check in {}: bad file name", rel.display()))
                })?;

            let component = if parent.as_os_str().is_empty() {
                default_component.to_string()
            } else {
                store
                    .get(parent, self.sandbox)
                    .await?
                    .map(|record| record.component_id)
                    .unwrap_or_else(|| default_component.to_string())
            };

            let record = if entry.is_dir {
                let node = self
                    .service
                    .create_folder(root, &component, parent, name)
                    .await?;
                let mut record = MetadataRecord::directory(
                    abs.clone(),
                    node.scm_extension.item_id,
                    node.scm_extension.state_id,
                    non_empty_or(node.scm_extension.component_id, &component),
                );
                record.last_modified = FileStat::capture(&abs)?.last_modified;
                record
            } else {
                self.service
                    .create_file(root, &component, parent, name)
                    .await?;
                let node = self
                    .service
                    .write_content(root, &component, rel, &abs)
                    .await?;
                file_record(&abs, &node, &component)?
            };
            store.put(record, self.sandbox)?;
        }
        Ok(())
    }

    async fn check_in_deleted(
        &self,
        root: &RemoteRoot,
        store: &mut MetadataStore,
        changes: &ChangeSet,
    ) -> Result<()> {
        // Deepest first so folders are empty by the time they go
        for (rel, record) in changes.deleted.iter().rev() {
            tracing::info!("{} (Deleted)", rel.display());
            self.service
                .delete(root, &record.component_id, rel)
                .await?;
            store.remove(rel, self.sandbox)?;
        }
        Ok(())
    }
}

/// Check-ins need a sandbox loaded from a repository workspace
pub fn ensure_checkin_target(metadata: &SandboxMetadata) -> Result<()> {
    if metadata.workspace_id.is_empty() {
        return Err(SyncError::Config(
            "sandbox has not been loaded; run load first".to_string(),
        ));
    }
    if metadata.is_stream {
        return Err(SyncError::Precondition(
            "the sandbox is loaded from a stream, which doesn't support check-ins; \
             load a repository workspace instead"
                .to_string(),
        ));
    }
    Ok(())
}

/// Component for new top-level entries: one named "... Default Component",
/// else the first
fn default_component(workspace: &RemoteNode) -> Result<String> {
    let preferred = workspace
        .children
        .iter()
        .find(|component| component.name.ends_with(DEFAULT_COMPONENT_SUFFIX));
    if preferred.is_none() {
        tracing::warn!("No default component in {}, using the first", workspace.name);
    }
    preferred
        .or_else(|| workspace.children.first())
        .map(|component| component.item_id().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            SyncError::Precondition(format!("workspace {} has no components", workspace.name))
        })
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

/// Record for a file just written to the server
fn file_record(abs: &Path, node: &RemoteNode, component: &str) -> Result<MetadataRecord> {
    let stat = FileStat::capture(abs)?;
    Ok(MetadataRecord {
        path: abs.to_path_buf(),
        item_id: node.scm_extension.item_id.clone(),
        state_id: node.scm_extension.state_id.clone(),
        component_id: non_empty_or(node.scm_extension.component_id.clone(), component),
        hash: Some(digest_file(abs)?),
        size: stat.size,
        last_modified: stat.last_modified,
        is_dir: false,
    })
}

/// Page where a checked-in change set can be delivered to the team
pub fn changes_page_url(base_url: &str, user_id: &str, project: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let mut url = base.join("/code/jazzui/changes.html").ok()?;
    url.set_fragment(Some(&format!(
        "/code/jazz/Changes/_/file/{}-OrionContent/{}",
        user_id, project
    )));
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, id: &str) -> RemoteNode {
        let mut node = RemoteNode {
            name: name.to_string(),
            directory: true,
            ..Default::default()
        };
        node.scm_extension.item_id = id.to_string();
        node
    }

    #[test]
    fn test_default_component_preferred() {
        let mut workspace = component("ws", "ws1");
        workspace.children = vec![
            component("Other", "c1"),
            component("demo Default Component", "c2"),
        ];
        assert_eq!(default_component(&workspace).unwrap(), "c2");
    }

    #[test]
    fn test_default_component_falls_back_to_first() {
        let mut workspace = component("ws", "ws1");
        workspace.children = vec![component("Other", "c1"), component("Another", "c2")];
        assert_eq!(default_component(&workspace).unwrap(), "c1");

        workspace.children.clear();
        assert!(default_component(&workspace).is_err());
    }

    #[test]
    fn test_checkin_target_must_be_loaded_workspace() {
        assert!(matches!(
            ensure_checkin_target(&SandboxMetadata::default()),
            Err(SyncError::Config(_))
        ));

        let mut metadata = SandboxMetadata {
            is_stream: true,
            workspace_id: "s1".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ensure_checkin_target(&metadata),
            Err(SyncError::Precondition(_))
        ));

        metadata.is_stream = false;
        assert!(ensure_checkin_target(&metadata).is_ok());
    }

    #[test]
    fn test_changes_page_url() {
        let url =
            changes_page_url("https://hub.jazz.net/ccm01", "alice", "alice | demo").unwrap();
        assert!(url.starts_with("https://hub.jazz.net/code/jazzui/changes.html#"));
        assert!(url.contains("alice-OrionContent"));
    }
}
