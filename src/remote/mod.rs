//! Remote SCM service model.
//!
//! [`ScmService`] is the seam between the sync engine and the server. The
//! loader and check-in coordinator only talk to this trait; the HTTP
//! implementation lives in [`http`].

pub mod http;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use http::HttpScmService;

/// Remote identity carried by every tree node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScmIdentity {
    pub item_id: String,
    pub state_id: String,
    pub component_id: String,
}

/// A node of the server's tree representation.
///
/// The root of a stream or workspace has one child per component; each
/// component's children are the top-level entries of the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNode {
    pub name: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub children: Vec<RemoteNode>,
    #[serde(default)]
    pub scm_extension: ScmIdentity,
}

impl RemoteNode {
    pub fn item_id(&self) -> &str {
        &self.scm_extension.item_id
    }
}

/// Stream or workspace summary returned by name lookups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedItem {
    pub name: String,
    pub item_id: String,
}

/// A component's tree plus the ETag it was served with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentTree {
    pub node: RemoteNode,
    pub etag: Option<String>,
}

/// Remote tree a sandbox is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteRoot {
    Stream(String),
    Workspace(String),
}

impl RemoteRoot {
    pub fn id(&self) -> &str {
        match self {
            RemoteRoot::Stream(id) | RemoteRoot::Workspace(id) => id,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RemoteRoot::Stream(_))
    }

    /// Collection name used in resource URLs
    pub fn collection(&self) -> &'static str {
        match self {
            RemoteRoot::Stream(_) => "streams",
            RemoteRoot::Workspace(_) => "workspaces",
        }
    }
}

/// Operations the sync engine needs from the SCM server.
///
/// Paths are component-relative, which is the same as sandbox-relative since
/// components are not materialized as directories.
#[async_trait]
pub trait ScmService: Send + Sync {
    /// Base URL recorded in the sandbox metadata
    fn base_url(&self) -> &str;

    async fn find_stream(&self, project: &str, name: &str) -> Result<Option<String>>;

    async fn find_workspace(&self, project: &str, name: &str, owner: &str)
        -> Result<Option<String>>;

    /// Create a workspace flowing from `flow_target`; returns its id
    async fn create_workspace(&self, project: &str, name: &str, flow_target: &str)
        -> Result<String>;

    /// Root node; its children are the components
    async fn fetch_root(&self, root: &RemoteRoot) -> Result<RemoteNode>;

    async fn fetch_component(&self, root: &RemoteRoot, component_id: &str)
        -> Result<ComponentTree>;

    async fn download(&self, root: &RemoteRoot, component_id: &str, path: &Path)
        -> Result<Bytes>;

    /// Upload the content of `local` to `path`
    async fn write_content(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        path: &Path,
        local: &Path,
    ) -> Result<RemoteNode>;

    async fn create_folder(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
    ) -> Result<RemoteNode>;

    /// Create an empty file; content follows with `write_content`
    async fn create_file(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
    ) -> Result<RemoteNode>;

    async fn delete(&self, root: &RemoteRoot, component_id: &str, path: &Path) -> Result<()>;

    /// Ask the server to refresh its cached view of `root`
    async fn refresh(&self, root: &RemoteRoot) -> Result<()>;
}
