//! In-memory SCM server for integration tests.
//!
//! Mutations are recorded in the order they arrive and checked the way the
//! real server checks them: a create needs an existing parent, content can
//! only be written to an existing file, and a folder can only be deleted once
//! it is empty.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use jazzsync::error::{Result, SyncError};
use jazzsync::remote::{ComponentTree, RemoteNode, RemoteRoot, ScmIdentity, ScmService};
use jazzsync::sandbox::ignore::{JazzIgnore, SharedIgnore};
use jazzsync::Sandbox;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const BASE_URL: &str = "https://scm.test/ccm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreateWorkspace(String),
    CreateFolder { component: String, path: PathBuf },
    CreateFile { component: String, path: PathBuf },
    WriteContent { component: String, path: PathBuf },
    Delete { component: String, path: PathBuf },
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug, Default)]
struct Component {
    name: String,
    entries: BTreeMap<PathBuf, (Entry, u32)>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, String>,
    workspaces: HashMap<(String, String), String>,
    /// Root id to component ids, in order
    roots: HashMap<String, Vec<String>>,
    /// (root id, component id) to contents
    components: HashMap<(String, String), Component>,
    ops: Vec<Op>,
    fail_on: Option<PathBuf>,
    next_id: u32,
}

#[derive(Debug, Default)]
pub struct FakeScm {
    state: Mutex<State>,
}

impl FakeScm {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_stream(&self, name: &str, id: &str) {
        let mut state = self.state();
        state.streams.insert(name.to_string(), id.to_string());
        state.roots.entry(id.to_string()).or_default();
    }

    pub fn add_workspace(&self, name: &str, owner: &str, id: &str) {
        let mut state = self.state();
        state
            .workspaces
            .insert((name.to_string(), owner.to_string()), id.to_string());
        state.roots.entry(id.to_string()).or_default();
    }

    pub fn add_component(&self, root: &str, name: &str, component: &str) {
        let mut state = self.state();
        state
            .roots
            .entry(root.to_string())
            .or_default()
            .push(component.to_string());
        state.components.insert(
            (root.to_string(), component.to_string()),
            Component {
                name: name.to_string(),
                entries: BTreeMap::new(),
            },
        );
    }

    pub fn put_dir(&self, root: &str, component: &str, path: &str) {
        self.put(root, component, path, Entry::Dir);
    }

    pub fn put_file(&self, root: &str, component: &str, path: &str, content: &[u8]) {
        self.put(root, component, path, Entry::File(content.to_vec()));
    }

    fn put(&self, root: &str, component: &str, path: &str, entry: Entry) {
        let mut state = self.state();
        let component = state
            .components
            .get_mut(&(root.to_string(), component.to_string()))
            .expect("unknown component");
        let version = component
            .entries
            .get(Path::new(path))
            .map(|(_, v)| v + 1)
            .unwrap_or(1);
        component
            .entries
            .insert(PathBuf::from(path), (entry, version));
    }

    /// Make any mutation of `path` fail
    pub fn fail_on(&self, path: &str) {
        self.state().fail_on = Some(PathBuf::from(path));
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state().ops.clone()
    }

    /// Mutations only, without the trailing refresh
    pub fn mutations(&self) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| !matches!(op, Op::Refresh | Op::CreateWorkspace(_)))
            .collect()
    }

    pub fn entry(&self, root: &str, component: &str, path: &str) -> Option<Entry> {
        self.state()
            .components
            .get(&(root.to_string(), component.to_string()))
            .and_then(|c| c.entries.get(Path::new(path)))
            .map(|(entry, _)| entry.clone())
    }

    pub fn workspace_id(&self, name: &str, owner: &str) -> Option<String> {
        self.state()
            .workspaces
            .get(&(name.to_string(), owner.to_string()))
            .cloned()
    }
}

fn not_found(what: impl std::fmt::Display) -> SyncError {
    SyncError::protocol(BASE_URL, 404, format!("{} not found", what))
}

fn conflict(what: impl std::fmt::Display) -> SyncError {
    SyncError::protocol(BASE_URL, 409, what.to_string())
}

fn identity(component: &str, path: &Path, version: u32) -> ScmIdentity {
    ScmIdentity {
        item_id: format!("item:{}", path.display()),
        state_id: format!("state:{}", version),
        component_id: component.to_string(),
    }
}

fn node_for(component: &str, path: &Path, entry: &Entry, version: u32) -> RemoteNode {
    RemoteNode {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        directory: matches!(entry, Entry::Dir),
        children: Vec::new(),
        scm_extension: identity(component, path, version),
    }
}

fn build_children(component_id: &str, component: &Component, parent: &Path) -> Vec<RemoteNode> {
    component
        .entries
        .iter()
        .filter(|(path, _)| path.parent() == Some(parent))
        .map(|(path, (entry, version))| {
            let mut node = node_for(component_id, path, entry, *version);
            if matches!(entry, Entry::Dir) {
                node.children = build_children(component_id, component, path);
            }
            node
        })
        .collect()
}

impl State {
    fn component_mut(&mut self, root: &RemoteRoot, component: &str) -> Result<&mut Component> {
        self.components
            .get_mut(&(root.id().to_string(), component.to_string()))
            .ok_or_else(|| not_found(format!("component {}", component)))
    }

    fn check_failure(&self, path: &Path) -> Result<()> {
        if self.fail_on.as_deref() == Some(path) {
            return Err(SyncError::protocol(BASE_URL, 500, "injected failure"));
        }
        Ok(())
    }

    fn create(
        &mut self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
        entry: Entry,
    ) -> Result<RemoteNode> {
        let path = parent.join(name);
        self.check_failure(&path)?;
        let component = self.component_mut(root, component_id)?;
        if !parent.as_os_str().is_empty()
            && component.entries.get(parent).map(|(e, _)| e) != Some(&Entry::Dir)
        {
            return Err(conflict(format!("parent {} does not exist", parent.display())));
        }
        if component.entries.contains_key(&path) {
            return Err(conflict(format!("{} already exists", path.display())));
        }
        let node = node_for(component_id, &path, &entry, 1);
        component.entries.insert(path.clone(), (entry.clone(), 1));

        let op = match entry {
            Entry::Dir => Op::CreateFolder {
                component: component_id.to_string(),
                path,
            },
            Entry::File(_) => Op::CreateFile {
                component: component_id.to_string(),
                path,
            },
        };
        self.ops.push(op);
        Ok(node)
    }
}

#[async_trait]
impl ScmService for FakeScm {
    fn base_url(&self) -> &str {
        BASE_URL
    }

    async fn find_stream(&self, _project: &str, name: &str) -> Result<Option<String>> {
        Ok(self.state().streams.get(name).cloned())
    }

    async fn find_workspace(
        &self,
        _project: &str,
        name: &str,
        owner: &str,
    ) -> Result<Option<String>> {
        Ok(self.workspace_id(name, owner))
    }

    async fn create_workspace(
        &self,
        _project: &str,
        name: &str,
        flow_target: &str,
    ) -> Result<String> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("ws-{}", state.next_id);

        // A new workspace starts with a copy of its flow target
        let source: Vec<String> = state.roots.get(flow_target).cloned().unwrap_or_default();
        for component_id in &source {
            let copy = state
                .components
                .get(&(flow_target.to_string(), component_id.clone()))
                .map(|c| Component {
                    name: c.name.clone(),
                    entries: c.entries.clone(),
                })
                .unwrap_or_default();
            state.components.insert((id.clone(), component_id.clone()), copy);
        }
        state.roots.insert(id.clone(), source);
        state
            .workspaces
            .insert((name.to_string(), "owner".to_string()), id.clone());
        state.ops.push(Op::CreateWorkspace(name.to_string()));
        Ok(id)
    }

    async fn fetch_root(&self, root: &RemoteRoot) -> Result<RemoteNode> {
        let state = self.state();
        let components = state
            .roots
            .get(root.id())
            .ok_or_else(|| not_found(root.id()))?;
        let children = components
            .iter()
            .map(|id| {
                let name = state
                    .components
                    .get(&(root.id().to_string(), id.clone()))
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                RemoteNode {
                    name,
                    directory: true,
                    children: Vec::new(),
                    scm_extension: ScmIdentity {
                        item_id: id.clone(),
                        state_id: String::new(),
                        component_id: id.clone(),
                    },
                }
            })
            .collect();
        Ok(RemoteNode {
            name: root.id().to_string(),
            directory: true,
            children,
            scm_extension: ScmIdentity::default(),
        })
    }

    async fn fetch_component(
        &self,
        root: &RemoteRoot,
        component_id: &str,
    ) -> Result<ComponentTree> {
        let mut state = self.state();
        let component = state.component_mut(root, component_id)?;
        let node = RemoteNode {
            name: component.name.clone(),
            directory: true,
            children: build_children(component_id, component, Path::new("")),
            scm_extension: ScmIdentity {
                item_id: component_id.to_string(),
                state_id: String::new(),
                component_id: component_id.to_string(),
            },
        };
        Ok(ComponentTree {
            node,
            etag: Some(format!("\"etag-{}\"", component_id)),
        })
    }

    async fn download(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        path: &Path,
    ) -> Result<Bytes> {
        let mut state = self.state();
        let component = state.component_mut(root, component_id)?;
        match component.entries.get(path) {
            Some((Entry::File(content), _)) => Ok(Bytes::from(content.clone())),
            _ => Err(not_found(path.display())),
        }
    }

    async fn write_content(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        path: &Path,
        local: &Path,
    ) -> Result<RemoteNode> {
        let content = std::fs::read(local).map_err(|e| SyncError::io(local, e))?;
        let mut state = self.state();
        state.check_failure(path)?;
        let component = state.component_mut(root, component_id)?;
        let version = match component.entries.get(path) {
            Some((Entry::File(_), version)) => version + 1,
            _ => return Err(not_found(path.display())),
        };
        let entry = Entry::File(content);
        let node = node_for(component_id, path, &entry, version);
        component
            .entries
            .insert(path.to_path_buf(), (entry, version));
        state.ops.push(Op::WriteContent {
            component: component_id.to_string(),
            path: path.to_path_buf(),
        });
        Ok(node)
    }

    async fn create_folder(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
    ) -> Result<RemoteNode> {
        self.state()
            .create(root, component_id, parent, name, Entry::Dir)
    }

    async fn create_file(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
    ) -> Result<RemoteNode> {
        self.state()
            .create(root, component_id, parent, name, Entry::File(Vec::new()))
    }

    async fn delete(&self, root: &RemoteRoot, component_id: &str, path: &Path) -> Result<()> {
        let mut state = self.state();
        state.check_failure(path)?;
        let component = state.component_mut(root, component_id)?;
        if !component.entries.contains_key(path) {
            return Err(not_found(path.display()));
        }
        if component.entries.keys().any(|p| p.parent() == Some(path)) {
            return Err(conflict(format!("{} is not empty", path.display())));
        }
        component.entries.remove(path);
        state.ops.push(Op::Delete {
            component: component_id.to_string(),
            path: path.to_path_buf(),
        });
        Ok(())
    }

    async fn refresh(&self, _root: &RemoteRoot) -> Result<()> {
        self.state().ops.push(Op::Refresh);
        Ok(())
    }
}

/// Project used by the integration tests
pub const PROJECT: &str = "sirnewton | gojazz-test";

/// A default stream with the usual test content, plus an alternate stream
pub fn standard_server() -> FakeScm {
    let scm = FakeScm::new();
    scm.add_stream(&format!("{} Stream", PROJECT), "stream-main");
    scm.add_component("stream-main", "gojazz-test Default Component", "comp1");
    scm.put_file("stream-main", "comp1", "README.md", b"# readme\n");
    scm.put_file("stream-main", "comp1", ".jazzignore", b"bin/\n*.log\n");
    scm.put_dir("stream-main", "comp1", "folder");
    scm.put_file("stream-main", "comp1", "folder/file1.txt", b"file one");
    scm.put_file("stream-main", "comp1", "folder/file2.jsp", b"<jsp/>");
    scm.put_dir("stream-main", "comp1", "bin");
    scm.put_file("stream-main", "comp1", "bin/mybinary.so", b"\x7fELF");

    scm.add_stream("Alternate Stream", "stream-alt");
    scm.add_component("stream-alt", "gojazz-test Default Component", "comp1");
    scm.put_file("stream-alt", "comp1", ".jazzignore", b"bin/\n*.log\n");
    scm.put_dir("stream-alt", "comp1", "folder");
    scm.put_file("stream-alt", "comp1", "folder/file2.jsp", b"<jsp/>");
    scm.put_file("stream-alt", "comp1", "alternateFile.txt", b"alt");
    scm.put_dir("stream-alt", "comp1", "alternateFolder");
    scm.put_file(
        "stream-alt",
        "comp1",
        "alternateFolder/anotherAlternateFile.txt",
        b"another",
    );

    scm.add_stream("Empty Stream", "stream-empty");
    scm
}

pub fn ignore_for(sandbox: &Sandbox) -> SharedIgnore {
    Arc::new(JazzIgnore::new(sandbox.root()))
}

/// Sorted names directly under `dir`
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
