//! Sandbox metadata: what the server thinks is at each path.
//!
//! The aggregate is persisted as a fixed-order bincode encoding in the
//! sandbox's `.jazzmeta` sidecar. Field order of [`SandboxMetadata`] is the
//! wire order; there is no version tag, so reordering fields breaks existing
//! sandboxes.
//!
//! Paths are stored relative to the sandbox root. Every lookup and insert
//! normalizes its path first, and lookups hand back absolute paths.

mod session;

use crate::error::{IoContext, Result, SyncError};
use crate::sandbox::Sandbox;
use serde::{Deserialize, Serialize};
use session::WriteSession;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Records keyed by sandbox-relative path
pub type PathMap = BTreeMap<PathBuf, MetadataRecord>;

/// One remote-tracked filesystem entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub path: PathBuf,
    pub item_id: String,
    pub state_id: String,
    pub component_id: String,
    /// Content digest; files only
    pub hash: Option<String>,
    pub size: u64,
    /// Unix seconds when the record was written
    pub last_modified: i64,
    pub is_dir: bool,
}

impl MetadataRecord {
    pub fn directory(
        path: impl Into<PathBuf>,
        item_id: impl Into<String>,
        state_id: impl Into<String>,
        component_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            item_id: item_id.into(),
            state_id: state_id.into(),
            component_id: component_id.into(),
            hash: None,
            size: 0,
            last_modified: 0,
            is_dir: true,
        }
    }
}

/// The persisted aggregate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub is_stream: bool,
    pub ccm_base_url: String,
    /// Stream id when `is_stream`, workspace id otherwise
    pub workspace_id: String,
    pub project_name: String,
    pub user_id: String,
    pub path_map: PathMap,
    pub component_etag: BTreeMap<String, String>,
}

impl SandboxMetadata {
    pub fn decode(path: &Path, data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|source| SyncError::MetadataCorruption {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

/// Metadata aggregate plus the optional concurrent-write session.
///
/// While a session is open the path map is owned by the session task and
/// [`MetadataStore::records`] is empty; use [`MetadataStore::get`].
#[derive(Debug, Default)]
pub struct MetadataStore {
    metadata: SandboxMetadata,
    session: Option<WriteSession>,
}

impl MetadataStore {
    pub fn new(metadata: SandboxMetadata) -> Self {
        Self {
            metadata,
            session: None,
        }
    }

    /// Read the sidecar at `path`; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No metadata at {}, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(SyncError::io(path, e)),
        };

        let metadata = SandboxMetadata::decode(path, &data)?;
        tracing::debug!(
            "Loaded metadata for {} ({} records)",
            metadata.project_name,
            metadata.path_map.len()
        );
        Ok(Self::new(metadata))
    }

    /// Drain any open session, then write the sidecar atomically
    pub async fn save(&mut self, path: &Path) -> Result<()> {
        self.end_concurrent_writes().await?;

        let data = self
            .metadata
            .encode()
            .map_err(|e| SyncError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        let temp_file = path.with_extension("tmp");
        {
            let file = fs::File::create(&temp_file).with_path(&temp_file)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&data).with_path(&temp_file)?;
            writer.flush().with_path(&temp_file)?;
            writer.get_ref().sync_all().with_path(&temp_file)?;
        }

        // Atomic rename
        fs::rename(&temp_file, path).with_path(path)?;

        tracing::debug!(
            "Saved {} metadata records to {}",
            self.metadata.path_map.len(),
            path.display()
        );
        Ok(())
    }

    pub fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    /// Project identity and ETag fields; the path map is managed through
    /// the put/get/remove operations
    pub fn metadata_mut(&mut self) -> &mut SandboxMetadata {
        &mut self.metadata
    }

    pub fn records(&self) -> &PathMap {
        &self.metadata.path_map
    }

    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn begin_concurrent_writes(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(SyncError::Precondition(
                "concurrent metadata writes already in progress".to_string(),
            ));
        }
        let map = std::mem::take(&mut self.metadata.path_map);
        self.session = Some(WriteSession::start(map));
        Ok(())
    }

    /// Queue a record on the open session
    pub fn put(&self, mut record: MetadataRecord, sandbox: &Sandbox) -> Result<()> {
        let session = self.session.as_ref().ok_or_else(|| {
            SyncError::Precondition(
                "metadata put called without a concurrent write session".to_string(),
            )
        })?;
        record.path = sandbox.relative(&record.path)?;
        session.put(record)
    }

    /// Insert directly; not allowed while a session owns the map
    pub fn simple_put(&mut self, mut record: MetadataRecord, sandbox: &Sandbox) -> Result<()> {
        self.ensure_no_session("simple_put")?;
        record.path = sandbox.relative(&record.path)?;
        self.metadata.path_map.insert(record.path.clone(), record);
        Ok(())
    }

    /// Look up `path`; the returned record carries an absolute path
    pub async fn get(&self, path: &Path, sandbox: &Sandbox) -> Result<Option<MetadataRecord>> {
        let rel = sandbox.relative(path)?;
        let found = match &self.session {
            Some(session) => session.get(rel).await?,
            None => self.metadata.path_map.get(&rel).cloned(),
        };

        Ok(found.map(|mut record| {
            record.path = sandbox.absolute(&record.path);
            record
        }))
    }

    pub fn remove(&mut self, path: &Path, sandbox: &Sandbox) -> Result<Option<MetadataRecord>> {
        self.ensure_no_session("remove")?;
        let rel = sandbox.relative(path)?;
        Ok(self.metadata.path_map.remove(&rel))
    }

    /// Drop every record, returning the previous map
    pub fn take_records(&mut self) -> Result<PathMap> {
        self.ensure_no_session("take_records")?;
        Ok(std::mem::take(&mut self.metadata.path_map))
    }

    /// Stop the session after its queue drains; no-op when none is open
    pub async fn end_concurrent_writes(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            let map = session.finish().await?;
            self.metadata.path_map = map;
        }
        Ok(())
    }

    fn ensure_no_session(&self, op: &str) -> Result<()> {
        if self.session.is_some() {
            return Err(SyncError::Precondition(format!(
                "metadata {} called during a concurrent write session",
                op
            )));
        }
        Ok(())
    }
}
