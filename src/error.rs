//! Error types for sandbox operations.
//!
//! Local filesystem and decode failures carry the offending path. Nothing is
//! retried here; the transport's single login replay is the only retry.

use std::path::{Path, PathBuf};

/// Errors that can occur while loading, inspecting or checking in a sandbox
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Missing or invalid sandbox, settings or arguments
    #[error("configuration error: {0}")]
    Config(String),

    /// Login was attempted and rejected by the server
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server demanded a login but no credentials were configured
    #[error("authentication required: guest access was not granted for {url}")]
    AuthenticationRequired { url: String },

    /// Unexpected status code or body from the remote service
    #[error("unexpected response from {url} (status {status}): {body}")]
    RemoteProtocol {
        url: String,
        status: u16,
        body: String,
    },

    /// Remote body could not be decoded
    #[error("malformed response body: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection-level HTTP failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem create/read/write/delete failure
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata sidecar exists but cannot be decoded
    #[error("metadata file {} is corrupt: {source}", path.display())]
    MetadataCorruption {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    /// Operation not allowed in the current state
    #[error("{0}")]
    Precondition(String),
}

impl SyncError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn protocol(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        SyncError::RemoteProtocol {
            url: url.into(),
            status,
            body: body.into(),
        }
    }
}

/// Attach a path to `std::io::Result` values
pub(crate) trait IoContext<T> {
    fn with_path(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| SyncError::io(path, source))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
