//! Content digests and captured file stats.

use crate::error::{IoContext, Result};
use filetime::FileTime;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Read buffer for hashing
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Blake3 digest of a file's content, hex encoded
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_path(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize().as_bytes()))
}

pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Size and modification time of an entry at the moment it was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub size: u64,
    /// Unix seconds
    pub last_modified: i64,
}

impl FileStat {
    pub fn capture(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).with_path(path)?;
        let mtime = FileTime::from_last_modification_time(&meta);
        Ok(Self {
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            last_modified: mtime.unix_seconds(),
        })
    }
}
