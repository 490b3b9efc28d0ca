use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw uploaded file plus its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub name: String,
    pub uploaded_at: DateTime<Utc>,
    /// SHA-256 of `bytes`, lowercase hex
    pub content_hash: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, uploaded_at: DateTime<Utc>) -> Self {
        let content_hash = content_hash(&bytes);
        Self {
            name: name.into(),
            uploaded_at,
            content_hash,
            bytes,
        }
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            uploaded_at: self.uploaded_at,
            content_hash: self.content_hash.clone(),
            size: self.bytes.len() as u64,
        }
    }
}

/// Stored file metadata, without the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub uploaded_at: DateTime<Utc>,
    pub content_hash: String,
    pub size: u64,
}

pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
