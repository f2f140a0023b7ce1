//! Destination object store.
//!
//! Two write paths: a single `put_object` for bodies already in memory, and
//! an initiate / upload_part / complete (or abort) sequence for bodies that
//! arrive as a stream of bounded parts. Keys are deterministic from the
//! source identity, so writing the same item twice lands on the same object.

pub mod error;
pub mod fs;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::StoreError;
pub use fs::FsObjectStore;

/// Acknowledgement for one uploaded part. Passed back verbatim on complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
}

/// Provenance recorded next to each stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub provider_id: String,
    pub media_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub stored_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Start a multipart upload and return its id.
    async fn initiate_multipart(&self, key: &str) -> Result<String, StoreError>;

    /// Part numbers start at 1.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartReceipt, StoreError>;

    /// Assemble the parts, in the order given, into the object at `key`.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartReceipt],
    ) -> Result<(), StoreError>;

    /// Discard an upload. Aborting an unknown upload is not an error.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;

    /// Write the provenance sidecar for `key`.
    async fn put_metadata(&self, key: &str, metadata: &ObjectMetadata) -> Result<(), StoreError>;
}

/// `{provider}-videos/{media_id}/{filename}` with path separators and
/// control characters in the filename replaced.
pub fn destination_key(provider_id: &str, media_id: &str, filename: &str) -> String {
    let cleaned: String = filename
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let name = match cleaned.as_str() {
        "" | "." | ".." => media_id.to_string(),
        _ => cleaned,
    };
    format!("{}-videos/{}/{}", provider_id, media_id, name)
}
