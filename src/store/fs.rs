//! Filesystem-backed object store.
//!
//! Objects live at `<root>/<key>`. Every write goes to a `.part` sibling and
//! is renamed into place, so a reader never sees a half-written object.
//! Multipart uploads are staged under `<root>/.uploads/<upload_id>/`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ObjectMetadata, ObjectStore, PartReceipt, StoreError};

const UPLOADS_DIR: &str = ".uploads";
const UPLOAD_KEY_FILE: &str = "key";
pub const METADATA_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path under the root. Keys are relative, `/`-separated
    /// and may not escape the root.
    pub fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && !key.starts_with(UPLOADS_DIR);
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, StoreError> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(self.root.join(UPLOADS_DIR).join(upload_id))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("{:05}.bin", part_number))
    }

    /// Check the upload exists and belongs to `key`.
    async fn open_upload(&self, key: &str, upload_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.upload_dir(upload_id)?;
        let owner = match fs::read_to_string(dir.join(UPLOAD_KEY_FILE)).await {
            Ok(owner) => owner,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchUpload(upload_id.to_string()));
            }
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        if owner != key {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(dir)
    }
}

fn part_file(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    Ok(())
}

/// Write `body` to `path` via a `.part` file and rename.
async fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path).await?;
    let tmp = part_file(path);
    fs::write(&tmp, body)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        write_atomic(&path, &body).await?;
        tracing::debug!(key, bytes = body.len(), "Stored object");
        Ok(())
    }

    async fn initiate_multipart(&self, key: &str) -> Result<String, StoreError> {
        self.object_path(key)?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        fs::write(dir.join(UPLOAD_KEY_FILE), key)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        tracing::debug!(key, upload_id = %upload_id, "Initiated multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartReceipt, StoreError> {
        if part_number == 0 {
            return Err(StoreError::InvalidPart {
                upload_id: upload_id.to_string(),
                part_number,
                reason: "part numbers start at 1".to_string(),
            });
        }
        let dir = self.open_upload(key, upload_id).await?;
        write_atomic(&Self::part_path(&dir, part_number), &body).await?;
        Ok(PartReceipt {
            part_number,
            etag: sha256_hex(&body),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartReceipt],
    ) -> Result<(), StoreError> {
        let dir = self.open_upload(key, upload_id).await?;
        let invalid = |part_number: u32, reason: &str| StoreError::InvalidPart {
            upload_id: upload_id.to_string(),
            part_number,
            reason: reason.to_string(),
        };

        if parts.is_empty() {
            return Err(invalid(0, "no parts to assemble"));
        }
        if parts
            .windows(2)
            .any(|w| w[0].part_number >= w[1].part_number)
        {
            return Err(invalid(0, "parts must be in ascending order"));
        }

        let path = self.object_path(key)?;
        ensure_parent(&path).await?;
        let tmp = part_file(&path);
        let mut out = fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;

        let mut total: u64 = 0;
        for receipt in parts {
            let part_path = Self::part_path(&dir, receipt.part_number);
            let data = match fs::read(&part_path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let _ = fs::remove_file(&tmp).await;
                    return Err(invalid(receipt.part_number, "part was never uploaded"));
                }
                Err(e) => return Err(StoreError::io(&part_path, e)),
            };
            if sha256_hex(&data) != receipt.etag {
                let _ = fs::remove_file(&tmp).await;
                return Err(invalid(receipt.part_number, "etag mismatch"));
            }
            out.write_all(&data)
                .await
                .map_err(|e| StoreError::io(&tmp, e))?;
            total += data.len() as u64;
        }
        out.flush().await.map_err(|e| StoreError::io(&tmp, e))?;
        drop(out);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!(upload_id, error = %e, "Failed to clean up upload staging directory");
        }
        tracing::debug!(key, parts = parts.len(), bytes = total, "Completed multipart upload");
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        let dir = match self.open_upload(key, upload_id).await {
            Ok(dir) => dir,
            Err(StoreError::NoSuchUpload(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        tracing::debug!(key, upload_id, "Aborted multipart upload");
        Ok(())
    }

    async fn put_metadata(&self, key: &str, metadata: &ObjectMetadata) -> Result<(), StoreError> {
        let path = self.object_path(&format!("{}{}", key, METADATA_SUFFIX))?;
        let json = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&path, &json).await
    }
}
