use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::{BlobStore, BlobUploadError, HttpFetcher};

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rejects keys that would escape the blob root.
fn validate_key(key: &str) -> Result<&str, BlobUploadError> {
    let trimmed = key.trim_start_matches('/');
    let valid = !trimmed.is_empty()
        && Path::new(trimmed)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(trimmed)
    } else {
        Err(BlobUploadError::InvalidKey(key.to_string()))
    }
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}

/// Archives blobs as files under a local directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    /// Reference URLs become `<base>/<key>` instead of `file://` paths.
    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = Some(base.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes via a temp file and rename so readers never see partial blobs.
    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, BlobUploadError> {
        let io_err = |source: std::io::Error| BlobUploadError::Io {
            key: key.to_string(),
            source,
        };
        let absolute_path = self.root.join(key);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        fs::canonicalize(&absolute_path).await.map_err(io_err)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobUploadError> {
        let key = validate_key(key)?;
        let path = self.write_atomic(key, bytes).await?;
        info!(
            key,
            content_type,
            bytes = bytes.len(),
            sha256 = %sha256_hex(bytes),
            "blob archived locally"
        );
        Ok(match &self.public_base_url {
            Some(base) => join_url(base, key),
            None => format!("file://{}", path.display()),
        })
    }
}

/// Uploads blobs with HTTP `PUT`, e.g. to a storage bucket's XML API.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    http: HttpFetcher,
    upload_base_url: String,
    public_base_url: String,
    bearer_token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(http: HttpFetcher, upload_base_url: impl Into<String>) -> Self {
        let upload_base_url = upload_base_url.into();
        Self {
            http,
            public_base_url: upload_base_url.clone(),
            upload_base_url,
            bearer_token: None,
        }
    }

    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = base.into();
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobUploadError> {
        let key = validate_key(key)?;
        let url = join_url(&self.upload_base_url, key);
        self.http
            .put_bytes(&url, bytes.to_vec(), content_type, self.bearer_token.as_deref())
            .await?;
        info!(key, content_type, bytes = bytes.len(), "blob uploaded");
        Ok(join_url(&self.public_base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn blob_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        assert_eq!(validate_key("/permitpdf/P1.pdf").unwrap(), "permitpdf/P1.pdf");
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("permitpdf/../../x").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn local_upload_writes_file_and_returns_file_url() {
        let dir = tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());
        let url = store
            .upload("permitpdf/P1.pdf", b"%PDF-1.4", "application/pdf")
            .await
            .expect("upload");

        let written = dir.path().join("permitpdf").join("P1.pdf");
        assert_eq!(std::fs::read(&written).unwrap(), b"%PDF-1.4");
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("permitpdf/P1.pdf"));
    }

    #[tokio::test]
    async fn local_upload_uses_public_base_url_when_configured() {
        let dir = tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path()).with_public_base_url("https://cdn.example.test/permits/");
        let url = store
            .upload("permitpdf/P9.pdf", b"%PDF", "application/pdf")
            .await
            .expect("upload");
        assert_eq!(url, "https://cdn.example.test/permits/permitpdf/P9.pdf");
    }

    #[tokio::test]
    async fn local_upload_replaces_existing_blob() {
        let dir = tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());
        store.upload("a.pdf", b"first", "application/pdf").await.unwrap();
        store.upload("a.pdf", b"second", "application/pdf").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("a.pdf")).unwrap(), b"second");
    }
}
