//! Attachment file storage.
//!
//! `FileStore` hides where uploaded bytes live. The local store writes into a
//! directory the server also serves at `/uploads`; the Cloudinary store
//! pushes to the asset host with signed requests.

use crate::settings::StorageSettings;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const UPLOADS_ROUTE: &str = "/uploads";

/// What the store hands back for a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub url: String,
    pub external_id: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file is {size} bytes, the limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("storage io: {0}")]
    Io(#[from] io::Error),
    #[error("storage transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage host answered {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("storage {0} is missing its credentials")]
    NotConfigured(&'static str),
    #[error("invalid stored file id {0}")]
    InvalidId(String),
}

pub fn check_size(size: usize, max: usize) -> Result<(), StorageError> {
    if size > max {
        Err(StorageError::TooLarge { size, max })
    } else {
        Ok(())
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn put(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredFile, StorageError>;

    async fn delete(&self, external_id: &str) -> Result<(), StorageError>;
}

/// Build the store named in the settings.
pub fn store_from_settings(
    settings: &StorageSettings,
    client: reqwest::Client,
) -> Result<Arc<dyn FileStore>, StorageError> {
    match settings.provider.as_str() {
        "cloudinary" => {
            let (Some(cloud_name), Some(api_key), Some(api_secret)) = (
                settings.cloud_name.clone(),
                settings.api_key.clone(),
                settings.api_secret.clone(),
            ) else {
                return Err(StorageError::NotConfigured("cloudinary"));
            };
            Ok(Arc::new(CloudinaryStore {
                client,
                cloud_name,
                api_key,
                api_secret,
                folder: settings.folder.clone(),
            }))
        }
        _ => Ok(Arc::new(LocalFileStore::new(&settings.local_dir))),
    }
}

// ── Local directory ────────────────────────────────────────────

pub struct LocalFileStore {
    dir: PathBuf,
}

impl LocalFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        LocalFileStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Keep a recognizable name while making sure it stays one path segment.
fn sanitize(file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn put(
        &self,
        file_name: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredFile, StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stored_name = format!("{}-{}", Uuid::new_v4(), sanitize(file_name));
        let size = bytes.len() as u64;
        tokio::fs::write(self.dir.join(&stored_name), bytes).await?;
        Ok(StoredFile {
            url: format!("{UPLOADS_ROUTE}/{stored_name}"),
            external_id: stored_name,
            size,
        })
    }

    async fn delete(&self, external_id: &str) -> Result<(), StorageError> {
        if external_id.contains(['/', '\\']) || external_id.starts_with('.') {
            return Err(StorageError::InvalidId(external_id.to_string()));
        }
        match tokio::fs::remove_file(self.dir.join(external_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Cloudinary ─────────────────────────────────────────────────

pub struct CloudinaryStore {
    client: reqwest::Client,
    cloud_name: String,
    api_key: String,
    api_secret: String,
    folder: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
    bytes: u64,
    resource_type: String,
}

/// Cloudinary request signature: parameters sorted by name, joined as a
/// query string, secret appended, SHA-256 hex.
pub fn sign(params: &[(&str, &str)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let digest = Sha256::digest(format!("{}{secret}", joined.join("&")).as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

impl CloudinaryStore {
    fn endpoint(&self, resource_type: &str, action: &str) -> String {
        format!(
            "https://api.cloudinary.com/v1_1/{}/{resource_type}/{action}",
            self.cloud_name
        )
    }

    async fn post(
        &self,
        url: String,
        form: reqwest::multipart::Form,
    ) -> Result<reqwest::Response, StorageError> {
        let response = self.client.post(url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl FileStore for CloudinaryStore {
    async fn put(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredFile, StorageError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign(
            &[("folder", self.folder.as_str()), ("timestamp", timestamp.as_str())],
            &self.api_secret,
        );
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("api_key", self.api_key.clone())
            .text("timestamp", timestamp)
            .text("folder", self.folder.clone())
            .text("signature_algorithm", "sha256")
            .text("signature", signature);

        let uploaded: UploadResponse = self
            .post(self.endpoint("auto", "upload"), form)
            .await?
            .json()
            .await?;
        tracing::info!(public_id = %uploaded.public_id, bytes = uploaded.bytes, "uploaded to cloudinary");

        Ok(StoredFile {
            url: uploaded.secure_url,
            external_id: format!("{}:{}", uploaded.resource_type, uploaded.public_id),
            size: uploaded.bytes,
        })
    }

    async fn delete(&self, external_id: &str) -> Result<(), StorageError> {
        let (resource_type, public_id) = external_id
            .split_once(':')
            .unwrap_or(("raw", external_id));
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign(
            &[("public_id", public_id), ("timestamp", timestamp.as_str())],
            &self.api_secret,
        );
        let form = reqwest::multipart::Form::new()
            .text("public_id", public_id.to_string())
            .text("api_key", self.api_key.clone())
            .text("timestamp", timestamp)
            .text("signature_algorithm", "sha256")
            .text("signature", signature);
        self.post(self.endpoint(resource_type, "destroy"), form).await?;
        tracing::info!(%public_id, "deleted from cloudinary");
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_limit() {
        assert!(check_size(10, 10).is_ok());
        assert!(matches!(check_size(11, 10), Err(StorageError::TooLarge { size: 11, max: 10 })));
    }

    #[test]
    fn sanitized_names_stay_in_the_directory() {
        assert_eq!(sanitize("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize("report 2026.pdf"), "report_2026.pdf");
        assert_eq!(sanitize(""), "file");
    }

    #[test]
    fn signature_sorts_parameters() {
        let expected = Sha256::digest(b"public_id=sample&timestamp=1315060510abcd");
        let expected: String = expected.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(sign(&[("timestamp", "1315060510"), ("public_id", "sample")], "abcd"), expected);
        assert_eq!(expected.len(), 64);
    }

    #[tokio::test]
    async fn local_store_writes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path().join("uploads"));

        let stored = store.put("notes.txt", "text/plain", b"hello".to_vec()).await.unwrap();
        assert_eq!(stored.size, 5);
        assert!(stored.url.starts_with("/uploads/"));
        assert!(stored.external_id.ends_with("-notes.txt"));

        let path = store.dir().join(&stored.external_id);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");

        store.delete(&stored.external_id).await.unwrap();
        assert!(!path.exists());
        // Deleting twice is fine.
        store.delete(&stored.external_id).await.unwrap();
        assert!(store.delete("../escape").await.is_err());
    }

    #[test]
    fn cloudinary_needs_credentials() {
        let settings = StorageSettings {
            provider: "cloudinary".into(),
            ..StorageSettings::default()
        };
        assert!(matches!(
            store_from_settings(&settings, reqwest::Client::new()),
            Err(StorageError::NotConfigured("cloudinary"))
        ));
    }
}
