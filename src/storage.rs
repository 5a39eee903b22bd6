//! User avatar storage. One image per user, kept outside the database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{info, warn};
use thiserror::Error;

use crate::error::ApiError;
use crate::models::Id;

pub const MAX_AVATAR_BYTES: usize = 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);
const ALLOWED_MIME: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

#[derive(Debug, Error)]
pub enum AvatarStoreError {
    #[error("not_found")]
    NotFound,
    #[error("too_large")]
    TooLarge,
    #[error("unsupported_type")]
    UnsupportedType,
    #[error("fetch: {0}")]
    Fetch(String),
    #[error("other: {0}")]
    Other(String),
}

impl From<AvatarStoreError> for ApiError {
    fn from(e: AvatarStoreError) -> Self {
        match e {
            AvatarStoreError::NotFound => ApiError::NotFound,
            AvatarStoreError::TooLarge => ApiError::invalid_input(format!("image exceeds {MAX_AVATAR_BYTES} bytes")),
            AvatarStoreError::UnsupportedType => ApiError::invalid_input("image must be PNG, JPEG, GIF or WebP"),
            AvatarStoreError::Fetch(_) => ApiError::ResourceFetchFailed,
            AvatarStoreError::Other(msg) => {
                warn!("avatar store failure: {msg}");
                ApiError::Internal
            }
        }
    }
}

#[async_trait]
pub trait AvatarStore: Send + Sync {
    async fn save(&self, user_id: Id, bytes: &[u8]) -> Result<(), AvatarStoreError>;
    /// Returns the image bytes and their sniffed MIME type.
    async fn load(&self, user_id: Id) -> Result<(Vec<u8>, String), AvatarStoreError>;
    /// Removing a missing avatar is not an error.
    async fn delete(&self, user_id: Id) -> Result<(), AvatarStoreError>;
}

/// Checks size and content type; returns the sniffed MIME type.
pub fn validate_image(bytes: &[u8]) -> Result<&'static str, AvatarStoreError> {
    if bytes.len() > MAX_AVATAR_BYTES {
        return Err(AvatarStoreError::TooLarge);
    }
    let mime = infer::get(bytes).map(|t| t.mime_type()).ok_or(AvatarStoreError::UnsupportedType)?;
    if ALLOWED_MIME.contains(&mime) {
        Ok(mime)
    } else {
        Err(AvatarStoreError::UnsupportedType)
    }
}

fn sniff(bytes: &[u8]) -> String {
    infer::get(bytes).map(|t| t.mime_type().to_string()).unwrap_or_else(|| "application/octet-stream".into())
}

// ---------------- Filesystem ----------------
pub struct FsAvatarStore {
    dir: PathBuf,
}

impl FsAvatarStore {
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!("avatar store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, user_id: Id) -> PathBuf {
        self.dir.join(user_id.simple().to_string())
    }
}

#[async_trait]
impl AvatarStore for FsAvatarStore {
    async fn save(&self, user_id: Id, bytes: &[u8]) -> Result<(), AvatarStoreError> {
        validate_image(bytes)?;
        let path = self.path_for(user_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| AvatarStoreError::Other(e.to_string()))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| AvatarStoreError::Other(e.to_string()))
    }

    async fn load(&self, user_id: Id) -> Result<(Vec<u8>, String), AvatarStoreError> {
        match tokio::fs::read(self.path_for(user_id)).await {
            Ok(bytes) => {
                let mime = sniff(&bytes);
                Ok((bytes, mime))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AvatarStoreError::NotFound),
            Err(e) => Err(AvatarStoreError::Other(e.to_string())),
        }
    }

    async fn delete(&self, user_id: Id) -> Result<(), AvatarStoreError> {
        match tokio::fs::remove_file(self.path_for(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AvatarStoreError::Other(e.to_string())),
        }
    }
}

// ---------------- Memory ----------------
#[derive(Default, Clone)]
pub struct MemoryAvatarStore {
    images: Arc<DashMap<Id, Vec<u8>>>,
}

impl MemoryAvatarStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AvatarStore for MemoryAvatarStore {
    async fn save(&self, user_id: Id, bytes: &[u8]) -> Result<(), AvatarStoreError> {
        validate_image(bytes)?;
        self.images.insert(user_id, bytes.to_vec());
        Ok(())
    }

    async fn load(&self, user_id: Id) -> Result<(Vec<u8>, String), AvatarStoreError> {
        let bytes = self.images.get(&user_id).map(|b| b.clone()).ok_or(AvatarStoreError::NotFound)?;
        let mime = sniff(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, user_id: Id) -> Result<(), AvatarStoreError> {
        self.images.remove(&user_id);
        Ok(())
    }
}

/// Downloads a remote picture (IdP profile, SSO `photo`) with a short timeout.
pub async fn fetch_remote(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, AvatarStoreError> {
    let fut = async {
        let resp = http.get(url).send().await.map_err(|e| AvatarStoreError::Fetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AvatarStoreError::Fetch(format!("status {}", resp.status())));
        }
        if resp.content_length().map(|l| l as usize > MAX_AVATAR_BYTES).unwrap_or(false) {
            return Err(AvatarStoreError::TooLarge);
        }
        let bytes = resp.bytes().await.map_err(|e| AvatarStoreError::Fetch(e.to_string()))?;
        validate_image(&bytes)?;
        Ok(bytes.to_vec())
    };
    tokio::time::timeout(FETCH_TIMEOUT, fut).await.map_err(|_| AvatarStoreError::Fetch("timed out".into()))?
}

/// Fetches and stores a remote avatar; true on success. Failures only log.
pub async fn import_remote(store: &dyn AvatarStore, http: &reqwest::Client, user_id: Id, url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    let result = match fetch_remote(http, url).await {
        Ok(bytes) => store.save(user_id, &bytes).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("avatar import failed for user {user_id}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    // Smallest valid PNG signature + IHDR prefix is enough for sniffing
    pub(crate) const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R'];

    #[test]
    fn rejects_non_images_and_oversized() {
        assert!(matches!(validate_image(b"hello"), Err(AvatarStoreError::UnsupportedType)));
        let mut big = PNG.to_vec();
        big.resize(MAX_AVATAR_BYTES + 1, 0);
        assert!(matches!(validate_image(&big), Err(AvatarStoreError::TooLarge)));
        assert_eq!(validate_image(PNG).unwrap(), "image/png");
    }

    #[tokio::test]
    async fn fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAvatarStore::new(dir.path().join("avatars")).await.unwrap();
        let id = Uuid::new_v4();
        assert!(matches!(store.load(id).await, Err(AvatarStoreError::NotFound)));
        store.save(id, PNG).await.unwrap();
        let (bytes, mime) = store.load(id).await.unwrap();
        assert_eq!(bytes, PNG);
        assert_eq!(mime, "image/png");
        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(matches!(store.load(id).await, Err(AvatarStoreError::NotFound)));
    }

    #[tokio::test]
    async fn memory_store_validates() {
        let store = MemoryAvatarStore::new();
        assert!(store.save(Uuid::new_v4(), b"not an image").await.is_err());
    }
}
