//! Blob storage for rendered artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::trip::TripId;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob '{0}' not found")]
    NotFound(String),
}

/// Address of a blob. Artifacts live at `artifact:{request_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey(String);

impl BlobKey {
    const ARTIFACT_PREFIX: &'static str = "artifact:";

    /// The one key an artifact for `id` is ever written to.
    pub fn for_request(id: TripId) -> Self {
        Self(format!("{}{}", Self::ARTIFACT_PREFIX, id))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Request id encoded in an artifact key.
    pub fn request_id(&self) -> Option<TripId> {
        self.0.strip_prefix(Self::ARTIFACT_PREFIX)?.parse().ok()
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keyed byte storage. Only the artifact guard writes to it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Overwrite `key` so readers see either the old or the new bytes,
    /// never a partial write.
    async fn replace(&self, key: &BlobKey, bytes: &[u8]) -> Result<(), BlobError>;

    async fn exists(&self, key: &BlobKey) -> Result<bool, BlobError>;

    async fn read(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError>;

    /// Remove `key`, returning whether anything was there.
    async fn delete(&self, key: &BlobKey) -> Result<bool, BlobError>;

    async fn list(&self) -> Result<Vec<BlobKey>, BlobError>;
}

const EXTENSION: &str = ".pdf";

/// Blobs as files under one directory.
///
/// File names are the percent-encoded key plus `.pdf`. Writes go to a
/// dot-prefixed temp file in the same directory and are renamed into place.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.root
            .join(format!("{}{}", urlencoding::encode(key.as_str()), EXTENSION))
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
        move |source| BlobError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn replace(&self, key: &BlobKey, bytes: &[u8]) -> Result<(), BlobError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(Self::io(&self.root))?;

        let target = self.path_for(key);
        let tmp = self.root.join(format!(
            ".{}.{}.tmp",
            urlencoding::encode(key.as_str()),
            uuid::Uuid::new_v4()
        ));

        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io(&tmp)(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io(&target)(e));
        }
        tracing::debug!(key = %key, bytes = bytes.len(), "Blob replaced");
        Ok(())
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, BlobError> {
        let path = self.path_for(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io(&path)(e)),
        }
    }

    async fn read(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => Err(Self::io(&path)(e)),
        }
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, BlobError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io(&path)(e)),
        }
    }

    async fn list(&self) -> Result<Vec<BlobKey>, BlobError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io(&self.root)(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(Self::io(&self.root))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(EXTENSION) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(key) => keys.push(BlobKey::from_raw(key.into_owned())),
                Err(_) => tracing::warn!(file = name, "Skipping blob with undecodable name"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
