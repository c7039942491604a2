use crate::error::{Result, StashError};
use crate::record::ImageRecord;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobDeleteOutcome {
    Deleted,
    NotFound,
}

/// Owner of the original image bytes and their thumbnails.
///
/// Deletion is idempotent: a path that is already gone reports
/// [`BlobDeleteOutcome::NotFound`], which callers treat as success.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn delete(&self, path: &str) -> Result<BlobDeleteOutcome>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Presence of the original and the thumbnail of `record`.
    async fn ensure(&self, record: &ImageRecord) -> Result<(bool, bool)> {
        let original = !record.blob_path.is_empty() && self.exists(&record.blob_path).await?;
        let thumbnail =
            !record.thumbnail_path.is_empty() && self.exists(&record.thumbnail_path).await?;
        Ok((original, thumbnail))
    }
}

/// Blob store over a local data directory.
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Store `data` under `name` in the data directory and return its path.
    pub async fn put(&self, name: &str, data: Bytes) -> Result<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StashError::InvalidRequest(format!(
                "invalid blob name: {:?}",
                name
            )));
        }

        let blob_path = self.base_path.join(name);

        // Write to temporary file first, then rename for atomicity
        let temp_path = blob_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &blob_path).await?;

        tracing::debug!("Stored blob {} ({} bytes)", blob_path.display(), data.len());
        Ok(blob_path.to_string_lossy().into_owned())
    }

    pub async fn get(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(Path::new(path)).await?;
        Ok(Bytes::from(data))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn delete(&self, path: &str) -> Result<BlobDeleteOutcome> {
        if path.is_empty() {
            return Ok(BlobDeleteOutcome::NotFound);
        }

        match fs::remove_file(path).await {
            Ok(()) => {
                tracing::debug!("Deleted blob {}", path);
                Ok(BlobDeleteOutcome::Deleted)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(BlobDeleteOutcome::NotFound)
            }
            Err(error) => Err(StashError::Blob {
                path: path.to_string(),
                message: error.to_string(),
            }),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(path).await?)
    }
}

/// In-memory blob store that records every deletion request.
///
/// Paths listed through [`MemoryBlobStore::fail_on`] return an error
/// instead of being deleted.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<MemoryBlobState>,
}

#[derive(Default)]
struct MemoryBlobState {
    present: HashSet<String>,
    failing: HashSet<String>,
    delete_requests: Vec<String>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>) {
        self.lock().present.insert(path.into());
    }

    pub fn fail_on(&self, path: impl Into<String>) {
        self.lock().failing.insert(path.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().present.contains(path)
    }

    /// Every path passed to `delete`, in call order.
    pub fn delete_requests(&self) -> Vec<String> {
        self.lock().delete_requests.clone()
    }

    pub fn delete_count(&self, path: &str) -> usize {
        self.lock()
            .delete_requests
            .iter()
            .filter(|requested| requested.as_str() == path)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBlobState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn delete(&self, path: &str) -> Result<BlobDeleteOutcome> {
        let mut state = self.lock();
        state.delete_requests.push(path.to_string());

        if state.failing.contains(path) {
            return Err(StashError::Blob {
                path: path.to_string(),
                message: "simulated failure".to_string(),
            });
        }

        if state.present.remove(path) {
            Ok(BlobDeleteOutcome::Deleted)
        } else {
            Ok(BlobDeleteOutcome::NotFound)
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.lock().present.contains(path))
    }
}
