use super::with_catalog;
use crate::storage::BlobStore;
use crate::{
    FsBlobStore, ImageCatalog, ImageRecord, NewImage, Result, Retention, StashError,
    new_delete_token, new_uuid,
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;

#[derive(Clone)]
pub struct PutImageOperation {
    catalog: Arc<ImageCatalog>,
    blob_store: Arc<FsBlobStore>,
}

#[derive(Debug, Clone)]
pub struct PutImageOperationRequest {
    pub body: Bytes,
    pub thumbnail: Option<Bytes>,
    /// File extension without the dot, e.g. `png`.
    pub extension: String,
    pub owner: Option<String>,
    pub unlisted: bool,
    pub retention: Retention,
    pub owner_cookie: String,
}

#[derive(Debug, Clone)]
pub struct PutImageOperationResult {
    pub record: ImageRecord,
}

impl PutImageOperation {
    pub fn new(catalog: Arc<ImageCatalog>, blob_store: Arc<FsBlobStore>) -> Self {
        Self {
            catalog,
            blob_store,
        }
    }

    pub async fn run(&self, request: PutImageOperationRequest) -> Result<PutImageOperationResult> {
        let PutImageOperationRequest {
            body,
            thumbnail,
            extension,
            owner,
            unlisted,
            retention,
            owner_cookie,
        } = request;

        if body.is_empty() {
            return Err(StashError::InvalidRequest("image body is empty".to_string()));
        }
        let extension = normalize_extension(&extension)?;

        let uuid = new_uuid();
        let blob_path = self
            .blob_store
            .put(&format!("{}.{}", uuid, extension), body)
            .await?;

        let thumbnail_path = match thumbnail {
            Some(thumbnail) => {
                match self
                    .blob_store
                    .put(&format!("{}_thumb.{}", uuid, extension), thumbnail)
                    .await
                {
                    Ok(path) => path,
                    Err(error) => {
                        self.discard(&[blob_path.as_str()]).await;
                        return Err(error);
                    }
                }
            }
            None => String::new(),
        };

        let new = NewImage {
            uuid,
            owner,
            blob_path,
            thumbnail_path,
            unlisted,
            retention,
            delete_token: new_delete_token(),
            owner_cookie,
        };
        let record = ImageRecord::from_new(new, Utc::now());

        let saved = {
            let record = record.clone();
            with_catalog(&self.catalog, move |catalog| catalog.save(record)).await
        };

        match saved {
            Ok(record) => {
                tracing::info!(
                    "Stored image {} (unlisted={}, expires={:?})",
                    record.uuid,
                    record.unlisted,
                    record.expires_at
                );
                Ok(PutImageOperationResult { record })
            }
            Err(error) => {
                self.discard(&[record.blob_path.as_str(), record.thumbnail_path.as_str()])
                    .await;
                Err(error)
            }
        }
    }

    /// Best-effort cleanup of blobs written for an upload that never got a
    /// record.
    async fn discard(&self, paths: &[&str]) {
        for path in paths.iter().filter(|path| !path.is_empty()) {
            if let Err(error) = self.blob_store.delete(path).await {
                tracing::warn!("Failed to discard orphaned blob {}: {}", path, error);
            }
        }
    }
}

fn normalize_extension(extension: &str) -> Result<String> {
    let extension = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StashError::InvalidRequest(format!(
            "invalid image extension: {:?}",
            extension
        )));
    }
    Ok(extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension(".PNG").unwrap(), "png");
        assert_eq!(normalize_extension("jpg").unwrap(), "jpg");
        assert!(normalize_extension("").is_err());
        assert!(normalize_extension("p/ng").is_err());
    }

    #[tokio::test]
    async fn test_put_image_stores_blobs_and_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ImageCatalog::open(temp_dir.path().join("meta.db")).unwrap());
        let blob_store = Arc::new(FsBlobStore::new(temp_dir.path().join("data")).unwrap());
        let operation = PutImageOperation::new(catalog.clone(), blob_store.clone());

        let result = operation
            .run(PutImageOperationRequest {
                body: Bytes::from("image"),
                thumbnail: Some(Bytes::from("thumb")),
                extension: "png".to_string(),
                owner: Some("alice".to_string()),
                unlisted: false,
                retention: Retention::Day,
                owner_cookie: "cookie".to_string(),
            })
            .await
            .unwrap();

        let record = result.record;
        assert_eq!(record.recent_sequence, Some(1));
        assert!(record.expires_at.is_some());
        assert!(!record.delete_token.is_empty());
        assert_eq!(blob_store.ensure(&record).await.unwrap(), (true, true));
        assert_eq!(catalog.load(&record.uuid).unwrap(), Some(record.clone()));
        assert_eq!(catalog.list_last(5).unwrap(), vec![record.uuid]);
    }

    #[tokio::test]
    async fn test_put_image_rejects_empty_body() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ImageCatalog::open(temp_dir.path().join("meta.db")).unwrap());
        let blob_store = Arc::new(FsBlobStore::new(temp_dir.path().join("data")).unwrap());
        let operation = PutImageOperation::new(catalog.clone(), blob_store);

        let result = operation
            .run(PutImageOperationRequest {
                body: Bytes::new(),
                thumbnail: None,
                extension: "png".to_string(),
                owner: None,
                unlisted: true,
                retention: Retention::Forever,
                owner_cookie: String::new(),
            })
            .await;

        assert!(matches!(result, Err(StashError::InvalidRequest(_))));
    }
}
