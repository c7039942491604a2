use super::with_catalog;
use crate::storage::{BlobDeleteOutcome, BlobStore};
use crate::{DeleteOutcome, ImageCatalog, ImageRecord, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct DeleteImageOperation {
    catalog: Arc<ImageCatalog>,
    blob_store: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone)]
pub struct DeleteImageOperationRequest {
    pub uuid: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct DeleteImageOperationResult {
    pub record: ImageRecord,
    /// Blob paths that could not be removed. The record is gone regardless.
    pub blob_failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum DeleteImageOperationOutcome {
    Deleted(DeleteImageOperationResult),
    NotFound,
    Forbidden,
}

impl DeleteImageOperation {
    pub fn new(catalog: Arc<ImageCatalog>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            catalog,
            blob_store,
        }
    }

    pub async fn run(
        &self,
        request: DeleteImageOperationRequest,
    ) -> Result<DeleteImageOperationOutcome> {
        let DeleteImageOperationRequest { uuid, token } = request;

        let outcome = {
            let uuid = uuid.clone();
            with_catalog(&self.catalog, move |catalog| {
                catalog.delete_with_token(&uuid, &token)
            })
            .await?
        };

        let record = match outcome {
            DeleteOutcome::Deleted(record) => record,
            DeleteOutcome::NotFound => return Ok(DeleteImageOperationOutcome::NotFound),
            DeleteOutcome::Forbidden => return Ok(DeleteImageOperationOutcome::Forbidden),
        };

        let mut blob_failures = Vec::new();
        for path in [&record.blob_path, &record.thumbnail_path] {
            if path.is_empty() {
                continue;
            }
            match self.blob_store.delete(path).await {
                Ok(BlobDeleteOutcome::Deleted) => {}
                Ok(BlobDeleteOutcome::NotFound) => {
                    tracing::debug!("Blob {} for {} was already gone", path, uuid);
                }
                Err(error) => {
                    tracing::error!("Failed to delete blob {} for {}: {}", path, uuid, error);
                    blob_failures.push(path.clone());
                }
            }
        }

        tracing::info!("Deleted image {}", uuid);
        Ok(DeleteImageOperationOutcome::Deleted(DeleteImageOperationResult {
            record,
            blob_failures,
        }))
    }
}
