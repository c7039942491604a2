use super::with_catalog;
use crate::catalog::{BlobKind, SweepPlan};
use crate::storage::{BlobDeleteOutcome, BlobStore};
use crate::{ImageCatalog, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct SweepOperation {
    catalog: Arc<ImageCatalog>,
    blob_store: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone)]
pub struct SweepOperationRequest {
    pub now: DateTime<Utc>,
    pub gc_limit: usize,
    pub recent_limit: usize,
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub recent_trimmed: usize,
    pub thumbnails_requested: usize,
    pub expired_deleted: usize,
    pub dangling_repaired: usize,
    pub blobs_deleted: usize,
    pub blobs_missing: usize,
    pub blob_failures: usize,
}

impl SweepOperation {
    pub fn new(catalog: Arc<ImageCatalog>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            catalog,
            blob_store,
        }
    }

    /// Commit the metadata side of a sweep, then request the blob deletions
    /// it produced. Blob failures are counted and logged; they never undo the
    /// committed metadata.
    pub async fn run(&self, request: SweepOperationRequest) -> Result<SweepReport> {
        let SweepOperationRequest {
            now,
            gc_limit,
            recent_limit,
        } = request;

        let plan = with_catalog(&self.catalog, move |catalog| {
            catalog.sweep(now, gc_limit, recent_limit)
        })
        .await?;

        Ok(self.apply_blob_deletions(plan).await)
    }

    async fn apply_blob_deletions(&self, plan: SweepPlan) -> SweepReport {
        let mut report = SweepReport {
            recent_trimmed: plan.recent_trimmed,
            expired_deleted: plan.expired.len(),
            dangling_repaired: plan.repaired,
            ..Default::default()
        };

        for deletion in plan.blob_deletions {
            if deletion.kind == BlobKind::Thumbnail {
                report.thumbnails_requested += 1;
            }

            match self.blob_store.delete(&deletion.path).await {
                Ok(BlobDeleteOutcome::Deleted) => report.blobs_deleted += 1,
                Ok(BlobDeleteOutcome::NotFound) => {
                    tracing::debug!(
                        "Blob {} for {} was already gone",
                        deletion.path,
                        deletion.uuid
                    );
                    report.blobs_missing += 1;
                }
                Err(error) => {
                    tracing::error!(
                        "Failed to delete blob {} for {}: {}",
                        deletion.path,
                        deletion.uuid,
                        error
                    );
                    report.blob_failures += 1;
                }
            }
        }

        report
    }
}
