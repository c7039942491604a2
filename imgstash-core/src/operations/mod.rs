pub mod delete_image;
pub mod list_recent;
pub mod put_image;
pub mod sweep;

pub use delete_image::{
    DeleteImageOperation, DeleteImageOperationOutcome, DeleteImageOperationRequest,
    DeleteImageOperationResult,
};
pub use list_recent::{
    ListRecentOperation, ListRecentOperationRequest, ListRecentOperationResult,
};
pub use put_image::{PutImageOperation, PutImageOperationRequest, PutImageOperationResult};
pub use sweep::{SweepOperation, SweepOperationRequest, SweepReport};

use crate::{ImageCatalog, Result, StashError};
use std::sync::Arc;

/// Run a catalog call on the blocking pool. Every catalog call opens a
/// SQLite transaction that may wait on the write lock.
pub(crate) async fn with_catalog<T, F>(catalog: &Arc<ImageCatalog>, f: F) -> Result<T>
where
    F: FnOnce(&ImageCatalog) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let catalog = catalog.clone();
    tokio::task::spawn_blocking(move || f(&catalog))
        .await
        .map_err(|e| StashError::Internal(format!("catalog task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catalog_calls_leave_the_async_thread() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ImageCatalog::open(temp_dir.path().join("meta.db")).unwrap());
        let caller = std::thread::current().id();

        let (worker, recent) = with_catalog(&catalog, |catalog| {
            Ok((std::thread::current().id(), catalog.list_last(5)?))
        })
        .await
        .unwrap();

        assert_ne!(worker, caller);
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_errors_pass_through() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ImageCatalog::open(temp_dir.path().join("meta.db")).unwrap());

        let result: Result<()> = with_catalog(&catalog, |_| {
            Err(StashError::InvalidRequest("bad".to_string()))
        })
        .await;
        assert!(matches!(result, Err(StashError::InvalidRequest(_))));
    }
}
