use super::with_catalog;
use crate::{ImageCatalog, ImageRecord, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct ListRecentOperation {
    catalog: Arc<ImageCatalog>,
}

#[derive(Debug, Clone)]
pub struct ListRecentOperationRequest {
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ListRecentOperationResult {
    pub items: Vec<ImageRecord>,
}

impl ListRecentOperation {
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self { catalog }
    }

    /// Newest listed records first. Entries whose record has gone missing
    /// are skipped; the collector removes them on its next pass.
    pub async fn run(
        &self,
        request: ListRecentOperationRequest,
    ) -> Result<ListRecentOperationResult> {
        let limit = request.limit;
        let items = with_catalog(&self.catalog, move |catalog| {
            let mut items = Vec::new();
            for uuid in catalog.list_last(limit)? {
                match catalog.load(&uuid)? {
                    Some(record) => items.push(record),
                    None => tracing::warn!("Recent index points at missing image {}", uuid),
                }
            }
            Ok(items)
        })
        .await?;

        Ok(ListRecentOperationResult { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(uuid: &str, unlisted: bool) -> ImageRecord {
        ImageRecord {
            uuid: uuid.to_string(),
            owner: None,
            added_at: Utc::now(),
            expires_at: None,
            unlisted,
            delete_token: "t".to_string(),
            owner_cookie: String::new(),
            recent_sequence: None,
            blob_path: format!("{}.png", uuid),
            thumbnail_path: String::new(),
        }
    }

    #[tokio::test]
    async fn test_list_recent_skips_unlisted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ImageCatalog::open(temp_dir.path().join("meta.db")).unwrap());
        for (uuid, unlisted) in [("a", false), ("b", true), ("c", false), ("d", false)] {
            catalog.save(record(uuid, unlisted)).unwrap();
        }

        let operation = ListRecentOperation::new(catalog);
        let result = operation
            .run(ListRecentOperationRequest { limit: 2 })
            .await
            .unwrap();

        let uuids: Vec<_> = result.items.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["d", "c"]);
    }
}
