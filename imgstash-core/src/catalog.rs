//! Image catalog: the only mutation surface over the metadata store.
//!
//! Records and both indexes are always written and removed together, inside
//! a single store transaction, by the methods on [`ImageCatalog`]. The index
//! mutators are crate-private so nothing else can touch one namespace
//! without the others.

use crate::error::{Result, StashError};
use crate::record::{ImageRecord, truncate_to_second, validate_uuid};
use crate::storage::codec::{self, field_key, record_prefix};
use crate::storage::{
    ExpirationIndex, IMAGE_BUCKET, MetadataStore, RecentIndex, StoreTx, expiration_key,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(ImageRecord),
    NotFound,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Original,
    Thumbnail,
}

/// A blob the collector wants removed once its transaction has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDeletion {
    pub uuid: String,
    pub path: String,
    pub kind: BlobKind,
}

/// Metadata changes made by one sweep, plus the blob deletions they imply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    pub recent_trimmed: usize,
    pub expired: Vec<String>,
    pub repaired: usize,
    pub blob_deletions: Vec<BlobDeletion>,
}

impl SweepPlan {
    fn request(&mut self, uuid: &str, path: &str, kind: BlobKind) {
        if path.is_empty() || self.blob_deletions.iter().any(|d| d.path == path) {
            return;
        }
        self.blob_deletions.push(BlobDeletion {
            uuid: uuid.to_string(),
            path: path.to_string(),
            kind,
        });
    }
}

pub struct ImageCatalog {
    store: MetadataStore,
}

impl ImageCatalog {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(MetadataStore::open(db_path)?))
    }

    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    pub fn db_path(&self) -> &Path {
        self.store.db_path()
    }

    /// Read-only access to the underlying namespaces.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T>,
    {
        self.store.view(f)
    }

    /// Persist a new record together with its index entries.
    ///
    /// Listed records get the next recent sequence, which is written back
    /// into the returned record. Timestamps are stored at second precision,
    /// so the returned record is truncated the same way.
    pub fn save(&self, mut record: ImageRecord) -> Result<ImageRecord> {
        validate_uuid(&record.uuid)?;
        record.added_at = truncate_to_second(record.added_at);
        record.expires_at = record.expires_at.map(truncate_to_second);

        self.store.update(move |tx| {
            let images = tx.bucket(IMAGE_BUCKET);
            if images.contains(&field_key(&record.uuid, codec::FIELD_ADDED))? {
                return Err(StashError::AlreadyExists(record.uuid.clone()));
            }

            record.recent_sequence = if record.unlisted {
                None
            } else {
                Some(RecentIndex::new(tx).append(&record.uuid)?)
            };

            if let Some(expires_at) = record.expires_at {
                ExpirationIndex::new(tx).add_member(&expiration_key(expires_at), &record.uuid)?;
            }

            for (key, value) in codec::encode(&record) {
                images.put(&key, &value)?;
            }

            tracing::debug!(
                "Saved image {} (listed={}, expires={:?})",
                record.uuid,
                !record.unlisted,
                record.expires_at
            );
            Ok(record)
        })
    }

    pub fn load(&self, uuid: &str) -> Result<Option<ImageRecord>> {
        if validate_uuid(uuid).is_err() {
            return Ok(None);
        }
        self.store.view(|tx| load_in_tx(tx, uuid))
    }

    /// Up to `n` listed uuids, newest first.
    pub fn list_last(&self, n: usize) -> Result<Vec<String>> {
        self.store.view(|tx| RecentIndex::new(tx).list_last(n))
    }

    /// Remove a record and every index entry pointing at it.
    ///
    /// Returns the removed record, or `None` when nothing was stored under
    /// `uuid`.
    pub fn delete_record(&self, uuid: &str) -> Result<Option<ImageRecord>> {
        if validate_uuid(uuid).is_err() {
            return Ok(None);
        }
        self.store.update(|tx| {
            let Some(record) = load_in_tx(tx, uuid)? else {
                return Ok(None);
            };
            delete_in_tx(tx, &record)?;
            Ok(Some(record))
        })
    }

    /// Delete `uuid` only if `token` matches its delete token.
    pub fn delete_with_token(&self, uuid: &str, token: &str) -> Result<DeleteOutcome> {
        if validate_uuid(uuid).is_err() {
            return Ok(DeleteOutcome::NotFound);
        }
        self.store.update(|tx| {
            let Some(record) = load_in_tx(tx, uuid)? else {
                return Ok(DeleteOutcome::NotFound);
            };
            if !tokens_match(&record.delete_token, token) {
                tracing::warn!("Rejected delete of {}: token mismatch", uuid);
                return Ok(DeleteOutcome::Forbidden);
            }
            delete_in_tx(tx, &record)?;
            Ok(DeleteOutcome::Deleted(record))
        })
    }

    /// One collector pass over both indexes, in a single transaction.
    ///
    /// The newest `recent_limit` recent entries are kept; older ones are
    /// dropped and their thumbnails queued for deletion. Up to `gc_limit`
    /// uuids from buckets due before `now` are deleted through the same path
    /// as [`ImageCatalog::delete_record`] and both of their blobs queued.
    /// Index entries pointing at missing records are removed and counted as
    /// repaired.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        gc_limit: usize,
        recent_limit: usize,
    ) -> Result<SweepPlan> {
        self.store.update(|tx| {
            let mut plan = SweepPlan::default();
            trim_recent(tx, recent_limit, &mut plan)?;
            expire_due(tx, now, gc_limit, &mut plan)?;
            Ok(plan)
        })
    }
}

fn load_in_tx(tx: &StoreTx<'_>, uuid: &str) -> Result<Option<ImageRecord>> {
    let images = tx.bucket(IMAGE_BUCKET);
    codec::decode(uuid, |key| images.get(key))
}

fn delete_in_tx(tx: &StoreTx<'_>, record: &ImageRecord) -> Result<()> {
    let removed = tx
        .bucket(IMAGE_BUCKET)
        .delete_prefix(&record_prefix(&record.uuid))?;

    if let Some(sequence) = record.recent_sequence {
        let recent = RecentIndex::new(tx);
        if recent.get(sequence)?.as_deref() == Some(record.uuid.as_str()) {
            recent.remove(sequence)?;
        }
    }

    if let Some(expires_at) = record.expires_at {
        ExpirationIndex::new(tx).remove_member(&expiration_key(expires_at), &record.uuid)?;
    }

    tracing::debug!("Deleted image {} ({} keys)", record.uuid, removed);
    Ok(())
}

fn trim_recent(tx: &StoreTx<'_>, keep: usize, plan: &mut SweepPlan) -> Result<()> {
    let recent = RecentIndex::new(tx);

    for entry in recent.beyond(keep)? {
        recent.remove(entry.sequence)?;
        plan.recent_trimmed += 1;

        match load_in_tx(tx, &entry.uuid)? {
            Some(record) => plan.request(&record.uuid, &record.thumbnail_path, BlobKind::Thumbnail),
            None => {
                tracing::warn!(
                    "Recent entry {} points at missing image {}",
                    entry.sequence,
                    entry.uuid
                );
                plan.repaired += 1;
            }
        }
    }

    Ok(())
}

fn expire_due(
    tx: &StoreTx<'_>,
    now: DateTime<Utc>,
    limit: usize,
    plan: &mut SweepPlan,
) -> Result<()> {
    let expiration = ExpirationIndex::new(tx);

    for bucket in expiration.scan_due(now, limit)? {
        if bucket.uuids.is_empty() {
            expiration.remove_bucket(&bucket.key)?;
            continue;
        }

        let mut seen = HashSet::new();
        for uuid in bucket.uuids {
            if !seen.insert(uuid.clone()) {
                continue;
            }
            expiration.remove_member(&bucket.key, &uuid)?;

            let record = if validate_uuid(&uuid).is_ok() {
                load_in_tx(tx, &uuid)?
            } else {
                None
            };

            match record {
                Some(record) => {
                    delete_in_tx(tx, &record)?;
                    tracing::info!("GC expired image {}", uuid);
                    plan.request(&uuid, &record.blob_path, BlobKind::Original);
                    plan.request(&uuid, &record.thumbnail_path, BlobKind::Thumbnail);
                    plan.expired.push(uuid);
                }
                None => {
                    tracing::warn!(
                        "Expiration bucket {} points at missing image {}; removing entry",
                        bucket.key,
                        uuid
                    );
                    plan.repaired += 1;
                }
            }
        }
    }

    Ok(())
}

/// Compares every byte regardless of where the first difference is.
fn tokens_match(expected: &str, provided: &str) -> bool {
    if expected.is_empty() || expected.len() != provided.len() {
        return false;
    }
    expected
        .bytes()
        .zip(provided.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EXPIRATION_BUCKET, RECENT_BUCKET};
    use chrono::{Duration, TimeZone};

    fn open_catalog() -> (tempfile::TempDir, ImageCatalog) {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = ImageCatalog::open(temp_dir.path().join("meta.db")).unwrap();
        (temp_dir, catalog)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(uuid: &str, unlisted: bool, expires_at: Option<DateTime<Utc>>) -> ImageRecord {
        ImageRecord {
            uuid: uuid.to_string(),
            owner: None,
            added_at: now() - Duration::days(2),
            expires_at,
            unlisted,
            delete_token: format!("{}-token", uuid),
            owner_cookie: "cookie".to_string(),
            recent_sequence: None,
            blob_path: format!("/data/{}", uuid),
            thumbnail_path: format!("/data/{}_thumb.png", uuid),
        }
    }

    fn namespace_sizes(catalog: &ImageCatalog) -> (usize, usize, usize) {
        catalog
            .view(|tx| {
                Ok((
                    tx.bucket(IMAGE_BUCKET).len()?,
                    tx.bucket(RECENT_BUCKET).len()?,
                    tx.bucket(EXPIRATION_BUCKET).len()?,
                ))
            })
            .unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, catalog) = open_catalog();

        let listed = catalog.save(record("a", false, None)).unwrap();
        let hidden = catalog.save(record("b", true, None)).unwrap();

        assert_eq!(listed.recent_sequence, Some(1));
        assert_eq!(hidden.recent_sequence, None);
        assert_eq!(catalog.load("a").unwrap(), Some(listed));
        assert_eq!(catalog.load("b").unwrap(), Some(hidden));
        assert_eq!(catalog.load("missing").unwrap(), None);
        assert_eq!(catalog.list_last(5).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_save_returns_what_load_reads_back() {
        let (_dir, catalog) = open_catalog();

        let mut fresh = record("fresh", false, Some(Utc::now() + Duration::hours(1)));
        fresh.added_at = Utc::now();
        let saved = catalog.save(fresh).unwrap();

        assert_eq!(saved.added_at.timestamp_subsec_nanos(), 0);
        assert_eq!(catalog.load("fresh").unwrap(), Some(saved));
    }

    #[test]
    fn test_save_rejects_duplicate_uuid() {
        let (_dir, catalog) = open_catalog();

        catalog.save(record("a", false, None)).unwrap();
        let sizes = namespace_sizes(&catalog);

        let result = catalog.save(record("a", false, Some(now())));
        assert!(matches!(result, Err(StashError::AlreadyExists(_))));
        assert_eq!(namespace_sizes(&catalog), sizes);
    }

    #[test]
    fn test_save_rejects_separator_in_uuid() {
        let (_dir, catalog) = open_catalog();
        let result = catalog.save(record("a:b", false, None));
        assert!(matches!(result, Err(StashError::InvalidRequest(_))));
    }

    #[test]
    fn test_delete_removes_every_namespace_entry() {
        let (_dir, catalog) = open_catalog();

        catalog
            .save(record("a", false, Some(now() + Duration::days(1))))
            .unwrap();
        catalog
            .save(record("b", false, Some(now() + Duration::days(1))))
            .unwrap();

        let deleted = catalog.delete_record("a").unwrap();
        assert_eq!(deleted.map(|r| r.uuid), Some("a".to_string()));

        assert_eq!(catalog.load("a").unwrap(), None);
        assert_eq!(catalog.list_last(5).unwrap(), vec!["b"]);
        let members = catalog
            .view(|tx| {
                ExpirationIndex::new(tx).members(&expiration_key(now() + Duration::days(1)))
            })
            .unwrap();
        assert_eq!(members, vec!["b"]);
    }

    #[test]
    fn test_delete_twice_is_idempotent() {
        let (_dir, catalog) = open_catalog();

        catalog.save(record("a", false, Some(now()))).unwrap();
        assert!(catalog.delete_record("a").unwrap().is_some());
        assert_eq!(namespace_sizes(&catalog), (0, 0, 0));

        assert_eq!(catalog.delete_record("a").unwrap(), None);
        assert_eq!(catalog.delete_with_token("a", "a-token").unwrap(), DeleteOutcome::NotFound);
        assert_eq!(namespace_sizes(&catalog), (0, 0, 0));
    }

    #[test]
    fn test_delete_with_wrong_token_changes_nothing() {
        let (_dir, catalog) = open_catalog();

        catalog
            .save(record("a", false, Some(now() + Duration::hours(1))))
            .unwrap();
        let sizes = namespace_sizes(&catalog);

        assert_eq!(catalog.delete_with_token("a", "nope").unwrap(), DeleteOutcome::Forbidden);
        assert_eq!(catalog.delete_with_token("a", "").unwrap(), DeleteOutcome::Forbidden);
        assert_eq!(namespace_sizes(&catalog), sizes);

        let outcome = catalog.delete_with_token("a", "a-token").unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted(r) if r.uuid == "a"));
        assert_eq!(namespace_sizes(&catalog), (0, 0, 0));
    }

    #[test]
    fn test_sweep_trims_recent_beyond_limit() {
        let (_dir, catalog) = open_catalog();

        for uuid in ["u1", "u2", "u3", "u4", "u5", "u6"] {
            catalog.save(record(uuid, false, None)).unwrap();
        }

        let plan = catalog.sweep(now(), 100, 5).unwrap();

        assert_eq!(plan.recent_trimmed, 1);
        assert_eq!(
            plan.blob_deletions,
            vec![BlobDeletion {
                uuid: "u1".to_string(),
                path: "/data/u1_thumb.png".to_string(),
                kind: BlobKind::Thumbnail,
            }]
        );
        assert_eq!(catalog.list_last(10).unwrap(), vec!["u6", "u5", "u4", "u3", "u2"]);
        // The record itself is kept; only its recent thumbnail goes.
        assert!(catalog.load("u1").unwrap().is_some());

        let again = catalog.sweep(now(), 100, 5).unwrap();
        assert_eq!(again, SweepPlan::default());
    }

    #[test]
    fn test_sweep_deletes_expired_records() {
        let (_dir, catalog) = open_catalog();

        catalog
            .save(record("old", false, Some(now() - Duration::minutes(1))))
            .unwrap();
        catalog
            .save(record("fresh", true, Some(now() + Duration::minutes(1))))
            .unwrap();

        let plan = catalog.sweep(now(), 1, 5).unwrap();

        assert_eq!(plan.expired, vec!["old"]);
        assert_eq!(plan.repaired, 0);
        let paths: Vec<_> = plan.blob_deletions.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["/data/old", "/data/old_thumb.png"]);

        assert_eq!(catalog.load("old").unwrap(), None);
        assert!(catalog.list_last(5).unwrap().is_empty());
        assert!(catalog.load("fresh").unwrap().is_some());
        assert_eq!(namespace_sizes(&catalog).2, 1);
    }

    #[test]
    fn test_sweep_respects_gc_limit() {
        let (_dir, catalog) = open_catalog();
        let past = now() - Duration::hours(1);

        for uuid in ["a", "b", "c"] {
            catalog.save(record(uuid, true, Some(past))).unwrap();
        }

        assert_eq!(catalog.sweep(now(), 2, 5).unwrap().expired, vec!["a", "b"]);
        assert!(catalog.load("c").unwrap().is_some());
        assert_eq!(catalog.sweep(now(), 2, 5).unwrap().expired, vec!["c"]);
        assert_eq!(namespace_sizes(&catalog), (0, 0, 0));
    }

    #[test]
    fn test_sweep_repairs_dangling_expiration_entries() {
        let (_dir, catalog) = open_catalog();
        let key = expiration_key(now() - Duration::hours(1));

        catalog
            .store
            .update(|tx| ExpirationIndex::new(tx).add_member(&key, "ghost"))
            .unwrap();

        let plan = catalog.sweep(now(), 10, 5).unwrap();
        assert_eq!(plan.repaired, 1);
        assert!(plan.expired.is_empty());
        assert!(plan.blob_deletions.is_empty());
        assert_eq!(namespace_sizes(&catalog), (0, 0, 0));
    }

    #[test]
    fn test_sweep_requests_each_blob_once() {
        let (_dir, catalog) = open_catalog();

        // Oldest listed record is both past the recent bound and expired.
        catalog
            .save(record("old", false, Some(now() - Duration::hours(1))))
            .unwrap();
        for uuid in ["n1", "n2", "n3", "n4", "n5"] {
            catalog.save(record(uuid, false, None)).unwrap();
        }

        let plan = catalog.sweep(now(), 10, 5).unwrap();
        let thumbs = plan
            .blob_deletions
            .iter()
            .filter(|d| d.path == "/data/old_thumb.png")
            .count();
        assert_eq!(thumbs, 1);
        assert_eq!(plan.blob_deletions.len(), 2);
        assert_eq!(plan.expired, vec!["old"]);
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "ab"));
        assert!(!tokens_match("", ""));
    }
}
