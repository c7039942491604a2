use crate::error::Result;
use crate::storage::codec::{decode_sequence, encode_sequence};
use crate::storage::metadata_store::{ScanOrder, StoreTx};
use crate::storage::RECENT_BUCKET;
use std::ops::ControlFlow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentEntry {
    pub sequence: u64,
    pub uuid: String,
}

/// Sequence-ordered list of publicly listed uploads.
///
/// Storage is unbounded; the collector trims entries past the display
/// bound.
pub struct RecentIndex<'a, 'conn> {
    tx: &'a StoreTx<'conn>,
}

impl<'a, 'conn> RecentIndex<'a, 'conn> {
    pub fn new(tx: &'a StoreTx<'conn>) -> Self {
        Self { tx }
    }

    pub(crate) fn append(&self, uuid: &str) -> Result<u64> {
        let bucket = self.tx.bucket(RECENT_BUCKET);
        let sequence = bucket.next_sequence()?;
        bucket.put(&encode_sequence(sequence), uuid.as_bytes())?;
        Ok(sequence)
    }

    /// Up to `n` uuids, most recent first.
    pub fn list_last(&self, n: usize) -> Result<Vec<String>> {
        Ok(self
            .newest_first(0, n)?
            .into_iter()
            .map(|entry| entry.uuid)
            .collect())
    }

    pub fn get(&self, sequence: u64) -> Result<Option<String>> {
        Ok(self
            .tx
            .bucket(RECENT_BUCKET)
            .get(&encode_sequence(sequence))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Every entry after the newest `keep`, newest first.
    pub fn beyond(&self, keep: usize) -> Result<Vec<RecentEntry>> {
        self.newest_first(keep, usize::MAX)
    }

    pub(crate) fn remove(&self, sequence: u64) -> Result<bool> {
        self.tx.bucket(RECENT_BUCKET).delete(&encode_sequence(sequence))
    }

    pub fn len(&self) -> Result<usize> {
        self.tx.bucket(RECENT_BUCKET).len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn newest_first(&self, skip: usize, take: usize) -> Result<Vec<RecentEntry>> {
        let mut entries = Vec::new();
        if take == 0 {
            return Ok(entries);
        }

        let mut seen = 0usize;
        self.tx.bucket(RECENT_BUCKET).for_each_in_range(
            None,
            None,
            ScanOrder::Descending,
            |key, value| {
                seen += 1;
                if seen <= skip {
                    return Ok(ControlFlow::Continue(()));
                }

                match decode_sequence(key) {
                    Some(sequence) => entries.push(RecentEntry {
                        sequence,
                        uuid: String::from_utf8_lossy(value).into_owned(),
                    }),
                    None => tracing::warn!("Skipping malformed recent key {:?}", key),
                }

                if entries.len() >= take {
                    Ok(ControlFlow::Break(()))
                } else {
                    Ok(ControlFlow::Continue(()))
                }
            },
        )?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MetadataStore;

    fn open_store() -> (tempfile::TempDir, MetadataStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(temp_dir.path().join("meta.db")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_list_last_is_newest_first() {
        let (_dir, store) = open_store();

        for uuid in ["a", "b", "c", "d"] {
            store.update(|tx| RecentIndex::new(tx).append(uuid)).unwrap();
        }

        store
            .view(|tx| {
                let index = RecentIndex::new(tx);
                assert_eq!(index.list_last(2)?, vec!["d", "c"]);
                assert_eq!(index.list_last(10)?, vec!["d", "c", "b", "a"]);
                assert!(index.list_last(0)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sequences_are_never_reused() {
        let (_dir, store) = open_store();

        let first = store.update(|tx| RecentIndex::new(tx).append("a")).unwrap();
        store
            .update(|tx| RecentIndex::new(tx).remove(first))
            .unwrap();
        let second = store.update(|tx| RecentIndex::new(tx).append("b")).unwrap();

        assert!(second > first);
        let entries = store.view(|tx| RecentIndex::new(tx).beyond(0)).unwrap();
        assert_eq!(
            entries,
            vec![RecentEntry {
                sequence: second,
                uuid: "b".to_string()
            }]
        );
    }

    #[test]
    fn test_beyond_skips_newest() {
        let (_dir, store) = open_store();

        store
            .update(|tx| {
                let index = RecentIndex::new(tx);
                for uuid in ["a", "b", "c"] {
                    index.append(uuid)?;
                }
                Ok(())
            })
            .unwrap();

        let older = store.view(|tx| RecentIndex::new(tx).beyond(1)).unwrap();
        let uuids: Vec<_> = older.into_iter().map(|entry| entry.uuid).collect();
        assert_eq!(uuids, vec!["b", "a"]);

        let none = store.view(|tx| RecentIndex::new(tx).beyond(5)).unwrap();
        assert!(none.is_empty());
    }
}
