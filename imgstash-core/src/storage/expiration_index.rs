use crate::error::Result;
use crate::record::format_timestamp;
use crate::storage::EXPIRATION_BUCKET;
use crate::storage::metadata_store::{ScanOrder, StoreTx};
use chrono::{DateTime, Utc};
use std::ops::ControlFlow;

/// Uuids sharing one expiration key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationBucket {
    pub key: String,
    pub uuids: Vec<String>,
}

/// Bucket key for an expiry time: second-granularity RFC 3339 text.
pub fn expiration_key(expires_at: DateTime<Utc>) -> String {
    format_timestamp(expires_at)
}

/// Members are stored as a JSON array. Comma-joined lists written by older
/// deployments are still accepted on read.
pub fn decode_members(value: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(value);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if text.starts_with('[') {
        match serde_json::from_str::<Vec<String>>(text) {
            Ok(members) => return members,
            Err(error) => {
                tracing::warn!("Unreadable expiration bucket value {:?}: {}", text, error);
                return Vec::new();
            }
        }
    }

    text.split(',')
        .map(str::trim)
        .filter(|member| !member.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn encode_members(members: &[String]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(members)?)
}

pub struct ExpirationIndex<'a, 'conn> {
    tx: &'a StoreTx<'conn>,
}

impl<'a, 'conn> ExpirationIndex<'a, 'conn> {
    pub fn new(tx: &'a StoreTx<'conn>) -> Self {
        Self { tx }
    }

    pub fn members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .tx
            .bucket(EXPIRATION_BUCKET)
            .get(key.as_bytes())?
            .map(|value| decode_members(&value))
            .unwrap_or_default())
    }

    pub(crate) fn add_member(&self, key: &str, uuid: &str) -> Result<()> {
        let mut members = self.members(key)?;
        if members.iter().any(|member| member == uuid) {
            return Ok(());
        }
        members.push(uuid.to_string());
        self.tx
            .bucket(EXPIRATION_BUCKET)
            .put(key.as_bytes(), &encode_members(&members)?)
    }

    /// Returns whether `uuid` was a member. Emptied buckets are removed.
    pub(crate) fn remove_member(&self, key: &str, uuid: &str) -> Result<bool> {
        let mut members = self.members(key)?;
        let before = members.len();
        members.retain(|member| member != uuid);
        if members.len() == before {
            return Ok(false);
        }

        let bucket = self.tx.bucket(EXPIRATION_BUCKET);
        if members.is_empty() {
            bucket.delete(key.as_bytes())?;
        } else {
            bucket.put(key.as_bytes(), &encode_members(&members)?)?;
        }
        Ok(true)
    }

    pub(crate) fn remove_bucket(&self, key: &str) -> Result<bool> {
        self.tx.bucket(EXPIRATION_BUCKET).delete(key.as_bytes())
    }

    /// Buckets keyed strictly before `now`, oldest first, holding at most
    /// `limit` uuids in total. The last bucket may be cut short; its
    /// remaining members are picked up by a later scan.
    pub fn scan_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExpirationBucket>> {
        let mut due = Vec::new();
        if limit == 0 {
            return Ok(due);
        }

        let now_key = expiration_key(now);
        let mut remaining = limit;
        self.tx.bucket(EXPIRATION_BUCKET).for_each_in_range(
            None,
            Some(now_key.as_bytes()),
            ScanOrder::Ascending,
            |key, value| {
                let mut uuids = decode_members(value);
                uuids.truncate(remaining);
                remaining -= uuids.len();
                due.push(ExpirationBucket {
                    key: String::from_utf8_lossy(key).into_owned(),
                    uuids,
                });

                if remaining == 0 {
                    Ok(ControlFlow::Break(()))
                } else {
                    Ok(ControlFlow::Continue(()))
                }
            },
        )?;

        Ok(due)
    }
}
