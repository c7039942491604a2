use crate::error::{Result, StashError};
use chrono::{DateTime, Duration, Months, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use ulid::Ulid;

/// Metadata for one uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub uuid: String,
    pub owner: Option<String>,
    pub added_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub unlisted: bool,
    pub delete_token: String,
    pub owner_cookie: String,
    pub recent_sequence: Option<u64>,
    pub blob_path: String,
    pub thumbnail_path: String,
}

/// How long an upload is kept before the collector reclaims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    Day,
    Month,
    Forever,
}

impl Retention {
    pub fn expires_at(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Retention::Day => Some(now + Duration::days(1)),
            Retention::Month => now.checked_add_months(Months::new(1)),
            Retention::Forever => None,
        }
    }
}

impl FromStr for Retention {
    type Err = StashError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(Retention::Day),
            "month" => Ok(Retention::Month),
            "forever" => Ok(Retention::Forever),
            other => Err(StashError::InvalidRequest(format!(
                "unknown retention: {}",
                other
            ))),
        }
    }
}

/// Fields supplied by the uploader; timestamps are stamped on save.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub uuid: String,
    pub owner: Option<String>,
    pub blob_path: String,
    pub thumbnail_path: String,
    pub unlisted: bool,
    pub retention: Retention,
    pub delete_token: String,
    pub owner_cookie: String,
}

impl ImageRecord {
    pub fn from_new(new: NewImage, now: DateTime<Utc>) -> Self {
        let now = truncate_to_second(now);
        Self {
            uuid: new.uuid,
            owner: new.owner.filter(|owner| !owner.is_empty()),
            added_at: now,
            expires_at: new.retention.expires_at(now),
            unlisted: new.unlisted,
            delete_token: new.delete_token,
            owner_cookie: new.owner_cookie,
            recent_sequence: None,
            blob_path: new.blob_path,
            thumbnail_path: new.thumbnail_path,
        }
    }

    pub fn is_owned_by(&self, cookie: &str) -> bool {
        !cookie.is_empty() && self.owner_cookie == cookie
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

pub fn new_uuid() -> String {
    Ulid::new().to_string()
}

pub fn new_delete_token() -> String {
    Ulid::new().to_string().to_ascii_lowercase()
}

/// UUIDs become key prefixes (`<uuid>:<field>`), so the separator is banned.
pub fn validate_uuid(uuid: &str) -> Result<()> {
    if uuid.is_empty() {
        return Err(StashError::InvalidRequest("uuid cannot be empty".to_string()));
    }
    if uuid.contains(':') {
        return Err(StashError::InvalidRequest(format!(
            "uuid cannot contain ':': {}",
            uuid
        )));
    }
    Ok(())
}

pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Fixed-width RFC 3339 text, so string order equals time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| truncate_to_second(ts.with_timezone(&Utc)))
}
