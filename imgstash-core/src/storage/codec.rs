//! Flat `<uuid>:<field>` encoding of [`ImageRecord`].

use crate::error::Result;
use crate::record::{ImageRecord, format_timestamp, parse_timestamp};
use crate::storage::metadata_store::KeyValue;
use chrono::{DateTime, Utc};

pub const FIELD_PATH: &str = "path";
pub const FIELD_THUMB_PATH: &str = "thumbpath";
pub const FIELD_ADDED: &str = "added";
pub const FIELD_EXPIRES: &str = "expires";
pub const FIELD_DELETE: &str = "delete";
pub const FIELD_UNLISTED: &str = "unlisted";
pub const FIELD_COOKIE: &str = "cookie";
pub const FIELD_OWNER: &str = "owner";
pub const FIELD_RECENT_KEY: &str = "recentkey";

pub fn field_key(uuid: &str, field: &str) -> Vec<u8> {
    format!("{}:{}", uuid, field).into_bytes()
}

/// Prefix shared by every key of one record.
pub fn record_prefix(uuid: &str) -> Vec<u8> {
    format!("{}:", uuid).into_bytes()
}

/// Recent index keys are big-endian so byte order equals numeric order.
pub fn encode_sequence(sequence: u64) -> Vec<u8> {
    sequence.to_be_bytes().to_vec()
}

pub fn decode_sequence(bytes: &[u8]) -> Option<u64> {
    let array: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(array))
}

pub fn encode(record: &ImageRecord) -> Vec<KeyValue> {
    let uuid = record.uuid.as_str();
    vec![
        (field_key(uuid, FIELD_PATH), record.blob_path.clone().into_bytes()),
        (
            field_key(uuid, FIELD_THUMB_PATH),
            record.thumbnail_path.clone().into_bytes(),
        ),
        (
            field_key(uuid, FIELD_ADDED),
            format_timestamp(record.added_at).into_bytes(),
        ),
        (
            field_key(uuid, FIELD_EXPIRES),
            record
                .expires_at
                .map(format_timestamp)
                .unwrap_or_default()
                .into_bytes(),
        ),
        (
            field_key(uuid, FIELD_DELETE),
            record.delete_token.clone().into_bytes(),
        ),
        (
            field_key(uuid, FIELD_UNLISTED),
            record.unlisted.to_string().into_bytes(),
        ),
        (
            field_key(uuid, FIELD_COOKIE),
            record.owner_cookie.clone().into_bytes(),
        ),
        (
            field_key(uuid, FIELD_OWNER),
            record.owner.clone().unwrap_or_default().into_bytes(),
        ),
        (
            field_key(uuid, FIELD_RECENT_KEY),
            record
                .recent_sequence
                .map(encode_sequence)
                .unwrap_or_default(),
        ),
    ]
}

/// Rebuild a record from its field keys.
///
/// A record exists when its `added` key exists. Every other field decodes
/// leniently: missing text becomes empty, an unreadable `unlisted` flag
/// becomes `true` so a damaged record is never shown publicly.
pub fn decode<F>(uuid: &str, mut lookup: F) -> Result<Option<ImageRecord>>
where
    F: FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
{
    let Some(added) = lookup(&field_key(uuid, FIELD_ADDED))? else {
        return Ok(None);
    };

    let mut text = |field: &str| -> Result<String> {
        Ok(lookup(&field_key(uuid, field))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default())
    };

    let added_text = String::from_utf8_lossy(&added).into_owned();
    let added_at = match parse_timestamp(&added_text) {
        Some(ts) => ts,
        None => {
            tracing::warn!("Unreadable added timestamp for {}: {:?}", uuid, added_text);
            DateTime::<Utc>::UNIX_EPOCH
        }
    };

    let expires_text = text(FIELD_EXPIRES)?;
    let expires_at = if expires_text.is_empty() {
        None
    } else {
        let parsed = parse_timestamp(&expires_text);
        if parsed.is_none() {
            tracing::warn!("Unreadable expiry for {}: {:?}", uuid, expires_text);
        }
        parsed
    };

    let unlisted = text(FIELD_UNLISTED)?.parse::<bool>().unwrap_or(true);
    let owner = Some(text(FIELD_OWNER)?).filter(|owner| !owner.is_empty());
    let blob_path = text(FIELD_PATH)?;
    let thumbnail_path = text(FIELD_THUMB_PATH)?;
    let delete_token = text(FIELD_DELETE)?;
    let owner_cookie = text(FIELD_COOKIE)?;

    let recent_sequence = lookup(&field_key(uuid, FIELD_RECENT_KEY))?
        .as_deref()
        .and_then(decode_sequence);

    Ok(Some(ImageRecord {
        uuid: uuid.to_string(),
        owner,
        added_at,
        expires_at,
        unlisted,
        delete_token,
        owner_cookie,
        recent_sequence,
        blob_path,
        thumbnail_path,
    }))
}
