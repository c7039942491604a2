//! Storage modules for Imgstash
//!
//! The transactional key-value store, the record codec, the two derived
//! indexes and the blob store interface.

pub mod blob_store;
pub mod codec;
pub mod expiration_index;
pub mod metadata_store;
pub mod recent_index;

pub use blob_store::{BlobDeleteOutcome, BlobStore, FsBlobStore, MemoryBlobStore};
pub use expiration_index::{ExpirationBucket, ExpirationIndex, expiration_key};
pub use metadata_store::{Bucket, KeyValue, MetadataStore, ScanOrder, StoreTx};
pub use recent_index::{RecentEntry, RecentIndex};

/// Primary records, keyed `<uuid>:<field>`.
pub const IMAGE_BUCKET: &str = "images";
/// Listed uploads, keyed by big-endian sequence.
pub const RECENT_BUCKET: &str = "recent";
/// Expiring uploads, keyed by expiry timestamp text.
pub const EXPIRATION_BUCKET: &str = "expiration";
