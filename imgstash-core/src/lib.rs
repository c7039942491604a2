//! Imgstash Core - metadata catalog and garbage collector for an image host
//!
//! - Image records stored as `<uuid>:<field>` keys in an embedded
//!   transactional key-value store (SQLite)
//! - A sequence-keyed index of recently listed uploads
//! - A timestamp-keyed index of expiring uploads
//! - A background collector that trims the recent index and reclaims
//!   expired uploads together with their blobs

pub mod catalog;
pub mod error;
pub mod gc;
pub mod operations;
pub mod record;
pub mod storage;

pub use catalog::{BlobDeletion, BlobKind, DeleteOutcome, ImageCatalog, SweepPlan};
pub use error::{Result, StashError};
pub use gc::{
    CollectorState, CollectorStatus, GarbageCollector, GcConfig, GcHandle, DEFAULT_GC_INTERVAL_SECS,
    DEFAULT_GC_LIMIT, RECENT_LIMIT,
};
pub use record::{ImageRecord, NewImage, Retention, new_delete_token, new_uuid};
pub use storage::{
    BlobDeleteOutcome, BlobStore, FsBlobStore, MemoryBlobStore, MetadataStore,
};
