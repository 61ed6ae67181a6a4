//! Storage modules for Telemark
//!
//! Provides content-addressed snapshot storage, the per-device SQLite index
//! and the persisted device catalog.

pub mod canonical;
pub mod catalog_store;
pub mod content_store;
pub mod index_store;

pub use canonical::{canonical_json, snapshot_hash};
pub use catalog_store::DeviceCatalog;
pub use content_store::{ContentStore, PutSnapshotResult, compute_hash, validate_hash};
pub use index_store::IndexStore;
