//! Durable storage for the knowledge engine.
//!
//! One `redb` database file holds four tables: canonical object bytes
//! keyed by content hash, per-blob metadata (the reverse type index),
//! version chains keyed by id hash, and a quarantine for corrupt blobs.
//! Layers stack bottom-up: [`ObjectStore`] (content-addressed blobs) →
//! [`VersionedStore`] (id-hash chains with CAS semantics) →
//! [`ChannelLog`] (append-only per-writer entry chains).

mod channel;
mod db;
mod error;
mod maintenance;
mod objects;
mod versioned;

pub use channel::{ChannelLog, EntryIter, TopicIter};
pub use db::StoreDb;
pub use error::StoreError;
pub use maintenance::{orphan_sweep, store_stats, KindStats, StoreStats};
pub use objects::{now_ms, ObjectMeta, ObjectStore};
pub use versioned::{PutVersioned, VersionedStore, VersionRecord};
