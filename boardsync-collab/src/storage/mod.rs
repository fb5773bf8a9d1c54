//! Durable snapshot storage for rooms.
//!
//! A room persists exactly one blob: the full replica state, overwritten
//! on every save. There is no delta log; a lost update costs at most the
//! debounce window.
//!
//! ```text
//! ┌─────────────┐   full-state encode   ┌───────────────────────┐
//! │ Room actor  │ ────────────────────► │ SnapshotStore         │
//! │ (replica)   │ ◄──────────────────── │  RocksSnapshotStore   │
//! └─────────────┘   load on first join  │  MemorySnapshotStore  │
//!                                       └───────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

use thiserror::Error;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, SnapshotMetadata, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Keyed blob storage for room snapshots.
pub trait SnapshotStore: Send + Sync {
    /// The stored snapshot for `room`, if any.
    fn get(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the snapshot for `room`.
    fn put(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}
