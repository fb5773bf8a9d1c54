//! In-process snapshot store, used when no storage path is configured.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{SnapshotStore, StoreError};

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rooms with a stored snapshot.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().get(room).cloned())
    }

    fn put(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.lock().insert(room.to_string(), snapshot.to_vec());
        Ok(())
    }
}
