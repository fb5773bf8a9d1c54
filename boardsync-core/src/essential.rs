//! Singleton records every document needs: the default page and the
//! document record. Missing ones are created in the replica, never
//! overwritten.

use crate::record::{DocumentRecord, PageRecord, Record, RecordId, RecordKind};
use crate::replica::{Replica, ReplicaError};

/// Default values for the essential singletons.
#[derive(Debug, Clone, PartialEq)]
pub struct EssentialRecords {
    pub page: PageRecord,
    pub document: DocumentRecord,
}

impl Default for EssentialRecords {
    fn default() -> Self {
        Self {
            page: PageRecord {
                id: RecordId::new(RecordKind::Page, "page"),
                name: "Page 1".to_string(),
                index: "a1".to_string(),
            },
            document: DocumentRecord {
                id: RecordId::new(RecordKind::Document, "document"),
                name: String::new(),
                grid_size: 10.0,
            },
        }
    }
}

impl EssentialRecords {
    pub fn ids(&self) -> [RecordId; 2] {
        [self.page.id.clone(), self.document.id.clone()]
    }

    pub fn records(&self) -> [Record; 2] {
        [
            Record::Page(self.page.clone()),
            Record::Document(self.document.clone()),
        ]
    }

    pub fn is_essential(&self, id: &RecordId) -> bool {
        *id == self.page.id || *id == self.document.id
    }
}

/// Result of one guarantor run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnsureOutcome {
    /// Singletons that were missing and have been created.
    pub inserted: Vec<RecordId>,
    /// Replica update to broadcast; empty when nothing was inserted.
    pub update: Vec<u8>,
}

impl EnsureOutcome {
    pub fn changed(&self) -> bool {
        !self.inserted.is_empty()
    }
}

/// Make sure the essential singletons exist in the replica.
///
/// Idempotent: once both exist, further runs write nothing. Two peers that
/// create the same singleton concurrently converge on one value per id
/// after merging.
pub fn ensure_essential_records(
    replica: &Replica,
    essentials: &EssentialRecords,
) -> Result<EnsureOutcome, ReplicaError> {
    let (inserted, update) = replica.insert_missing(&essentials.records())?;
    if !inserted.is_empty() {
        log::info!("Created missing essential records: {:?}", inserted);
    }
    Ok(EnsureOutcome { inserted, update })
}
