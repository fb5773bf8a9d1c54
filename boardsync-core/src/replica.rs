//! CRDT replica of the document-scoped records.
//!
//! Records live in one yrs map (`records`), keyed by record id, each value
//! the record's JSON. Local writes are tagged with a dedicated transaction
//! origin so the bridge can recognise its own echoes.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use yrs::types::EntryChange;
use yrs::types::{Map, MapRef};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Observable, Origin, Out, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::record::{Record, RecordError, RecordId};

/// Name of the shared map holding every replicated record.
pub const RECORDS_MAP: &str = "records";

const LOCAL_ORIGIN: &str = "boardsync.local";
const REMOTE_ORIGIN: &str = "boardsync.remote";

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("replica entry '{0}' is not a record string")]
    UnexpectedValue(String),
    #[error("replica entry '{key}' holds record '{id}'")]
    KeyMismatch { key: String, id: RecordId },
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl From<yrs::encoding::read::Error> for ReplicaError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ReplicaError::Decode(e.to_string())
    }
}

/// Which side produced a replica transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written through [`Replica::write_local`] or [`Replica::insert_missing`].
    Local,
    /// Applied from a peer or a snapshot.
    Remote,
}

/// Keys touched by one replica transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaChange {
    pub origin: ChangeOrigin,
    pub added: Vec<RecordId>,
    pub updated: Vec<RecordId>,
    pub removed: Vec<RecordId>,
}

impl ReplicaChange {
    fn new(origin: ChangeOrigin) -> Self {
        Self {
            origin,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Receives one [`ReplicaChange`] per committed transaction touching the
/// records map. Dropping it detaches the observer.
pub struct ReplicaObserver {
    rx: mpsc::UnboundedReceiver<ReplicaChange>,
    _subscription: Subscription,
}

impl ReplicaObserver {
    /// All changes observed since the last drain, in commit order.
    pub fn drain(&mut self) -> Vec<ReplicaChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.rx.try_recv() {
            changes.push(change);
        }
        changes
    }
}

/// A yrs document holding the replicated records.
pub struct Replica {
    doc: Doc,
    records: MapRef,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        let doc = Doc::new();
        let records = doc.get_or_insert_map(RECORDS_MAP);
        Self { doc, records }
    }

    /// Build a replica from a full-state update (a persisted snapshot).
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        replica.apply_remote(snapshot)?;
        Ok(replica)
    }

    /// Attach an observer to the records map.
    pub fn observe(&self) -> ReplicaObserver {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = Origin::from(LOCAL_ORIGIN);
        let subscription = self.records.observe(move |txn, event| {
            let origin = if txn.origin() == Some(&local) {
                ChangeOrigin::Local
            } else {
                ChangeOrigin::Remote
            };
            let mut change = ReplicaChange::new(origin);
            for (key, entry) in event.keys(txn) {
                let id = match RecordId::parse(key) {
                    Ok(id) => id,
                    Err(e) => {
                        log::warn!("Ignoring replica key: {}", e);
                        continue;
                    }
                };
                match entry {
                    EntryChange::Inserted(_) => change.added.push(id),
                    EntryChange::Updated(_, _) => change.updated.push(id),
                    EntryChange::Removed(_) => change.removed.push(id),
                }
            }
            change.added.sort();
            change.updated.sort();
            change.removed.sort();
            if !change.is_empty() {
                let _ = tx.send(change);
            }
        });
        ReplicaObserver {
            rx,
            _subscription: subscription,
        }
    }

    pub fn get(&self, id: &RecordId) -> Result<Option<Record>, ReplicaError> {
        let txn = yrs::Transact::transact(&self.doc);
        self.records
            .get(&txn, id.as_str())
            .map(|value| decode_entry(id.as_str(), value))
            .transpose()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        let txn = yrs::Transact::transact(&self.doc);
        self.records.contains_key(&txn, id.as_str())
    }

    pub fn len(&self) -> usize {
        let txn = yrs::Transact::transact(&self.doc);
        self.records.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every decodable record, sorted by id, plus the number of entries
    /// that failed to decode.
    pub fn records(&self) -> (Vec<Record>, usize) {
        let txn = yrs::Transact::transact(&self.doc);
        let mut records = Vec::new();
        let mut invalid = 0;
        for (key, value) in self.records.iter(&txn) {
            match decode_entry(key, value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!("Skipping replica entry '{}': {}", key, e);
                    invalid += 1;
                }
            }
        }
        records.sort_by(|a, b| a.id().cmp(b.id()));
        (records, invalid)
    }

    /// Write puts and removals as one local transaction and return the
    /// update to broadcast. Returns an empty vector when there is nothing
    /// to write.
    pub fn write_local(&self, puts: &[Record], removes: &[RecordId]) -> Result<Vec<u8>, ReplicaError> {
        if puts.is_empty() && removes.is_empty() {
            return Ok(Vec::new());
        }
        let encoded = puts
            .iter()
            .map(|record| record.to_json().map(|json| (record.id().as_str(), json)))
            .collect::<Result<Vec<_>, RecordError>>()?;

        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        for (key, json) in encoded {
            self.records.insert(&mut txn, key, json);
        }
        for id in removes {
            self.records.remove(&mut txn, id.as_str());
        }
        Ok(txn.encode_update_v1())
    }

    /// Insert each record whose id is absent, checking and writing inside
    /// one local transaction. Returns the inserted ids and the update.
    pub fn insert_missing(&self, records: &[Record]) -> Result<(Vec<RecordId>, Vec<u8>), ReplicaError> {
        let encoded = records
            .iter()
            .map(|record| record.to_json().map(|json| (record.id(), json)))
            .collect::<Result<Vec<_>, RecordError>>()?;

        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let mut inserted = Vec::new();
        for (id, json) in encoded {
            if !self.records.contains_key(&txn, id.as_str()) {
                self.records.insert(&mut txn, id.as_str(), json);
                inserted.push(id.clone());
            }
        }
        if inserted.is_empty() {
            return Ok((inserted, Vec::new()));
        }
        Ok((inserted, txn.encode_update_v1()))
    }

    /// Merge an update received from a peer or loaded from storage.
    /// Applying the same update twice is a no-op.
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = StateVector::decode_v1(state_vector)?;
        let txn = yrs::Transact::transact(&self.doc);
        Ok(txn.encode_diff_v1(&remote))
    }
}

fn decode_entry(key: &str, value: Out) -> Result<Record, ReplicaError> {
    let json: Arc<str> = match value {
        Out::Any(Any::String(json)) => json,
        _ => return Err(ReplicaError::UnexpectedValue(key.to_string())),
    };
    let record = Record::from_json(&json)?;
    if record.id().as_str() != key {
        return Err(ReplicaError::KeyMismatch {
            key: key.to_string(),
            id: record.id().clone(),
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PageRecord, RecordKind, ShapeRecord};

    fn sticky(n: u32, x: f64) -> Record {
        ShapeRecord::new(
            RecordId::new(RecordKind::Shape, n),
            "event-sticky",
            RecordId::new(RecordKind::Page, "page"),
            x,
            0.0,
        )
        .into()
    }

    fn page() -> Record {
        PageRecord {
            id: RecordId::new(RecordKind::Page, "page"),
            name: "Page 1".into(),
            index: "a1".into(),
        }
        .into()
    }

    #[test]
    fn test_write_local_generates_update() {
        let replica = Replica::new();
        let update = replica.write_local(&[sticky(1, 10.0)], &[]).unwrap();
        assert!(!update.is_empty());
        assert_eq!(replica.len(), 1);

        let stored = replica.get(&RecordId::new(RecordKind::Shape, 1)).unwrap().unwrap();
        assert_eq!(stored, sticky(1, 10.0));
    }

    #[test]
    fn test_empty_write_is_noop() {
        let replica = Replica::new();
        assert!(replica.write_local(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn test_update_converges_on_peer() {
        let a = Replica::new();
        let b = Replica::new();

        let update = a.write_local(&[page(), sticky(1, 5.0)], &[]).unwrap();
        b.apply_remote(&update).unwrap();
        b.apply_remote(&update).unwrap();

        assert_eq!(b.len(), 2);
        assert_eq!(a.records().0, b.records().0);
    }

    #[test]
    fn test_observer_tags_origin() {
        let a = Replica::new();
        let b = Replica::new();
        let mut observer = b.observe();

        b.write_local(&[sticky(2, 0.0)], &[]).unwrap();
        let update = a.write_local(&[sticky(1, 0.0)], &[]).unwrap();
        b.apply_remote(&update).unwrap();

        let changes = observer.drain();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].origin, ChangeOrigin::Local);
        assert_eq!(changes[1].origin, ChangeOrigin::Remote);
        assert_eq!(changes[1].added, vec![RecordId::new(RecordKind::Shape, 1)]);
    }

    #[test]
    fn test_observer_reports_updates_and_removals() {
        let replica = Replica::new();
        let mut observer = replica.observe();
        let id = RecordId::new(RecordKind::Shape, 1);

        replica.write_local(&[sticky(1, 0.0)], &[]).unwrap();
        replica.write_local(&[sticky(1, 9.0)], &[]).unwrap();
        replica.write_local(&[], std::slice::from_ref(&id)).unwrap();

        let changes = observer.drain();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].added, vec![id.clone()]);
        assert_eq!(changes[1].updated, vec![id.clone()]);
        assert_eq!(changes[2].removed, vec![id]);
    }

    #[test]
    fn test_insert_missing_keeps_existing() {
        let replica = Replica::new();
        replica.write_local(&[sticky(1, 1.0)], &[]).unwrap();

        let (inserted, update) = replica.insert_missing(&[sticky(1, 99.0), page()]).unwrap();
        assert_eq!(inserted, vec![RecordId::new(RecordKind::Page, "page")]);
        assert!(!update.is_empty());

        let shape = replica.get(&RecordId::new(RecordKind::Shape, 1)).unwrap().unwrap();
        assert_eq!(shape.as_shape().unwrap().x, 1.0);

        let (inserted, update) = replica.insert_missing(&[page()]).unwrap();
        assert!(inserted.is_empty());
        assert!(update.is_empty());
    }

    #[test]
    fn test_snapshot_and_diff() {
        let a = Replica::new();
        a.write_local(&[page(), sticky(1, 0.0)], &[]).unwrap();

        let restored = Replica::from_snapshot(&a.encode_state()).unwrap();
        assert_eq!(restored.records().0, a.records().0);

        let b = Replica::new();
        let diff = a.diff_since(&b.state_vector()).unwrap();
        b.apply_remote(&diff).unwrap();
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_garbage_update_rejected() {
        let replica = Replica::new();
        assert!(replica.apply_remote(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Replica::from_snapshot(b"not a snapshot").is_err());
    }

    #[test]
    fn test_invalid_entry_is_skipped() {
        let replica = Replica::new();
        {
            let mut txn = yrs::Transact::transact_mut(&replica.doc);
            replica.records.insert(&mut txn, "shape:bad", "{not json");
        }
        replica.write_local(&[page()], &[]).unwrap();

        let (records, invalid) = replica.records();
        assert_eq!(records.len(), 1);
        assert_eq!(invalid, 1);
    }
}
