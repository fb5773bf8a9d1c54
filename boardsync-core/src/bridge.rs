//! Store Bridge: two one-directional pumps between a [`RecordStore`] and a
//! [`Replica`].
//!
//! - Local → replica: user batches of document-scoped records, one replica
//!   transaction per store transaction.
//! - Replica → local: remote replica transactions, one `merge_remote` batch
//!   per replica transaction. Local-origin transactions are this side's own
//!   echo and are skipped.
//!
//! The bridge owns no threads. The caller drives it with [`Bridge::on_sync`]
//! whenever the transport reports its sync status and [`Bridge::pump`]
//! after store mutations or applied remote updates, then drains
//! [`Bridge::take_outbound`] into the transport.

use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::essential::{ensure_essential_records, EssentialRecords};
use crate::record::{Record, RecordError, RecordId, RecordKind, RecordScope};
use crate::replica::{ChangeOrigin, Replica, ReplicaChange, ReplicaError, ReplicaObserver};
use crate::store::{ChangeBatch, ChangeFilter, ChangeSource, RecordStore};

/// Longest parent chain followed when checking a shape's container.
const MAX_PARENT_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Convergence status surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Waiting for the first full sync. Local edits are queued.
    Loading,
    /// Store and replica are convergent.
    Synced,
    /// The transport lost sync; convergence is not guaranteed until it
    /// reports synced again.
    Degraded,
}

/// What one bridge call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpReport {
    /// Store batches written to the replica.
    pub local_batches: usize,
    /// Replica transactions merged into the store.
    pub remote_batches: usize,
    pub records_pushed: usize,
    pub records_pulled: usize,
    /// Local-origin replica transactions skipped.
    pub echoes_skipped: usize,
    /// Essential singletons created by the guarantor.
    pub essentials_created: Vec<RecordId>,
    /// Shapes whose container chain did not resolve when written.
    pub integrity_warnings: Vec<RecordId>,
    /// Replica entries that failed to decode.
    pub invalid_records: usize,
    /// Replica entries of session or presence kinds, never materialized.
    pub out_of_scope: Vec<RecordId>,
}

impl PumpReport {
    pub fn merge(&mut self, other: PumpReport) {
        self.local_batches += other.local_batches;
        self.remote_batches += other.remote_batches;
        self.records_pushed += other.records_pushed;
        self.records_pulled += other.records_pulled;
        self.echoes_skipped += other.echoes_skipped;
        self.essentials_created.extend(other.essentials_created);
        self.integrity_warnings.extend(other.integrity_warnings);
        self.invalid_records += other.invalid_records;
        self.out_of_scope.extend(other.out_of_scope);
    }
}

pub struct Bridge {
    status: BridgeStatus,
    essentials: EssentialRecords,
    local_rx: mpsc::UnboundedReceiver<ChangeBatch>,
    observer: Option<ReplicaObserver>,
    outbound: Vec<Vec<u8>>,
}

impl Bridge {
    /// Attach to `store`. The replica side attaches on the first sync.
    pub fn new(store: &mut RecordStore, essentials: EssentialRecords) -> Self {
        let local_rx = store.subscribe(
            ChangeFilter::default()
                .source(ChangeSource::User)
                .scope(RecordScope::Document),
        );
        Self {
            status: BridgeStatus::Loading,
            essentials,
            local_rx,
            observer: None,
            outbound: Vec::new(),
        }
    }

    pub fn status(&self) -> BridgeStatus {
        self.status
    }

    pub fn essentials(&self) -> &EssentialRecords {
        &self.essentials
    }

    /// Replica updates produced since the last call, in order.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// Handle a sync signal from the transport.
    ///
    /// The first `true` heals the essentials, materializes the whole
    /// replica into the store as one remote batch and only then attaches
    /// the replica observer. A later `true` after [`BridgeStatus::Degraded`]
    /// heals again and reconciles by putting every replica record; store
    /// records unknown to the replica are left alone.
    pub fn on_sync(
        &mut self,
        synced: bool,
        replica: &Replica,
        store: &mut RecordStore,
    ) -> Result<PumpReport, BridgeError> {
        let mut report = PumpReport::default();
        if !synced {
            if self.status == BridgeStatus::Synced {
                log::warn!("Transport lost sync, bridge degraded");
                self.status = BridgeStatus::Degraded;
            }
            return Ok(report);
        }

        match self.status {
            BridgeStatus::Synced => return Ok(report),
            BridgeStatus::Loading => {
                self.heal_essentials(replica, store, &mut report)?;
                self.materialize(replica, store, &mut report)?;
                self.observer = Some(replica.observe());
                log::info!("Bridge synced: {} records materialized", report.records_pulled);
            }
            BridgeStatus::Degraded => {
                self.pull_remote(replica, store, &mut report)?;
                self.heal_essentials(replica, store, &mut report)?;
                self.materialize(replica, store, &mut report)?;
                log::info!("Bridge re-synced: {} records reconciled", report.records_pulled);
            }
        }
        self.status = BridgeStatus::Synced;

        // Local edits made while loading are pushed now.
        report.merge(self.pump(replica, store)?);
        Ok(report)
    }

    /// Move pending changes across in both directions.
    ///
    /// Before the first sync this is a no-op and local batches stay queued.
    pub fn pump(&mut self, replica: &Replica, store: &mut RecordStore) -> Result<PumpReport, BridgeError> {
        let mut report = PumpReport::default();
        if self.status == BridgeStatus::Loading {
            return Ok(report);
        }

        while let Ok(batch) = self.local_rx.try_recv() {
            self.push_local(batch, replica, store, &mut report)?;
        }
        self.pull_remote(replica, store, &mut report)?;
        Ok(report)
    }

    fn push_local(
        &mut self,
        batch: ChangeBatch,
        replica: &Replica,
        store: &mut RecordStore,
        report: &mut PumpReport,
    ) -> Result<(), BridgeError> {
        if batch.source == ChangeSource::Remote {
            return Ok(());
        }
        let puts: Vec<Record> = batch.changes.puts().cloned().collect();
        let removes: Vec<RecordId> = batch.changes.removed_ids().cloned().collect();

        if puts.iter().any(|r| r.kind() == RecordKind::Shape) {
            self.heal_essentials(replica, store, report)?;
            let pending: HashMap<&RecordId, &Record> = puts.iter().map(|r| (r.id(), r)).collect();
            for record in &puts {
                if let Record::Shape(shape) = record {
                    if !container_resolves(&shape.parent_id, &pending, replica) {
                        log::warn!(
                            "Shape '{}' written with unresolved container '{}'",
                            shape.id,
                            shape.parent_id
                        );
                        report.integrity_warnings.push(shape.id.clone());
                    }
                }
            }
        }

        let update = replica.write_local(&puts, &removes)?;
        if !update.is_empty() {
            self.outbound.push(update);
        }
        report.local_batches += 1;
        report.records_pushed += puts.len() + removes.len();
        log::trace!("Pushed local batch: {} puts, {} removes", puts.len(), removes.len());
        Ok(())
    }

    fn pull_remote(
        &mut self,
        replica: &Replica,
        store: &mut RecordStore,
        report: &mut PumpReport,
    ) -> Result<(), BridgeError> {
        let changes = match self.observer.as_mut() {
            Some(observer) => observer.drain(),
            None => return Ok(()),
        };
        for change in changes {
            if change.origin == ChangeOrigin::Local {
                report.echoes_skipped += 1;
                continue;
            }
            self.merge_change(change, replica, store, report)?;
        }
        Ok(())
    }

    /// Translate one remote replica transaction into one store batch.
    /// Values are read from the replica as it is now, so a key touched
    /// again by a later transaction is merged with its latest value.
    fn merge_change(
        &self,
        change: ReplicaChange,
        replica: &Replica,
        store: &mut RecordStore,
        report: &mut PumpReport,
    ) -> Result<(), BridgeError> {
        let mut puts = Vec::new();
        let mut removes = Vec::new();
        let keys = change
            .added
            .into_iter()
            .chain(change.updated)
            .chain(change.removed);
        for id in keys {
            if !is_document_id(&id) {
                log::warn!("Ignoring replica entry '{}' outside the document scope", id);
                report.out_of_scope.push(id);
                continue;
            }
            match replica.get(&id) {
                Ok(Some(record)) => puts.push(record),
                Ok(None) => removes.push(id),
                Err(e) => {
                    log::warn!("Ignoring invalid replica record '{}': {}", id, e);
                    report.invalid_records += 1;
                }
            }
        }
        let diff = store.merge_remote(puts, removes)?;
        report.remote_batches += 1;
        report.records_pulled += diff.len();
        Ok(())
    }

    fn materialize(
        &self,
        replica: &Replica,
        store: &mut RecordStore,
        report: &mut PumpReport,
    ) -> Result<(), BridgeError> {
        let (records, invalid) = replica.records();
        report.invalid_records += invalid;
        let (records, foreign): (Vec<Record>, Vec<Record>) = records
            .into_iter()
            .partition(|record| record.scope() == RecordScope::Document);
        for record in foreign {
            log::warn!("Ignoring replica entry '{}' outside the document scope", record.id());
            report.out_of_scope.push(record.id().clone());
        }
        let diff = store.merge_remote(records, Vec::new())?;
        if !diff.is_empty() {
            report.remote_batches += 1;
        }
        report.records_pulled += diff.len();
        Ok(())
    }

    /// Run the guarantor. Created singletons go out as their own update
    /// and into the store as a remote batch so they are not pushed back.
    fn heal_essentials(
        &mut self,
        replica: &Replica,
        store: &mut RecordStore,
        report: &mut PumpReport,
    ) -> Result<(), BridgeError> {
        let outcome = ensure_essential_records(replica, &self.essentials)?;
        if !outcome.changed() {
            return Ok(());
        }
        self.outbound.push(outcome.update);
        let created: Vec<Record> = self
            .essentials
            .records()
            .into_iter()
            .filter(|r| outcome.inserted.contains(r.id()))
            .collect();
        store.merge_remote(created, Vec::new())?;
        report.essentials_created.extend(outcome.inserted);
        Ok(())
    }
}

fn is_document_id(id: &RecordId) -> bool {
    id.kind().is_some_and(|kind| kind.scope() == RecordScope::Document)
}

/// Follow a shape's parent chain until it reaches an existing page.
fn container_resolves(
    parent: &RecordId,
    pending: &HashMap<&RecordId, &Record>,
    replica: &Replica,
) -> bool {
    let mut current = parent.clone();
    let mut seen = HashSet::new();
    for _ in 0..MAX_PARENT_DEPTH {
        if !seen.insert(current.clone()) {
            return false;
        }
        let record = match pending.get(&current) {
            Some(record) => Some((*record).clone()),
            None => match replica.get(&current) {
                Ok(record) => record,
                Err(_) => None,
            },
        };
        match record {
            Some(Record::Page(_)) => return true,
            Some(Record::Shape(shape)) => current = shape.parent_id,
            _ => return false,
        }
    }
    false
}
