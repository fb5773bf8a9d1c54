//! Local record store: the typed in-memory table the editor renders from
//! and mutates optimistically.
//!
//! Every mutating call is one transaction and produces at most one
//! [`ChangeBatch`], tagged with the [`ChangeSource`] that caused it.
//! Listeners receive batches over unbounded channels, so the store never
//! calls back into user code while it is being mutated.

use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::record::{Record, RecordError, RecordId, RecordKind, RecordScope};

/// Who produced a change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// The local user (editor interaction).
    User,
    /// Merged in from the replica or the presence layer.
    Remote,
}

/// Net effect of one store transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordsDiff {
    pub added: BTreeMap<RecordId, Record>,
    /// `(before, after)` pairs.
    pub updated: BTreeMap<RecordId, (Record, Record)>,
    pub removed: BTreeMap<RecordId, Record>,
}

impl RecordsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Number of records touched.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// Current values of added and updated records.
    pub fn puts(&self) -> impl Iterator<Item = &Record> {
        self.added
            .values()
            .chain(self.updated.values().map(|(_, after)| after))
    }

    pub fn removed_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.removed.keys()
    }

    /// Keep only the records of one scope.
    pub fn filter_scope(&self, scope: RecordScope) -> RecordsDiff {
        RecordsDiff {
            added: self
                .added
                .iter()
                .filter(|(_, r)| r.scope() == scope)
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
            updated: self
                .updated
                .iter()
                .filter(|(_, (_, after))| after.scope() == scope)
                .map(|(id, pair)| (id.clone(), pair.clone()))
                .collect(),
            removed: self
                .removed
                .iter()
                .filter(|(_, r)| r.scope() == scope)
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
        }
    }
}

/// A change batch delivered to store listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub source: ChangeSource,
    pub changes: RecordsDiff,
}

/// Which batches a listener wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub source: Option<ChangeSource>,
    pub scope: Option<RecordScope>,
}

impl ChangeFilter {
    pub fn source(mut self, source: ChangeSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn scope(mut self, scope: RecordScope) -> Self {
        self.scope = Some(scope);
        self
    }

    fn apply(&self, batch_source: ChangeSource, diff: &RecordsDiff) -> Option<ChangeBatch> {
        if self.source.is_some_and(|s| s != batch_source) {
            return None;
        }
        let changes = match self.scope {
            Some(scope) => diff.filter_scope(scope),
            None => diff.clone(),
        };
        (!changes.is_empty()).then_some(ChangeBatch {
            source: batch_source,
            changes,
        })
    }
}

/// In-memory record table with change notification.
#[derive(Default)]
pub struct RecordStore {
    records: BTreeMap<RecordId, Record>,
    listeners: Vec<(ChangeFilter, mpsc::UnboundedSender<ChangeBatch>)>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn of_kind(&self, kind: RecordKind) -> impl Iterator<Item = &Record> {
        self.records.values().filter(move |r| r.kind() == kind)
    }

    pub fn of_scope(&self, scope: RecordScope) -> impl Iterator<Item = &Record> {
        self.records.values().filter(move |r| r.scope() == scope)
    }

    /// Subscribe to change batches matching `filter`.
    ///
    /// Dropping the receiver unsubscribes; the sender is pruned on the next
    /// transaction.
    pub fn subscribe(&mut self, filter: ChangeFilter) -> mpsc::UnboundedReceiver<ChangeBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push((filter, tx));
        rx
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.iter().filter(|(_, tx)| !tx.is_closed()).count()
    }

    /// User transaction: put records.
    pub fn put(&mut self, records: Vec<Record>) -> Result<RecordsDiff, RecordError> {
        self.apply(ChangeSource::User, records, Vec::new())
    }

    /// User transaction: remove records.
    pub fn remove(&mut self, ids: Vec<RecordId>) -> Result<RecordsDiff, RecordError> {
        self.apply(ChangeSource::User, Vec::new(), ids)
    }

    /// Remote transaction: merge puts and removals as one batch.
    pub fn merge_remote(
        &mut self,
        puts: Vec<Record>,
        removes: Vec<RecordId>,
    ) -> Result<RecordsDiff, RecordError> {
        self.apply(ChangeSource::Remote, puts, removes)
    }

    /// Apply one transaction. Puts are replace-if-changed; removing an
    /// absent id is a no-op. Nothing is applied if any put is invalid.
    pub fn apply(
        &mut self,
        source: ChangeSource,
        puts: Vec<Record>,
        removes: Vec<RecordId>,
    ) -> Result<RecordsDiff, RecordError> {
        for record in &puts {
            record.validate()?;
        }

        let mut before: BTreeMap<RecordId, Option<Record>> = BTreeMap::new();
        for record in puts {
            let id = record.id().clone();
            let previous = self.records.insert(id.clone(), record);
            before.entry(id).or_insert(previous);
        }
        for id in removes {
            let previous = self.records.remove(&id);
            before.entry(id).or_insert(previous);
        }

        let mut diff = RecordsDiff::default();
        for (id, previous) in before {
            match (previous, self.records.get(&id)) {
                (None, Some(after)) => {
                    diff.added.insert(id, after.clone());
                }
                (Some(previous), Some(after)) if previous != *after => {
                    diff.updated.insert(id, (previous, after.clone()));
                }
                (Some(previous), None) => {
                    diff.removed.insert(id, previous);
                }
                _ => {}
            }
        }

        if !diff.is_empty() {
            self.notify(source, &diff);
        }
        Ok(diff)
    }

    fn notify(&mut self, source: ChangeSource, diff: &RecordsDiff) {
        self.listeners.retain(|(filter, tx)| match filter.apply(source, diff) {
            Some(batch) => tx.send(batch).is_ok(),
            None => !tx.is_closed(),
        });
    }
}
