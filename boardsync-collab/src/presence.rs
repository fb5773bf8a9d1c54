//! Presence layer: ephemeral per-connection state (identity, cursor,
//! selection) shared among peers without touching replicated content.
//!
//! ## Architecture
//!
//! ```text
//! local session records (pointer, instance, page state)
//!       │
//!       ▼
//! PresencePublisher::poll()      (throttled, periodically renewed)
//!       │
//!       ▼   AwarenessUpdate over the room
//! AwarenessRegistry              (server: one slot per connection)
//!       │
//!       ▼
//! PresenceMirror::apply()        (client: one merge-remote batch)
//!       │
//!       ▼
//! instance_presence records in the RecordStore
//! ```
//!
//! Presence never reaches the replica or the persisted snapshot.

use boardsync_core::{
    ChangeBatch, ChangeFilter, ChangeSource, Cursor, PresenceRecord, Record, RecordError, RecordId,
    RecordKind, RecordScope, RecordStore, RecordsDiff,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{AwarenessUpdate, PresenceState, UserIdentity};

/// RGBA color for cursors and selections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// HSL with high saturation; the hue comes from the UUID bits so the
    /// same user always gets the same color.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_css(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Client-side presence timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Minimum gap between two publishes of changed state.
    pub publish_interval: Duration,
    /// Republish unchanged state this often so the server does not evict it.
    pub renew_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_millis(100),
            renew_interval: Duration::from_secs(15),
        }
    }
}

/// Store id of the presence record materialized for a connection.
pub fn presence_record_id(peer_id: Uuid) -> RecordId {
    RecordId::new(RecordKind::InstancePresence, peer_id)
}

/// Well-known ids of the session singletons presence is derived from.
pub fn pointer_id() -> RecordId {
    RecordId::new(RecordKind::Pointer, "pointer")
}

pub fn instance_id() -> RecordId {
    RecordId::new(RecordKind::Instance, "instance")
}

/// Compute the presence snapshot from the local editing state.
///
/// Cursor comes from the pointer record, the current page from the
/// instance record and the selection from the page state of that page.
pub fn derive_presence(store: &RecordStore, user: &UserIdentity) -> PresenceState {
    let mut state = PresenceState::new(user.clone());

    if let Some(Record::Pointer(pointer)) = store.get(&pointer_id()) {
        state.cursor = Some(Cursor { x: pointer.x, y: pointer.y });
    }

    if let Some(Record::Instance(instance)) = store.get(&instance_id()) {
        state.current_page_id = Some(instance.current_page_id.clone());
        state.selection = store
            .of_kind(RecordKind::InstancePageState)
            .find_map(|record| match record {
                Record::InstancePageState(ps) if ps.page_id == instance.current_page_id => {
                    Some(ps.selected_shape_ids.clone())
                }
                _ => None,
            })
            .unwrap_or_default();
    }

    state
}

/// Publishes this connection's presence slot.
///
/// Watches session-scoped store changes, recomputes the snapshot and hands
/// out an [`AwarenessUpdate`] when it changed (throttled to
/// `publish_interval`) or when the last publish is older than
/// `renew_interval`.
pub struct PresencePublisher {
    peer_id: Uuid,
    user: UserIdentity,
    config: PresenceConfig,
    changes: mpsc::UnboundedReceiver<ChangeBatch>,
    last_state: Option<PresenceState>,
    last_sent: Option<Instant>,
    dirty: bool,
    stopped: bool,
}

impl PresencePublisher {
    pub fn new(
        store: &mut RecordStore,
        peer_id: Uuid,
        user: UserIdentity,
        config: PresenceConfig,
    ) -> Self {
        let changes = store.subscribe(
            ChangeFilter::default()
                .source(ChangeSource::User)
                .scope(RecordScope::Session),
        );
        Self {
            peer_id,
            user,
            config,
            changes,
            last_state: None,
            last_sent: None,
            dirty: true,
            stopped: false,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    /// Next update to send, if any is due at `now`.
    pub fn poll(&mut self, store: &RecordStore, now: Instant) -> Option<AwarenessUpdate> {
        if self.stopped {
            return None;
        }
        while self.changes.try_recv().is_ok() {
            self.dirty = true;
        }

        let since_sent = self.last_sent.map(|at| now.saturating_duration_since(at));
        let throttled = since_sent.is_some_and(|d| d < self.config.publish_interval);
        let renew_due = since_sent.is_some_and(|d| d >= self.config.renew_interval);

        if self.dirty && !throttled {
            self.dirty = false;
            let state = derive_presence(store, &self.user);
            if self.last_state.as_ref() != Some(&state) {
                return Some(self.publish(state, now));
            }
        }

        if renew_due {
            let state = self
                .last_state
                .clone()
                .unwrap_or_else(|| derive_presence(store, &self.user));
            log::trace!("Renewing presence for {}", self.peer_id);
            return Some(self.publish(state, now));
        }
        None
    }

    /// Forget what was published; the next poll sends the current state.
    /// Used when a new connection starts with an empty server slot.
    pub fn reset(&mut self) {
        self.last_state = None;
        self.last_sent = None;
        self.dirty = true;
    }

    /// Stop publishing. Returns the removal of this slot the first time.
    pub fn stop(&mut self) -> Option<AwarenessUpdate> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        Some(AwarenessUpdate::removed([self.peer_id]))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn publish(&mut self, state: PresenceState, now: Instant) -> AwarenessUpdate {
        self.last_state = Some(state.clone());
        self.last_sent = Some(now);
        AwarenessUpdate::set(self.peer_id, state)
    }
}

/// Materializes peer presence into the local store.
///
/// Keeps the room's aggregate (minus this connection) and, on every
/// change, removes peers that vanished and puts all current snapshots in
/// one merge-remote batch.
pub struct PresenceMirror {
    local_peer: Uuid,
    aggregate: BTreeMap<Uuid, PresenceState>,
    known: BTreeSet<Uuid>,
}

impl PresenceMirror {
    pub fn new(local_peer: Uuid) -> Self {
        Self {
            local_peer,
            aggregate: BTreeMap::new(),
            known: BTreeSet::new(),
        }
    }

    /// Fold an awareness update into the aggregate and reconcile the store.
    pub fn apply(
        &mut self,
        update: &AwarenessUpdate,
        store: &mut RecordStore,
    ) -> Result<RecordsDiff, RecordError> {
        self.fold(update);
        self.reconcile(store)
    }

    /// Take `aggregate` as the room's complete presence: peers missing
    /// from it are removed in the same batch.
    pub fn replace(
        &mut self,
        aggregate: &AwarenessUpdate,
        store: &mut RecordStore,
    ) -> Result<RecordsDiff, RecordError> {
        self.aggregate.clear();
        self.fold(aggregate);
        self.reconcile(store)
    }

    fn fold(&mut self, update: &AwarenessUpdate) {
        for (peer_id, state) in &update.entries {
            if *peer_id == self.local_peer {
                continue;
            }
            match state {
                Some(state) => {
                    self.aggregate.insert(*peer_id, state.clone());
                }
                None => {
                    self.aggregate.remove(peer_id);
                }
            }
        }
    }

    /// A peer's connection closed.
    pub fn peer_left(&mut self, peer_id: Uuid, store: &mut RecordStore) -> Result<RecordsDiff, RecordError> {
        self.aggregate.remove(&peer_id);
        self.reconcile(store)
    }

    /// Remove every materialized peer record.
    pub fn teardown(&mut self, store: &mut RecordStore) -> Result<RecordsDiff, RecordError> {
        self.aggregate.clear();
        self.reconcile(store)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&Uuid, &PresenceState)> {
        self.aggregate.iter()
    }

    pub fn peer_count(&self) -> usize {
        self.aggregate.len()
    }

    fn reconcile(&mut self, store: &mut RecordStore) -> Result<RecordsDiff, RecordError> {
        let to_remove: Vec<RecordId> = self
            .known
            .iter()
            .filter(|id| !self.aggregate.contains_key(id))
            .map(|id| presence_record_id(*id))
            .collect();
        let to_put: Vec<Record> = self
            .aggregate
            .iter()
            .map(|(peer_id, state)| Record::InstancePresence(presence_record(*peer_id, state)))
            .collect();

        let diff = store.merge_remote(to_put, to_remove)?;
        self.known = self.aggregate.keys().copied().collect();
        Ok(diff)
    }
}

fn presence_record(peer_id: Uuid, state: &PresenceState) -> PresenceRecord {
    PresenceRecord {
        id: presence_record_id(peer_id),
        user_id: state.user.id.clone(),
        user_name: state.user.name.clone(),
        color: state.user.color.clone(),
        cursor: state.cursor,
        selected_shape_ids: state.selection.clone(),
        current_page_id: state.current_page_id.clone(),
    }
}

/// Server-side aggregate of a room's awareness slots.
#[derive(Debug, Default)]
pub struct AwarenessRegistry {
    states: HashMap<Uuid, (PresenceState, Instant)>,
}

impl AwarenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply entries sent by `from`. A connection may only write its own
    /// slot; returns the accepted entries for broadcast.
    pub fn apply(&mut self, from: Uuid, update: &AwarenessUpdate, now: Instant) -> AwarenessUpdate {
        let mut accepted = AwarenessUpdate::default();
        for (peer_id, state) in &update.entries {
            if *peer_id != from {
                log::debug!("Ignoring awareness entry for {peer_id} sent by {from}");
                continue;
            }
            match state {
                Some(state) => {
                    self.states.insert(from, (state.clone(), now));
                }
                None => {
                    if self.states.remove(&from).is_none() {
                        continue;
                    }
                }
            }
            accepted.entries.push((*peer_id, state.clone()));
        }
        accepted
    }

    pub fn remove(&mut self, peer_id: &Uuid) -> bool {
        self.states.remove(peer_id).is_some()
    }

    /// Drop slots not renewed within `timeout`. Returns the evicted ids.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        let mut stale: Vec<Uuid> = self
            .states
            .iter()
            .filter(|(_, (_, seen))| now.saturating_duration_since(*seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        stale.sort();
        for id in &stale {
            self.states.remove(id);
        }
        stale
    }

    /// Every live slot, for a newly joined connection.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut entries: Vec<(Uuid, Option<PresenceState>)> = self
            .states
            .iter()
            .map(|(id, (state, _))| (*id, Some(state.clone())))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        AwarenessUpdate { entries }
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&PresenceState> {
        self.states.get(peer_id).map(|(state, _)| state)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
