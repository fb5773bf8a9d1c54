//! Room actor: the single authoritative replica of one room, its
//! persistence and its hibernation lifecycle.
//!
//! ```text
//!   Cold ──first connect──► Loading ──snapshot / empty──► Active
//!                              ▲                            │  edits: debounced save
//!                              │                            │
//!                         next connect              last disconnect:
//!                              │                  save now, dispose timers
//!                              └──────── Hibernated ◄───────┘
//! ```
//!
//! All replica mutations happen inside the actor task; connection tasks
//! talk to it only through [`RoomHandle`].
//!
//! Membership is keyed by peer id, but every join gets a fresh
//! [`ConnectionId`]. A peer that joins again supersedes its older socket,
//! whose later commands and departure are ignored. An actor that stays
//! idle (hibernated or never loaded) for `room_retire_secs` stops; the
//! server starts a new one on the next join.

use boardsync_core::{Replica, ReplicaError};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::config::ServerConfig;
use crate::presence::AwarenessRegistry;
use crate::protocol::{AwarenessUpdate, PeerInfo, ProtocolError, SyncMessage};
use crate::server::StatsCounters;
use crate::storage::{SnapshotStore, StoreError};

const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room {room} is full ({max} connections)")]
    Full { room: String, max: usize },
    #[error("connection {0} has not joined this room")]
    UnknownPeer(Uuid),
    #[error("failed to load room snapshot: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("room actor stopped")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Never loaded in this process.
    Cold,
    Loading,
    /// At least one connection; replica in memory.
    Active,
    /// Saved and torn down after the last connection left.
    Hibernated,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStatus {
    pub phase: RoomPhase,
    pub peers: usize,
    pub awareness_states: usize,
    pub save_pending: bool,
    pub snapshots_saved: u64,
}

/// Server-assigned identity of one joined socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub peer_id: Uuid,
    /// Increases with every join of the room.
    pub serial: u64,
}

/// What a connection gets when it joins.
pub struct Joined {
    pub connection: ConnectionId,
    pub receiver: broadcast::Receiver<Frame>,
    /// Current awareness aggregate of the room.
    pub awareness: AwarenessUpdate,
    /// Resolves when a newer join of the same peer id takes over.
    pub superseded: oneshot::Receiver<()>,
}

struct Member {
    serial: u64,
    evict: oneshot::Sender<()>,
}

/// Answer to a `SyncStep1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReply {
    /// Everything the requester lacks.
    pub diff: Vec<u8>,
    /// The room's own state vector.
    pub state_vector: Vec<u8>,
}

/// Coalesces bursts of edits into one save, bounded by a maximum wait.
#[derive(Debug, Clone)]
pub struct Debouncer {
    wait: Duration,
    max_wait: Duration,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(wait: Duration, max_wait: Duration) -> Self {
        Self {
            wait,
            max_wait,
            first: None,
            last: None,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.first.get_or_insert(now);
        self.last = Some(now);
    }

    /// When the pending save fires, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.first, self.last) {
            (Some(first), Some(last)) => Some((last + self.wait).min(first + self.max_wait)),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.first.is_some()
    }

    /// True (and reset) if the deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.clear();
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.first = None;
        self.last = None;
    }
}

/// In-memory state that exists only while the room is active.
struct LiveDocument {
    replica: Replica,
    awareness: AwarenessRegistry,
    housekeeping: Option<JoinHandle<()>>,
}

impl LiveDocument {
    fn dispose(mut self) {
        self.stop_timers();
    }

    fn stop_timers(&mut self) {
        if let Some(handle) = self.housekeeping.take() {
            handle.abort();
        }
    }
}

impl Drop for LiveDocument {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

/// Commands handled by the room actor, in arrival order.
pub enum RoomCommand {
    Connect {
        info: PeerInfo,
        reply: oneshot::Sender<Result<Joined, RoomError>>,
    },
    SyncStep1 {
        from: ConnectionId,
        state_vector: Vec<u8>,
        reply: oneshot::Sender<Result<SyncReply, RoomError>>,
    },
    /// `Update` or `SyncStep2` payload from a connection.
    Update {
        from: ConnectionId,
        clock: u64,
        payload: Vec<u8>,
    },
    Awareness {
        from: ConnectionId,
        clock: u64,
        update: AwarenessUpdate,
    },
    /// Replies once any hibernation save has completed.
    Disconnect {
        connection: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Housekeep,
    Snapshot {
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
}

/// The room actor's state.
pub struct Room {
    name: String,
    config: ServerConfig,
    store: Arc<dyn SnapshotStore>,
    counters: Arc<StatsCounters>,
    commands: mpsc::WeakSender<RoomCommand>,
    broadcast: BroadcastGroup,
    members: HashMap<Uuid, Member>,
    next_serial: u64,
    live: Option<LiveDocument>,
    phase: RoomPhase,
    debouncer: Debouncer,
    /// When the idle actor stops; `None` while the document is live.
    retire_at: Option<Instant>,
    snapshots_saved: u64,
}

impl Room {
    /// `commands` feeds the housekeeping timer back into the actor.
    pub fn new(
        name: impl Into<String>,
        config: ServerConfig,
        store: Arc<dyn SnapshotStore>,
        counters: Arc<StatsCounters>,
        commands: mpsc::WeakSender<RoomCommand>,
    ) -> Self {
        let debouncer = Debouncer::new(config.save_debounce(), config.save_max_wait());
        let retire_at = Some(Instant::now() + config.room_retire_after());
        Self {
            name: name.into(),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            config,
            store,
            counters,
            commands,
            members: HashMap::new(),
            next_serial: 0,
            live: None,
            phase: RoomPhase::Cold,
            debouncer,
            retire_at,
            snapshots_saved: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn status(&self) -> RoomStatus {
        RoomStatus {
            phase: self.phase,
            peers: self.members.len(),
            awareness_states: self.live.as_ref().map_or(0, |live| live.awareness.len()),
            save_pending: self.debouncer.is_pending(),
            snapshots_saved: self.snapshots_saved,
        }
    }

    pub fn replica(&self) -> Option<&Replica> {
        self.live.as_ref().map(|live| &live.replica)
    }

    /// Full encoded state, if the room is live.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.replica().map(Replica::encode_state)
    }

    pub fn save_deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub fn retire_deadline(&self) -> Option<Instant> {
        self.retire_at
    }

    /// Admit a connection, loading the document first if needed.
    ///
    /// A peer id that is already a member keeps its seat: the new socket
    /// replaces the old one, which is told to close through
    /// [`Joined::superseded`].
    pub fn connect(&mut self, info: PeerInfo) -> Result<Joined, RoomError> {
        let rejoin = self.members.contains_key(&info.peer_id);
        if !rejoin && self.members.len() >= self.config.max_peers_per_room {
            return Err(RoomError::Full {
                room: self.name.clone(),
                max: self.config.max_peers_per_room,
            });
        }
        let live = self.ensure_loaded()?;
        let awareness = live.awareness.snapshot();

        self.next_serial += 1;
        let connection = ConnectionId {
            peer_id: info.peer_id,
            serial: self.next_serial,
        };
        let (evict, superseded) = oneshot::channel();
        let member = Member {
            serial: connection.serial,
            evict,
        };
        match self.members.insert(info.peer_id, member) {
            Some(previous) => {
                log::info!(
                    "Peer {} rejoined room {}, superseding connection #{}",
                    info.peer_id,
                    self.name,
                    previous.serial
                );
                let _ = previous.evict.send(());
            }
            None => log::info!(
                "Peer {} ({}) joined room {}",
                info.user.name,
                info.peer_id,
                self.name
            ),
        }
        let receiver = self.broadcast.add_peer(info);
        Ok(Joined {
            connection,
            receiver,
            awareness,
            superseded,
        })
    }

    fn is_current(&self, connection: ConnectionId) -> bool {
        self.members
            .get(&connection.peer_id)
            .is_some_and(|member| member.serial == connection.serial)
    }

    fn ensure_loaded(&mut self) -> Result<&mut LiveDocument, RoomError> {
        if self.live.is_none() {
            let was = self.phase;
            self.phase = RoomPhase::Loading;
            let replica = match self.load_replica() {
                Ok(replica) => replica,
                Err(e) => {
                    self.phase = was;
                    return Err(e);
                }
            };
            let housekeeping = self.spawn_housekeeping();
            self.live = Some(LiveDocument {
                replica,
                awareness: AwarenessRegistry::new(),
                housekeeping: Some(housekeeping),
            });
            self.phase = RoomPhase::Active;
            self.retire_at = None;
        }
        self.live.as_mut().ok_or(RoomError::Closed)
    }

    fn load_replica(&self) -> Result<Replica, RoomError> {
        let Some(snapshot) = self.store.get(&self.name)? else {
            log::info!("Room {} starts empty", self.name);
            return Ok(Replica::new());
        };
        match Replica::from_snapshot(&snapshot) {
            Ok(replica) => {
                log::info!(
                    "Room {} loaded from snapshot ({} bytes, {} records)",
                    self.name,
                    snapshot.len(),
                    replica.len()
                );
                Ok(replica)
            }
            Err(e) => {
                log::warn!(
                    "Room {}: snapshot could not be decoded ({e}), starting empty",
                    self.name
                );
                Ok(Replica::new())
            }
        }
    }

    fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let every = self.config.presence_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = commands.upgrade() else { break };
                if tx.send(RoomCommand::Housekeep).await.is_err() {
                    break;
                }
            }
        })
    }

    fn live_for(&mut self, from: ConnectionId) -> Result<&mut LiveDocument, RoomError> {
        if !self.is_current(from) {
            return Err(RoomError::UnknownPeer(from.peer_id));
        }
        self.live.as_mut().ok_or(RoomError::UnknownPeer(from.peer_id))
    }

    pub fn sync_step1(&mut self, from: ConnectionId, state_vector: &[u8]) -> Result<SyncReply, RoomError> {
        let live = self.live_for(from)?;
        Ok(SyncReply {
            diff: live.replica.diff_since(state_vector)?,
            state_vector: live.replica.state_vector(),
        })
    }

    /// Merge a connection's update, relay it to the others and schedule a
    /// save.
    pub fn apply_update(
        &mut self,
        from: ConnectionId,
        clock: u64,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<(), RoomError> {
        let live = self.live_for(from)?;
        live.replica.apply_remote(&payload)?;

        let peer_id = from.peer_id;
        let msg = SyncMessage::update(peer_id, &self.name, clock, payload);
        let receivers = self.broadcast.broadcast(peer_id, &msg)?;
        log::trace!("Room {}: relayed update from {peer_id} to {receivers} receivers", self.name);

        self.debouncer.mark(now);
        Ok(())
    }

    /// Record a connection's awareness slot and relay what was accepted.
    pub fn apply_awareness(
        &mut self,
        from: ConnectionId,
        clock: u64,
        update: &AwarenessUpdate,
        now: std::time::Instant,
    ) -> Result<(), RoomError> {
        let live = self.live_for(from)?;
        let accepted = live.awareness.apply(from.peer_id, update, now);
        if !accepted.is_empty() {
            let msg = SyncMessage::awareness(from.peer_id, &self.name, clock, &accepted)?;
            self.broadcast.broadcast(from.peer_id, &msg)?;
        }
        Ok(())
    }

    /// Remove a connection. On the last one the room is saved and torn
    /// down before this returns. Returns true if the room hibernated.
    ///
    /// A superseded connection's departure changes nothing.
    pub fn disconnect(&mut self, connection: ConnectionId) -> bool {
        let peer_id = connection.peer_id;
        if !self.is_current(connection) {
            if self.members.contains_key(&peer_id) {
                log::debug!(
                    "Room {}: superseded connection #{} of {peer_id} closed",
                    self.name,
                    connection.serial
                );
            }
            return false;
        }
        self.members.remove(&peer_id);
        self.broadcast.remove_peer(&peer_id);
        log::info!("Peer {peer_id} left room {}", self.name);

        let had_awareness = self
            .live
            .as_mut()
            .is_some_and(|live| live.awareness.remove(&peer_id));
        if had_awareness {
            self.broadcast_awareness_removal(vec![peer_id]);
        }
        if let Err(e) = self
            .broadcast
            .broadcast(Uuid::nil(), &SyncMessage::peer_left(peer_id, &self.name))
        {
            log::warn!("Room {}: failed to announce departure of {peer_id}: {e}", self.name);
        }

        if self.members.is_empty() {
            self.hibernate();
            return true;
        }
        false
    }

    fn hibernate(&mut self) {
        self.save_now();
        if let Some(live) = self.live.take() {
            live.dispose();
        }
        self.debouncer.clear();
        self.phase = RoomPhase::Hibernated;
        self.retire_at = Some(Instant::now() + self.config.room_retire_after());
        log::info!("Room {} hibernated", self.name);
    }

    /// Evict awareness slots that were not renewed in time.
    pub fn housekeep(&mut self, now: std::time::Instant) -> Vec<Uuid> {
        let timeout = self.config.presence_timeout();
        let evicted = match self.live.as_mut() {
            Some(live) => live.awareness.evict_stale(now, timeout),
            None => return Vec::new(),
        };
        if !evicted.is_empty() {
            log::debug!("Room {}: evicted {} stale awareness states", self.name, evicted.len());
            self.broadcast_awareness_removal(evicted.clone());
        }
        evicted
    }

    fn broadcast_awareness_removal(&self, peers: Vec<Uuid>) {
        let result = SyncMessage::awareness(Uuid::nil(), &self.name, 0, &AwarenessUpdate::removed(peers))
            .and_then(|msg| self.broadcast.broadcast(Uuid::nil(), &msg));
        if let Err(e) = result {
            log::warn!("Room {}: failed to broadcast awareness removal: {e}", self.name);
        }
    }

    /// Save if the debounce deadline has passed.
    pub fn save_if_due(&mut self, now: Instant) -> bool {
        self.debouncer.take_due(now) && self.save_now()
    }

    /// Encode the full state and overwrite the stored snapshot.
    ///
    /// A failed write is logged; the next edit schedules another attempt.
    pub fn save_now(&mut self) -> bool {
        self.debouncer.clear();
        let Some(live) = self.live.as_ref() else {
            return false;
        };
        let snapshot = live.replica.encode_state();
        match self.store.put(&self.name, &snapshot) {
            Ok(()) => {
                self.snapshots_saved += 1;
                self.counters.snapshots_saved.fetch_add(1, Ordering::Relaxed);
                log::debug!("Room {}: saved snapshot ({} bytes)", self.name, snapshot.len());
                true
            }
            Err(e) => {
                self.counters.snapshot_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Room {}: failed to save snapshot: {e}", self.name);
                false
            }
        }
    }

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Connect { info, reply } => {
                let _ = reply.send(self.connect(info));
            }
            RoomCommand::SyncStep1 {
                from,
                state_vector,
                reply,
            } => {
                let _ = reply.send(self.sync_step1(from, &state_vector));
            }
            RoomCommand::Update { from, clock, payload } => {
                if let Err(e) = self.apply_update(from, clock, payload, Instant::now()) {
                    log::warn!("Room {}: rejected update from {from:?}: {e}", self.name);
                }
            }
            RoomCommand::Awareness { from, clock, update } => {
                if let Err(e) = self.apply_awareness(from, clock, &update, std::time::Instant::now()) {
                    log::warn!("Room {}: rejected awareness from {from:?}: {e}", self.name);
                }
            }
            RoomCommand::Disconnect { connection, reply } => {
                let _ = reply.send(self.disconnect(connection));
            }
            RoomCommand::Housekeep => {
                self.housekeep(std::time::Instant::now());
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            RoomCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Actor loop: commands in order, plus the debounced save and the
    /// idle retirement timers.
    pub async fn run(mut self, mut commands: mpsc::Receiver<RoomCommand>) {
        loop {
            let deadline = self.debouncer.deadline();
            let retire_at = self.retire_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    self.save_if_due(Instant::now());
                }
                _ = sleep_until(retire_at) => {
                    // Queued commands are dropped; their senders see `Closed`.
                    commands.close();
                    log::debug!("Room {} idle, retiring actor", self.name);
                    break;
                }
            }
        }
        if self.live.is_some() {
            self.save_now();
        }
        log::debug!("Room {} actor stopped", self.name);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable address of a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    name: Arc<str>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Start the actor for `name`.
    pub fn spawn(
        name: &str,
        config: ServerConfig,
        store: Arc<dyn SnapshotStore>,
        counters: Arc<StatsCounters>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let room = Room::new(name, config, store, counters, tx.downgrade());
        tokio::spawn(room.run(rx));
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.tx.send(command).await.map_err(|_| RoomError::Closed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    pub async fn connect(&self, info: PeerInfo) -> Result<Joined, RoomError> {
        self.request(|reply| RoomCommand::Connect { info, reply }).await?
    }

    pub async fn sync_step1(&self, from: ConnectionId, state_vector: Vec<u8>) -> Result<SyncReply, RoomError> {
        self.request(|reply| RoomCommand::SyncStep1 {
            from,
            state_vector,
            reply,
        })
        .await?
    }

    pub async fn update(&self, from: ConnectionId, clock: u64, payload: Vec<u8>) -> Result<(), RoomError> {
        self.send(RoomCommand::Update { from, clock, payload }).await
    }

    pub async fn awareness(&self, from: ConnectionId, clock: u64, update: AwarenessUpdate) -> Result<(), RoomError> {
        self.send(RoomCommand::Awareness { from, clock, update }).await
    }

    /// Resolves after the room has processed the departure, including any
    /// hibernation save. True if the room hibernated.
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<bool, RoomError> {
        self.request(|reply| RoomCommand::Disconnect { connection, reply }).await
    }

    pub async fn snapshot(&self) -> Result<Option<Vec<u8>>, RoomError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    pub async fn status(&self) -> Result<RoomStatus, RoomError> {
        self.request(|reply| RoomCommand::Status { reply }).await
    }
}
