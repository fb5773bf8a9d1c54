//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── connection task ──► RoomHandle ──► Room actor (room id)
//! Client B ──┘          ▲                              │
//!                       │                              ├── Replica (authoritative)
//!                       │                              ├── AwarenessRegistry
//!                       │                              ├── SnapshotStore (RocksDB / memory)
//!                       └──── BroadcastGroup ◄─────────┘
//! ```
//!
//! One actor per room id; connection tasks never touch a replica directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::config::ServerConfig;
use crate::protocol::{MessageType, PeerInfo, SyncMessage, UserIdentity};
use crate::room::{ConnectionId, Joined, RoomError, RoomHandle, RoomPhase};
use crate::storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Joins retried when the room's actor retires between lookup and join.
const JOIN_ATTEMPTS: usize = 3;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Rooms currently holding a live document.
    pub active_rooms: usize,
    pub snapshots_saved: u64,
    pub snapshot_failures: u64,
}

/// Lock-free counters shared by connection tasks and room actors.
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
    pub snapshots_saved: AtomicU64,
    pub snapshot_failures: AtomicU64,
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    store: Arc<dyn SnapshotStore>,
    rooms: Mutex<HashMap<String, RoomHandle>>,
    counters: Arc<StatsCounters>,
}

impl Shared {
    /// Get or start the actor for `name`. Retired actors are dropped from
    /// the registry here.
    fn room(&self, name: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.retain(|_, handle| !handle.is_closed());
        rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                log::debug!("Starting actor for room {name}");
                RoomHandle::spawn(name, self.config.clone(), self.store.clone(), self.counters.clone())
            })
            .clone()
    }

    /// Join `name`, starting a fresh actor if the current one retired.
    async fn join(&self, name: &str, info: PeerInfo) -> Result<(RoomHandle, Joined), RoomError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let room = self.room(name);
            match room.connect(info.clone()).await {
                Ok(joined) => return Ok((room, joined)),
                Err(RoomError::Closed) if attempt < JOIN_ATTEMPTS => {
                    log::debug!("Room {name} retired during join, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn handles(&self) -> Vec<RoomHandle> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.values().cloned().collect()
    }
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server; opens RocksDB storage when `storage_path` is set,
    /// otherwise keeps snapshots in memory.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksSnapshotStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemorySnapshotStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing snapshot store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                rooms: Mutex::new(HashMap::new()),
                counters: Arc::new(StatsCounters::default()),
            }),
        }
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle to the actor of `name`, starting it if needed.
    pub fn room(&self, name: &str) -> RoomHandle {
        self.shared.room(name)
    }

    /// Room actors currently registered, retired ones excluded.
    pub fn room_count(&self) -> usize {
        let rooms = self.shared.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.values().filter(|handle| !handle.is_closed()).count()
    }

    pub async fn stats(&self) -> ServerStats {
        let counters = &self.shared.counters;
        let mut active_rooms = 0;
        for handle in self.shared.handles() {
            if let Ok(status) = handle.status().await {
                if status.phase == RoomPhase::Active {
                    active_rooms += 1;
                }
            }
        }
        ServerStats {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: counters.active_connections.load(Ordering::Relaxed),
            total_messages: counters.total_messages.load(Ordering::Relaxed),
            total_bytes: counters.total_bytes.load(Ordering::Relaxed),
            active_rooms,
            snapshots_saved: counters.snapshots_saved.load(Ordering::Relaxed),
            snapshot_failures: counters.snapshot_failures.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.shared.store
    }
}

/// A connection that has joined a room.
struct Membership {
    room: RoomHandle,
    connection: ConnectionId,
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");

    shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let mut membership: Option<Membership> = None;
    let result = serve_connection(ws_stream, addr, &shared, &mut membership).await;

    // The room saves and hibernates before this returns when we were last.
    if let Some(Membership { room, connection }) = membership {
        if let Err(e) = room.disconnect(connection).await {
            log::warn!(
                "Room {} did not acknowledge departure of {}: {e}",
                room.name(),
                connection.peer_id
            );
        }
    }
    shared.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn serve_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    addr: SocketAddr,
    shared: &Shared,
    membership: &mut Option<Membership>,
) -> Result<(), BoxError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;
    let mut superseded: Option<oneshot::Receiver<()>> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        shared.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                        shared.counters.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };

                        let mut outgoing = Vec::new();
                        match (sync_msg.msg_type, membership.as_ref()) {
                            (MessageType::Join, None) => {
                                if sync_msg.room.is_empty() {
                                    log::warn!("Join without room id from {addr}");
                                    break;
                                }
                                let user = sync_msg.join_identity().unwrap_or_else(|e| {
                                    log::debug!("Join from {addr} without identity ({e})");
                                    UserIdentity::new(sync_msg.peer_id.to_string(), "Anonymous", "#888888")
                                });
                                let info = PeerInfo::with_id(sync_msg.peer_id, user);
                                match shared.join(&sync_msg.room, info).await {
                                    Ok((room, joined)) => {
                                        broadcast_rx = Some(joined.receiver);
                                        superseded = Some(joined.superseded);
                                        // Sent even when empty: it replaces the joiner's view.
                                        outgoing.push(SyncMessage::awareness_snapshot(
                                            &sync_msg.room,
                                            &joined.awareness,
                                        )?);
                                        *membership = Some(Membership {
                                            room,
                                            connection: joined.connection,
                                        });
                                    }
                                    Err(e) => {
                                        log::warn!("Rejected {addr} from room {}: {e}", sync_msg.room);
                                        break;
                                    }
                                }
                            }

                            (MessageType::Join, Some(_)) => {
                                log::warn!("Duplicate join from {addr} ignored");
                            }

                            (MessageType::Ping, _) => {
                                outgoing.push(SyncMessage::pong(sync_msg.peer_id));
                            }

                            (_, None) => {
                                log::debug!("{:?} from {addr} before join ignored", sync_msg.msg_type);
                            }

                            (MessageType::SyncStep1, Some(member)) => {
                                match member.room.sync_step1(member.connection, sync_msg.payload).await {
                                    Ok(reply) => {
                                        outgoing.push(SyncMessage::sync_step2(Uuid::nil(), member.room.name(), reply.diff));
                                        outgoing.push(SyncMessage::sync_step1(Uuid::nil(), member.room.name(), reply.state_vector));
                                    }
                                    Err(e) => log::warn!("SyncStep1 from {addr} failed: {e}"),
                                }
                            }

                            (MessageType::SyncStep2 | MessageType::Update, Some(member)) => {
                                if !sync_msg.payload.is_empty() {
                                    member.room.update(member.connection, sync_msg.clock, sync_msg.payload).await?;
                                }
                            }

                            (MessageType::Awareness, Some(member)) => {
                                match sync_msg.awareness_update() {
                                    Ok(update) => {
                                        member.room.awareness(member.connection, sync_msg.clock, update).await?;
                                    }
                                    Err(e) => log::warn!("Bad awareness payload from {addr}: {e}"),
                                }
                            }

                            (other, Some(_)) => {
                                log::debug!("Unhandled message type: {other:?}");
                            }
                        }

                        for msg in outgoing {
                            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            frame = async {
                match broadcast_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match frame {
                    Ok(frame) => {
                        // Never echo a connection's own messages.
                        if membership.as_ref().is_some_and(|m| m.connection.peer_id == frame.origin) {
                            continue;
                        }
                        ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {addr} lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = async {
                match superseded.as_mut() {
                    Some(rx) => {
                        let _ = rx.await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                log::info!("Connection from {addr} superseded by a newer join of the same peer");
                break;
            }
        }
    }

    Ok(())
}
