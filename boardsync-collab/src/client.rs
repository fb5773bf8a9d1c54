//! WebSocket sync client: the transport side of a client session.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) with status events
//! - The two-step replica handshake and a `Synced` signal
//! - Update and awareness send/receive
//!
//! Nothing is queued while disconnected: the replica keeps every local
//! edit and the handshake on the next connect exchanges whatever the other
//! side lacks.
//!
//! Each `connect` starts a new epoch. Reader tasks of earlier epochs stay
//! silent, so a late close of an old socket never reaches the event stream
//! after the new connection's events.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{AwarenessUpdate, MessageType, PeerInfo, ProtocolError, SyncMessage};

const CHANNEL_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Status(ConnectionState),
    /// `true` after the first `SyncStep2` of a connection; `false` when the
    /// connection is lost.
    Synced(bool),
    /// The server's answer to our state vector. Emitted before `Synced(true)`.
    SyncStep2 { update: Vec<u8> },
    /// The server asks for what it lacks; answer with a `SyncStep2`.
    SyncRequest { state_vector: Vec<u8> },
    /// Incremental update relayed from another connection.
    Update { peer_id: Uuid, update: Vec<u8> },
    Awareness(AwarenessUpdate),
    /// The room's complete awareness aggregate, received on join.
    AwarenessSnapshot(AwarenessUpdate),
    PeerLeft(Uuid),
}

/// The sync client.
pub struct SyncClient {
    peer_info: PeerInfo,
    room: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Per-connection counter for outgoing updates.
    clock: AtomicU64,
    epoch: Arc<AtomicU64>,
    /// Whether the current connection has completed its handshake.
    synced: Arc<AtomicBool>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            peer_info,
            room: room.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: AtomicU64::new(0),
            epoch: Arc::new(AtomicU64::new(0)),
            synced: Arc::new(AtomicBool::new(false)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the room.
    ///
    /// Spawns a writer and a reader task. Call [`Self::send_sync_step1`]
    /// afterwards to start the handshake. An open connection is closed
    /// first.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.outgoing_tx.is_some() {
            self.disconnect().await;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.synced.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting).await;

        let url = format!("{}/{}", self.server_url, self.room);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected).await;
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel; close when it closes.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        out_tx
            .send(SyncMessage::join(&self.peer_info, &self.room)?.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);
        self.clock.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected).await;

        // Reader task: turn incoming messages into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current = self.epoch.clone();
        let synced = self.synced.clone();
        let peer_id = self.peer_info.peer_id;
        tokio::spawn(async move {
            let is_current = || current.load(Ordering::SeqCst) == epoch;
            while let Some(msg) = ws_reader.next().await {
                if !is_current() {
                    return;
                }
                let bytes: Vec<u8> = match msg {
                    Ok(Message::Binary(data)) => data.into(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let sync_msg = match SyncMessage::decode(&bytes) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Dropping undecodable message: {e}");
                        continue;
                    }
                };
                if sync_msg.peer_id == peer_id {
                    continue;
                }

                let mut events = Vec::with_capacity(2);
                match sync_msg.msg_type {
                    MessageType::SyncStep2 => {
                        events.push(SyncEvent::SyncStep2 {
                            update: sync_msg.payload,
                        });
                        if !synced.swap(true, Ordering::SeqCst) {
                            events.push(SyncEvent::Synced(true));
                        }
                    }
                    MessageType::SyncStep1 => events.push(SyncEvent::SyncRequest {
                        state_vector: sync_msg.payload,
                    }),
                    MessageType::Update => events.push(SyncEvent::Update {
                        peer_id: sync_msg.peer_id,
                        update: sync_msg.payload,
                    }),
                    MessageType::Awareness => match sync_msg.awareness_update() {
                        Ok(update) => events.push(SyncEvent::Awareness(update)),
                        Err(e) => log::warn!("Bad awareness payload: {e}"),
                    },
                    MessageType::AwarenessSnapshot => match sync_msg.awareness_update() {
                        Ok(aggregate) => events.push(SyncEvent::AwarenessSnapshot(aggregate)),
                        Err(e) => log::warn!("Bad awareness snapshot: {e}"),
                    },
                    MessageType::PeerLeft => events.push(SyncEvent::PeerLeft(sync_msg.peer_id)),
                    MessageType::Pong => log::trace!("Pong"),
                    other => log::debug!("Unexpected {other:?} from server"),
                }
                for event in events {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            if !is_current() {
                return;
            }
            *state.write().await = ConnectionState::Disconnected;
            if synced.swap(false, Ordering::SeqCst) {
                let _ = event_tx.send(SyncEvent::Synced(false)).await;
            }
            let _ = event_tx
                .send(SyncEvent::Status(ConnectionState::Disconnected))
                .await;
        });

        Ok(())
    }

    /// Close the connection. The server treats it as a departure.
    ///
    /// Emits `Synced(false)` (if the handshake had completed) and the
    /// disconnected status right away; the reader of the closed socket
    /// stays silent.
    pub async fn disconnect(&mut self) {
        if self.outgoing_tx.take().is_none() {
            return;
        }
        log::debug!("Disconnecting {} from room {}", self.peer_info.peer_id, self.room);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Disconnected;
        if self.synced.swap(false, Ordering::SeqCst) {
            self.notify(SyncEvent::Synced(false));
        }
        self.notify(SyncEvent::Status(ConnectionState::Disconnected));
    }

    /// Queue an event without waiting; the owner may be the one calling.
    fn notify(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("Dropped client event: {e}");
        }
    }

    /// Start the handshake with our state vector.
    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step1(self.peer_info.peer_id, &self.room, state_vector))
            .await
    }

    /// Answer a [`SyncEvent::SyncRequest`].
    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step2(self.peer_info.peer_id, &self.room, diff))
            .await
    }

    /// Send an incremental replica update.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(SyncMessage::update(self.peer_info.peer_id, &self.room, clock, update))
            .await
    }

    /// Send awareness entries. Dropped silently while offline.
    pub async fn send_awareness(&self, update: &AwarenessUpdate) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let clock = self.clock.load(Ordering::Relaxed);
        let msg = SyncMessage::awareness(self.peer_info.peer_id, &self.room, clock, update)?;
        self.send(msg).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let Some(tx) = self.outgoing_tx.as_ref() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        if self.connection_state().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
        let _ = self.event_tx.send(SyncEvent::Status(state)).await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Updates sent on the current connection.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }
}
