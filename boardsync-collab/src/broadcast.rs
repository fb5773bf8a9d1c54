//! Fan-out broadcast to the connections of one room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! frames; a lagging receiver drops the oldest frames and recovers through
//! the sync handshake on its next reconnect.
//!
//! Frames carry the sending connection id so a connection can skip its
//! own frames without decoding them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One pre-encoded message on the room channel.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Connection the message came from; nil for server-originated frames.
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames sent while no connection was subscribed.
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Broadcast group for a single room.
///
/// Owned by the room actor, so membership needs no lock; counters are
/// atomics so connection tasks can read them through an `Arc`.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: HashMap<Uuid, PeerInfo>,
    capacity: usize,
    messages_sent: Arc<AtomicU64>,
    messages_dropped: Arc<AtomicU64>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow receiver may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: HashMap::new(),
            capacity,
            messages_sent: Arc::new(AtomicU64::new(0)),
            messages_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Add a connection; returns its receiver.
    pub fn add_peer(&mut self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        self.peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub fn remove_peer(&mut self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    /// Encode and send a message to every subscribed connection.
    ///
    /// Receivers skip frames whose origin is their own connection.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(origin, Arc::new(encoded)))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Frame { origin, bytes }) {
            Ok(count) => count,
            Err(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
