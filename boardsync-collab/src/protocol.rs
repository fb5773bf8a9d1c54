//! Binary protocol for replica sync and awareness.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room      │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + str │ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Handshake: the client sends `Join` then `SyncStep1` with its state
//! vector. The server answers `SyncStep2` with everything the client lacks
//! and its own `SyncStep1`, which the client answers with `SyncStep2`.
//! Messages the server originates carry the nil peer id.

use boardsync_core::{Cursor, RecordId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::CursorColor;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector; the receiver answers with `SyncStep2`.
    SyncStep1 = 1,
    /// State diff answering a `SyncStep1`.
    SyncStep2 = 2,
    /// Incremental replica update.
    Update = 3,
    /// Awareness (presence) entries.
    Awareness = 4,
    /// First message on a connection: join a room.
    Join = 5,
    /// A connection left the room.
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// The room's whole awareness aggregate, sent on join. Replaces the
    /// receiver's view instead of merging into it; may be empty.
    AwarenessSnapshot = 9,
}

/// Who is behind a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    /// CSS color string.
    pub color: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
        }
    }

    /// Fresh identity with a stable color derived from its id.
    pub fn generate(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id: id.to_string(),
            name: name.into(),
            color: CursorColor::from_uuid(id).to_css(),
        }
    }
}

/// A connection in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    /// Ephemeral connection id.
    pub peer_id: Uuid,
    pub user: UserIdentity,
}

impl PeerInfo {
    pub fn new(user: UserIdentity) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            user,
        }
    }

    pub fn with_id(peer_id: Uuid, user: UserIdentity) -> Self {
        Self { peer_id, user }
    }
}

/// One connection's presence slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceState {
    pub user: UserIdentity,
    pub cursor: Option<Cursor>,
    pub selection: Vec<RecordId>,
    pub current_page_id: Option<RecordId>,
}

impl PresenceState {
    pub fn new(user: UserIdentity) -> Self {
        Self {
            user,
            cursor: None,
            selection: Vec::new(),
            current_page_id: None,
        }
    }
}

/// Awareness entries keyed by connection id. `None` removes the slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<(Uuid, Option<PresenceState>)>,
}

impl AwarenessUpdate {
    pub fn set(peer_id: Uuid, state: PresenceState) -> Self {
        Self {
            entries: vec![(peer_id, Some(state))],
        }
    }

    pub fn removed(peer_ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            entries: peer_ids.into_iter().map(|id| (id, None)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Per-sender counter for updates.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    pub fn join(peer: &PeerInfo, room: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, peer.peer_id, room, 0, encode_payload(&peer.user)?))
    }

    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, diff)
    }

    pub fn update(peer_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, room, clock, update)
    }

    pub fn awareness(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        update: &AwarenessUpdate,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, peer_id, room, clock, encode_payload(update)?))
    }

    /// Full aggregate for a joining connection; server-originated.
    pub fn awareness_snapshot(room: &str, aggregate: &AwarenessUpdate) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::AwarenessSnapshot,
            Uuid::nil(),
            room,
            0,
            encode_payload(aggregate)?,
        ))
    }

    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Identity carried by a `Join`.
    pub fn join_identity(&self) -> Result<UserIdentity, ProtocolError> {
        self.expect(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    /// Entries carried by an `Awareness` or `AwarenessSnapshot` message.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.msg_type != MessageType::AwarenessSnapshot {
            self.expect(MessageType::Awareness)?;
        }
        decode_payload(&self.payload)
    }

    fn expect(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardsync_core::RecordKind;

    fn alice() -> UserIdentity {
        UserIdentity::new("user-alice", "Alice", "#ff0000")
    }

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::update(peer, "board-1", 42, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.room, "board-1");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_join_carries_identity() {
        let peer = PeerInfo::new(alice());
        let msg = SyncMessage::join(&peer, "board-1").unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.peer_id, peer.peer_id);
        assert_eq!(decoded.join_identity().unwrap(), alice());
    }

    #[test]
    fn test_awareness_entries() {
        let present = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let mut state = PresenceState::new(alice());
        state.cursor = Some(Cursor { x: 10.5, y: -3.0 });
        state.selection = vec![RecordId::new(RecordKind::Shape, 1)];
        state.current_page_id = Some(RecordId::new(RecordKind::Page, "page"));

        let update = AwarenessUpdate {
            entries: vec![(present, Some(state.clone())), (gone, None)],
        };
        let msg = SyncMessage::awareness(present, "board-1", 3, &update).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.awareness_update().unwrap(), update);
    }

    #[test]
    fn test_empty_awareness_snapshot() {
        let msg = SyncMessage::awareness_snapshot("board-1", &AwarenessUpdate::default()).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::AwarenessSnapshot);
        assert!(decoded.peer_id.is_nil());
        assert!(decoded.awareness_update().unwrap().is_empty());
    }

    #[test]
    fn test_payload_accessor_checks_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(
            msg.awareness_update(),
            Err(ProtocolError::InvalidMessageType {
                expected: MessageType::Awareness,
                actual: MessageType::Ping
            })
        ));
        assert!(msg.join_identity().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), "board-1", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 150, "encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_generated_identity_color_is_stable_css() {
        let user = UserIdentity::generate("Bob");
        let id = Uuid::parse_str(&user.id).unwrap();
        assert_eq!(user.color, CursorColor::from_uuid(id).to_css());
        assert!(user.color.starts_with('#'));
        assert_eq!(user.color.len(), 7);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert_eq!(MessageType::Join as u8, 5);
        assert_eq!(MessageType::PeerLeft as u8, 6);
        assert_eq!(MessageType::AwarenessSnapshot as u8, 9);
    }
}
