//! # boardsync-collab: realtime transport, presence and persistence
//!
//! Moves the byte updates produced by `boardsync-core` between peers over
//! WebSockets, mirrors ephemeral presence between them, and keeps one
//! authoritative document per room that is saved and unloaded when idle.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket      ┌─────────────┐
//! │ CollabSession  │ ◄─────────────────► │ SyncServer  │
//! │ store + bridge │     Binary Proto    │ (router)    │
//! │ + SyncClient   │                     └──────┬──────┘
//! └────────────────┘                            │ one actor per room
//!                                        ┌──────┴──────┐
//!                                        │ Room        │──► SnapshotStore
//!                                        │ replica +   │
//!                                        │ awareness + │
//!                                        │ broadcast   │
//!                                        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: per-room fan-out with backpressure
//! - [`room`]: room lifecycle, debounced saves and hibernation
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`presence`]: presence publishing, mirroring and the awareness registry
//! - [`session`]: client-side wiring of store, bridge, presence and client
//! - [`storage`]: snapshot persistence

pub mod broadcast;
pub mod client;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use presence::{
    derive_presence, AwarenessRegistry, CursorColor, PresenceConfig, PresenceMirror,
    PresencePublisher,
};
pub use protocol::{
    AwarenessUpdate, MessageType, PeerInfo, PresenceState, ProtocolError, SyncMessage,
    UserIdentity,
};
pub use room::{ConnectionId, Room, RoomError, RoomHandle, RoomPhase, RoomStatus};
pub use server::{ServerStats, SyncServer};
pub use session::{CollabSession, SessionConfig, SessionError};
pub use storage::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotMetadata, SnapshotStore, StoreConfig,
    StoreError,
};
