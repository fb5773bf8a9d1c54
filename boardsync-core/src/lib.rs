//! Document side of boardsync: the record model, the local record store,
//! the CRDT replica and the bridge that keeps the two convergent.
//!
//! Nothing in this crate touches the network. The transport lives in
//! `boardsync-collab` and only moves the byte updates produced here.

pub mod bridge;
pub mod essential;
pub mod record;
pub mod replica;
pub mod store;

pub use bridge::{Bridge, BridgeError, BridgeStatus, PumpReport};
pub use essential::{ensure_essential_records, EnsureOutcome, EssentialRecords};
pub use record::{
    CameraRecord, Cursor, DocumentRecord, InstancePageStateRecord, InstanceRecord, PageRecord,
    PointerRecord, PresenceRecord, Record, RecordError, RecordId, RecordKind, RecordScope,
    ShapeRecord,
};
pub use replica::{ChangeOrigin, Replica, ReplicaChange, ReplicaError, ReplicaObserver};
pub use store::{ChangeBatch, ChangeFilter, ChangeSource, RecordStore, RecordsDiff};
