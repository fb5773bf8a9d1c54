//! Client session context: one replica, one record store, the bridge
//! between them and the presence publisher/mirror, wired to a
//! [`SyncClient`].
//!
//! A session is built and torn down explicitly by its owner; nothing here
//! is global. The owner feeds transport events into
//! [`CollabSession::handle_event`] and calls [`CollabSession::flush`] after
//! mutating the store.

use boardsync_core::{
    Bridge, BridgeError, BridgeStatus, EssentialRecords, PumpReport, RecordError, RecordStore,
    Replica, ReplicaError,
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::presence::{PresenceConfig, PresenceMirror, PresencePublisher};
use crate::protocol::{PeerInfo, ProtocolError, UserIdentity};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub presence: PresenceConfig,
    pub essentials: EssentialRecords,
}

pub struct CollabSession {
    replica: Replica,
    store: RecordStore,
    bridge: Bridge,
    publisher: PresencePublisher,
    mirror: PresenceMirror,
    client: SyncClient,
    events: Option<mpsc::Receiver<SyncEvent>>,
}

impl CollabSession {
    pub fn new(
        server_url: impl Into<String>,
        room: impl Into<String>,
        user: UserIdentity,
        config: SessionConfig,
    ) -> Self {
        let peer = PeerInfo::new(user.clone());
        let mut store = RecordStore::new();
        let bridge = Bridge::new(&mut store, config.essentials);
        let publisher = PresencePublisher::new(&mut store, peer.peer_id, user, config.presence);
        let mirror = PresenceMirror::new(peer.peer_id);
        let mut client = SyncClient::new(peer, room, server_url);
        let events = client.take_event_rx();

        Self {
            replica: Replica::new(),
            store,
            bridge,
            publisher,
            mirror,
            client,
            events,
        }
    }

    /// Connect and start the handshake. Also used to reconnect; edits made
    /// while offline travel in the handshake.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.client.connect().await?;
        self.client.send_sync_step1(self.replica.state_vector()).await?;
        Ok(())
    }

    /// Close the connection but keep the session. Peer presence is
    /// dropped and the bridge degrades until the next sync.
    pub async fn disconnect(&mut self) -> Result<PumpReport, SessionError> {
        self.client.disconnect().await;
        let mut report = PumpReport::default();
        while let Some(event) = self.events.as_mut().and_then(|events| events.try_recv().ok()) {
            report.merge(self.handle_event(event).await?);
        }
        Ok(report)
    }

    pub fn peer_id(&self) -> Uuid {
        self.client.peer_info().peer_id
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Mutate through this; call [`Self::flush`] afterwards.
    pub fn store_mut(&mut self) -> &mut RecordStore {
        &mut self.store
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn status(&self) -> BridgeStatus {
        self.bridge.status()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.client.connection_state().await
    }

    /// Wait up to `wait` for the next transport event and handle it.
    /// Flushes anyway when none arrived and returns false.
    pub async fn process_next(&mut self, wait: Duration) -> Result<bool, SessionError> {
        let event = match self.events.as_mut() {
            Some(events) => tokio::time::timeout(wait, events.recv()).await.ok().flatten(),
            None => None,
        };
        match event {
            Some(event) => {
                self.handle_event(event).await?;
                Ok(true)
            }
            None => {
                self.flush().await?;
                Ok(false)
            }
        }
    }

    /// Apply one transport event, then flush.
    pub async fn handle_event(&mut self, event: SyncEvent) -> Result<PumpReport, SessionError> {
        let mut report = PumpReport::default();
        match event {
            SyncEvent::Status(state) => {
                log::debug!("Session {} transport {:?}", self.peer_id(), state);
                match state {
                    // The server dropped our slot with the old connection.
                    ConnectionState::Connected => self.publisher.reset(),
                    ConnectionState::Disconnected => {
                        self.mirror.teardown(&mut self.store)?;
                    }
                    ConnectionState::Connecting => {}
                }
            }
            SyncEvent::Synced(synced) => {
                if !synced {
                    self.mirror.teardown(&mut self.store)?;
                }
                report = self.bridge.on_sync(synced, &self.replica, &mut self.store)?;
                if !report.integrity_warnings.is_empty() {
                    log::warn!("Integrity diagnostics after sync: {:?}", report.integrity_warnings);
                }
            }
            SyncEvent::SyncStep2 { update } | SyncEvent::Update { update, .. } => {
                self.replica.apply_remote(&update)?;
            }
            SyncEvent::SyncRequest { state_vector } => {
                let diff = self.replica.diff_since(&state_vector)?;
                self.client.send_sync_step2(diff).await?;
            }
            SyncEvent::Awareness(update) => {
                self.mirror.apply(&update, &mut self.store)?;
            }
            SyncEvent::AwarenessSnapshot(aggregate) => {
                self.mirror.replace(&aggregate, &mut self.store)?;
            }
            SyncEvent::PeerLeft(peer_id) => {
                self.mirror.peer_left(peer_id, &mut self.store)?;
            }
        }
        report.merge(self.flush().await?);
        Ok(report)
    }

    /// Pump the bridge, send its updates and any due presence.
    ///
    /// Updates that cannot be sent while offline stay in the replica and
    /// reach the server through the next handshake.
    pub async fn flush(&mut self) -> Result<PumpReport, SessionError> {
        let report = self.bridge.pump(&self.replica, &mut self.store)?;
        for update in self.bridge.take_outbound() {
            match self.client.send_update(update).await {
                Ok(()) => {}
                Err(ProtocolError::ConnectionClosed) => {
                    log::debug!("Offline, update left for the next handshake");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if self.client.connection_state().await == ConnectionState::Connected {
            if let Some(update) = self.publisher.poll(&self.store, Instant::now()) {
                self.client.send_awareness(&update).await?;
            }
        }
        Ok(report)
    }

    /// Stop publishing, drop peer presence and close the connection.
    pub async fn teardown(mut self) -> Result<RecordStore, SessionError> {
        if let Some(removal) = self.publisher.stop() {
            if let Err(e) = self.client.send_awareness(&removal).await {
                log::debug!("Presence removal not sent: {e}");
            }
        }
        self.mirror.teardown(&mut self.store)?;
        self.client.disconnect().await;
        log::debug!("Session {} torn down", self.peer_id());
        Ok(self.store)
    }
}
