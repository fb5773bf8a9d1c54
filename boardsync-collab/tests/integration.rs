//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real sessions,
//! verifying the full store → replica → server → replica → store pipeline.

use boardsync_collab::presence::presence_record_id;
use boardsync_collab::protocol::{MessageType, PeerInfo, SyncMessage, UserIdentity};
use boardsync_collab::room::{RoomPhase, RoomStatus};
use boardsync_collab::server::SyncServer;
use boardsync_collab::session::{CollabSession, SessionConfig};
use boardsync_collab::ServerConfig;
use boardsync_core::{BridgeStatus, Record, RecordId, RecordKind, RecordScope, Replica, ShapeRecord};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on a free port, return it with its URL.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn session(url: &str, room: &str, name: &str) -> CollabSession {
    CollabSession::new(url, room, UserIdentity::generate(name), SessionConfig::default())
}

/// Process events on every session until `done` holds.
async fn drive<F>(sessions: &mut [&mut CollabSession], done: F)
where
    F: Fn(&[&mut CollabSession]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(&*sessions) {
        assert!(Instant::now() < deadline, "sessions did not reach the expected state in time");
        for session in sessions.iter_mut() {
            session.process_next(Duration::from_millis(10)).await.unwrap();
        }
    }
}

/// Process events for a fixed amount of time.
async fn idle(sessions: &mut [&mut CollabSession], period: Duration) {
    let until = Instant::now() + period;
    while Instant::now() < until {
        for session in sessions.iter_mut() {
            session.process_next(Duration::from_millis(10)).await.unwrap();
        }
    }
}

fn shape_id(n: u32) -> RecordId {
    RecordId::new(RecordKind::Shape, n)
}

fn sticky(n: u32, x: f64, y: f64) -> Record {
    Record::Shape(ShapeRecord::new(
        shape_id(n),
        "event-sticky",
        RecordId::new(RecordKind::Page, "page"),
        x,
        y,
    ))
}

fn document_records(session: &CollabSession) -> Vec<Record> {
    let mut records: Vec<Record> = session.store().of_scope(RecordScope::Document).cloned().collect();
    records.sort_by(|a, b| a.id().as_str().cmp(b.id().as_str()));
    records
}

fn synced(session: &CollabSession) -> bool {
    session.status() == BridgeStatus::Synced
}

/// Poll the room until `done` holds for its status.
async fn wait_for_room<F>(server: &SyncServer, room: &str, done: F) -> RoomStatus
where
    F: Fn(&RoomStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = server.room(room).status().await.unwrap();
        if done(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "room never reached the expected state: {status:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let result = tokio_tungstenite::connect_async(format!("{url}/board")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/board")).await.unwrap();

    let peer = PeerInfo::new(UserIdentity::generate("PingUser"));
    let join = SyncMessage::join(&peer, "board").unwrap().encode().unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();
    let ping = SyncMessage::ping(peer.peer_id).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let pong = timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                let msg = SyncMessage::decode(&data).unwrap();
                if msg.msg_type == MessageType::Pong {
                    return Some(msg);
                }
            }
        }
        None
    })
    .await
    .unwrap();
    assert!(pong.is_some(), "Should receive Pong");
}

#[tokio::test]
async fn test_join_without_room_closes_connection() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/")).await.unwrap();

    let peer = PeerInfo::new(UserIdentity::generate("Nobody"));
    let join = SyncMessage::join(&peer, "").unwrap().encode().unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn test_session_syncs_and_heals_essentials() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let mut alice = session(&url, "board-1", "Alice");
    assert_eq!(alice.status(), BridgeStatus::Loading);

    alice.connect().await.unwrap();
    drive(&mut [&mut alice], |s| synced(&s[0])).await;

    assert!(alice.store().contains(&RecordId::new(RecordKind::Page, "page")));
    assert!(alice.store().contains(&RecordId::new(RecordKind::Document, "document")));
    assert!(alice.replica().contains(&RecordId::new(RecordKind::Page, "page")));

    let status = server.room("board-1").status().await.unwrap();
    assert_eq!(status.phase, RoomPhase::Active);
    assert_eq!(status.peers, 1);
}

#[tokio::test]
async fn test_shape_reaches_late_joiner() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let mut alice = session(&url, "board-1", "Alice");
    alice.connect().await.unwrap();
    drive(&mut [&mut alice], |s| synced(&s[0])).await;

    alice
        .store_mut()
        .put(vec![sticky(1, 120.0, 80.0)])
        .unwrap();
    alice.flush().await.unwrap();
    assert!(alice.replica().contains(&shape_id(1)));

    let mut bob = session(&url, "board-1", "Bob");
    bob.connect().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| s[1].store().contains(&shape_id(1))).await;

    assert_eq!(bob.store().get(&shape_id(1)), Some(&sticky(1, 120.0, 80.0)));
    assert_eq!(document_records(&alice), document_records(&bob));
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let mut alice = session(&url, "board-1", "Alice");
    let mut bob = session(&url, "board-1", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| synced(&s[0]) && synced(&s[1])).await;

    alice.store_mut().put(vec![sticky(1, 0.0, 0.0)]).unwrap();
    bob.store_mut().put(vec![sticky(2, 50.0, 50.0)]).unwrap();
    alice.flush().await.unwrap();
    bob.flush().await.unwrap();

    // Both move shape 2 at once; one of the writes wins everywhere.
    alice.store_mut().put(vec![sticky(2, 10.0, 10.0)]).unwrap();
    bob.store_mut().put(vec![sticky(2, 90.0, 90.0)]).unwrap();
    alice.flush().await.unwrap();
    bob.flush().await.unwrap();

    drive(&mut [&mut alice, &mut bob], |s| {
        let a = document_records(&s[0]);
        a == document_records(&s[1])
            && s[0].store().contains(&shape_id(1))
            && s[0].store().contains(&shape_id(2))
    })
    .await;

    let winner = alice.store().get(&shape_id(2)).and_then(Record::as_shape).unwrap();
    assert!(winner.x == 10.0 || winner.x == 90.0);
}

#[tokio::test]
async fn test_removal_propagates() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let mut alice = session(&url, "board-1", "Alice");
    let mut bob = session(&url, "board-1", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| synced(&s[0]) && synced(&s[1])).await;

    alice.store_mut().put(vec![sticky(1, 0.0, 0.0)]).unwrap();
    alice.flush().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| s[1].store().contains(&shape_id(1))).await;

    bob.store_mut().remove(vec![shape_id(1)]).unwrap();
    bob.flush().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| !s[0].store().contains(&shape_id(1))).await;

    assert!(!alice.replica().contains(&shape_id(1)));
}

#[tokio::test]
async fn test_essentials_created_once_across_sessions() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let mut alice = session(&url, "fresh-board", "Alice");
    let mut bob = session(&url, "fresh-board", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| {
        synced(&s[0]) && synced(&s[1]) && document_records(&s[0]) == document_records(&s[1])
    })
    .await;
    idle(&mut [&mut alice, &mut bob], Duration::from_millis(200)).await;

    for session in [&alice, &bob] {
        assert_eq!(session.store().of_kind(RecordKind::Page).count(), 1);
        assert_eq!(session.store().of_kind(RecordKind::Document).count(), 1);
        assert_eq!(session.replica().len(), 2);
    }
}

#[tokio::test]
async fn test_no_feedback_loop_when_idle() {
    let (server, url) = start_test_server(ServerConfig::default()).await;

    let mut alice = session(&url, "board-1", "Alice");
    let mut bob = session(&url, "board-1", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| synced(&s[0]) && synced(&s[1])).await;

    alice.store_mut().put(vec![sticky(1, 0.0, 0.0)]).unwrap();
    alice.flush().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| s[1].store().contains(&shape_id(1))).await;
    idle(&mut [&mut alice, &mut bob], Duration::from_millis(300)).await;

    let before = server.stats().await.total_messages;
    idle(&mut [&mut alice, &mut bob], Duration::from_millis(300)).await;
    let after = server.stats().await.total_messages;
    assert_eq!(before, after, "Idle sessions must not exchange messages");
}

#[tokio::test]
async fn test_room_full_rejects_extra_peer() {
    let config = ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    };
    let (server, url) = start_test_server(config).await;

    let mut alice = session(&url, "board-1", "Alice");
    alice.connect().await.unwrap();
    drive(&mut [&mut alice], |s| synced(&s[0])).await;

    // The server closes the connection right after the join.
    let mut bob = session(&url, "board-1", "Bob");
    let _ = bob.connect().await;
    idle(&mut [&mut bob], Duration::from_millis(300)).await;

    assert_eq!(bob.status(), BridgeStatus::Loading);
    assert_eq!(server.room("board-1").status().await.unwrap().peers, 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let mut alice = session(&url, "board-a", "Alice");
    let mut bob = session(&url, "board-b", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| synced(&s[0]) && synced(&s[1])).await;

    alice.store_mut().put(vec![sticky(1, 0.0, 0.0)]).unwrap();
    alice.flush().await.unwrap();
    idle(&mut [&mut alice, &mut bob], Duration::from_millis(200)).await;

    assert!(!bob.store().contains(&shape_id(1)));
    assert_ne!(alice.peer_id(), Uuid::nil());
}

// ─── Reconnect ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rejoin_on_new_socket_keeps_room_active() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let peer = PeerInfo::new(UserIdentity::generate("Alice"));
    let join = SyncMessage::join(&peer, "board-1").unwrap().encode().unwrap();

    let (mut old, _) = tokio_tungstenite::connect_async(format!("{url}/board-1")).await.unwrap();
    old.send(Message::Binary(join.clone().into())).await.unwrap();
    wait_for_room(&server, "board-1", |s| s.peers == 1).await;

    // Same peer id on a second socket before the first one is gone.
    let (mut new, _) = tokio_tungstenite::connect_async(format!("{url}/board-1")).await.unwrap();
    new.send(Message::Binary(join.into())).await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match old.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed, "the superseded socket is closed by the server");

    let update = Replica::new().write_local(&[sticky(1, 5.0, 5.0)], &[]).unwrap();
    let msg = SyncMessage::update(peer.peer_id, "board-1", 1, update).encode().unwrap();
    new.send(Message::Binary(msg.into())).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = server.room("board-1").snapshot().await.unwrap();
        let held = snapshot
            .and_then(|bytes| Replica::from_snapshot(&bytes).ok())
            .is_some_and(|replica| replica.contains(&shape_id(1)));
        if held {
            break;
        }
        assert!(Instant::now() < deadline, "update from the new socket was not applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = server.room("board-1").status().await.unwrap();
    assert_eq!(status.phase, RoomPhase::Active);
    assert_eq!(status.peers, 1);

    drop(new);
    wait_for_room(&server, "board-1", |s| s.phase == RoomPhase::Hibernated).await;
    let saved = server.store().get("board-1").unwrap().unwrap();
    assert!(Replica::from_snapshot(&saved).unwrap().contains(&shape_id(1)));
}

#[tokio::test]
async fn test_reconnect_converges_and_clears_stale_presence() {
    let (server, url) = start_test_server(ServerConfig::default()).await;

    let mut alice = session(&url, "board-1", "Alice");
    let mut bob = session(&url, "board-1", "Bob");
    let mut carol = session(&url, "board-1", "Carol");
    for s in [&mut alice, &mut bob, &mut carol] {
        s.connect().await.unwrap();
    }
    drive(&mut [&mut alice, &mut bob, &mut carol], |s| {
        s.iter().all(|session| {
            synced(session) && session.store().of_scope(RecordScope::Presence).count() == 2
        })
    })
    .await;
    let carol_presence = presence_record_id(carol.peer_id());

    alice.disconnect().await.unwrap();
    assert_eq!(alice.status(), BridgeStatus::Degraded);
    assert_eq!(alice.store().of_scope(RecordScope::Presence).count(), 0);

    // Both sides edit while Alice is offline; Carol leaves meanwhile.
    alice.store_mut().put(vec![sticky(1, 10.0, 10.0)]).unwrap();
    alice.flush().await.unwrap();
    bob.store_mut().put(vec![sticky(2, 20.0, 20.0)]).unwrap();
    bob.flush().await.unwrap();
    carol.teardown().await.unwrap();
    drive(&mut [&mut bob], |s| !s[0].store().contains(&carol_presence)).await;
    assert!(!bob.store().contains(&shape_id(1)));

    alice.connect().await.unwrap();
    drive(&mut [&mut alice, &mut bob], |s| {
        synced(&s[0])
            && s[0].store().contains(&shape_id(2))
            && s[1].store().contains(&shape_id(1))
            && s[1].store().contains(&presence_record_id(s[0].peer_id()))
            && s[0].store().contains(&presence_record_id(s[1].peer_id()))
    })
    .await;

    assert_eq!(document_records(&alice), document_records(&bob));
    assert_eq!(alice.store().of_kind(RecordKind::Page).count(), 1);
    assert_eq!(alice.store().of_kind(RecordKind::Document).count(), 1);
    assert!(!alice.store().contains(&carol_presence));
    assert_eq!(alice.store().of_scope(RecordScope::Presence).count(), 1);

    let status = server.room("board-1").status().await.unwrap();
    assert_eq!(status.peers, 2);
    assert_eq!(status.phase, RoomPhase::Active);
}
