//! End-to-end tests: a real server on a free port, real WebSocket clients.
//!
//! The high-level flows use [`CollabClient`]; the operational-transform
//! scenarios that need exact control over message interleaving drive raw
//! WebSocket connections instead, so the test decides what each "client"
//! has and hasn't seen when it submits.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use collabedit::client::{ClientEvent, CollabClient};
use collabedit::protocol::{Envelope, MessageType};
use collabedit::server::{CollabServer, ServerConfig};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server_with(mut config: ServerConfig) -> u16 {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let server = CollabServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the listener time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_server() -> u16 {
    start_server_with(ServerConfig::default()).await
}

/// Wait (up to 2s) for an event matching `pred`, discarding others.
async fn wait_for(
    rx: &mut tokio::sync::mpsc::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll (up to 2s) until `cond` holds; for assertions about replica state
/// where the event interleaving is not deterministic.
async fn wait_until(cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

/// Connect a client, log in, and open `doc_id`.
async fn join(
    username: &str,
    doc_id: &str,
    port: u16,
) -> (CollabClient, tokio::sync::mpsc::Receiver<ClientEvent>) {
    let mut client = CollabClient::new(username, doc_id, format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    client.login().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Authenticated { .. })).await;
    client.open().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::DocumentOpened { .. })).await;
    (client, events)
}

// ───────────────────────────────────────────────────────────────────
// Raw WebSocket driver for interleaving-sensitive scenarios
// ───────────────────────────────────────────────────────────────────

struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    seq: u64,
}

impl RawClient {
    async fn connect(port: u16) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .expect("connect failed");
        Self { ws, seq: 0 }
    }

    async fn send(&mut self, mut envelope: Envelope) {
        self.seq += 1;
        envelope.sequence_number = self.seq;
        let json = envelope.encode().unwrap();
        self.ws.send(Message::text(json)).await.unwrap();
    }

    /// Next envelope of any kind.
    async fn recv(&mut self) -> Envelope {
        loop {
            let msg = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(raw) = msg {
                return Envelope::decode(raw.as_str()).unwrap();
            }
        }
    }

    /// Next envelope of the given kind, discarding others (e.g. presence).
    async fn recv_kind(&mut self, kind: MessageType) -> Envelope {
        for _ in 0..32 {
            let envelope = self.recv().await;
            if envelope.kind == kind {
                return envelope;
            }
        }
        panic!("never received {kind:?}");
    }

    async fn login(&mut self, username: &str) -> Envelope {
        self.send(Envelope::login(username)).await;
        self.recv().await
    }

    async fn open(&mut self, doc_id: &str) -> Envelope {
        let mut e = Envelope::new(MessageType::DocOpen);
        e.document_id = Some(doc_id.to_string());
        self.send(e).await;
        self.recv_kind(MessageType::DocResponse).await
    }

    async fn create(&mut self, doc_id: &str, content: &str) -> Envelope {
        let mut e = Envelope::new(MessageType::DocCreate);
        e.document_id = Some(doc_id.to_string());
        e.document_name = Some(doc_id.to_string());
        e.document_content = Some(content.to_string());
        self.send(e).await;
        self.recv_kind(MessageType::DocResponse).await
    }
}

// ───────────────────────────────────────────────────────────────────
// Connection and auth
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_login_success() {
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    let reply = alice.login("alice").await;
    assert_eq!(reply.kind, MessageType::AuthSuccess);
    assert_eq!(reply.username.as_deref(), Some("alice"));
    assert!(!reply.session_id.is_empty());
}

#[tokio::test]
async fn test_duplicate_username_rejected() {
    let port = start_server().await;
    let mut first = RawClient::connect(port).await;
    assert_eq!(first.login("carol").await.kind, MessageType::AuthSuccess);

    let mut second = RawClient::connect(port).await;
    let reply = second.login("carol").await;
    assert_eq!(reply.kind, MessageType::AuthFailure);
    assert!(reply.error_message.unwrap().contains("carol"));
}

#[tokio::test]
async fn test_unauthenticated_edits_close_connection() {
    let port = start_server().await;
    let mut client = RawClient::connect(port).await;

    // First violations draw errors; past the limit the server hangs up.
    for _ in 0..3 {
        client
            .send(Envelope::edit_insert("doc", 0, "1", 0, "x"))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply.kind, MessageType::SysError);
    }
    client
        .send(Envelope::edit_insert("doc", 0, "1", 0, "x"))
        .await;
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match client.ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed, "connection should be closed after repeated violations");
}

#[tokio::test]
async fn test_heartbeat_echo() {
    let port = start_server().await;
    let mut client = RawClient::connect(port).await;
    client.send(Envelope::heartbeat()).await;
    let reply = client.recv().await;
    assert_eq!(reply.kind, MessageType::SysHeartbeat);
}

// ───────────────────────────────────────────────────────────────────
// Document management
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_open_list_info() {
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;

    let created = alice.create("notes", "hello").await;
    assert_eq!(created.success, Some(true));

    let dup = alice.create("notes", "").await;
    assert_eq!(dup.success, Some(false));

    let opened = alice.open("notes").await;
    assert_eq!(opened.document_content.as_deref(), Some("hello"));
    assert_eq!(opened.document_version, Some(0));
    assert_eq!(opened.document_list.as_deref(), Some(&["alice".to_string()][..]));

    let mut e = Envelope::new(MessageType::DocList);
    alice.send(e.clone()).await;
    let list = alice.recv_kind(MessageType::DocResponse).await;
    assert!(list.document_list.unwrap().contains(&"notes".to_string()));

    e = Envelope::new(MessageType::DocInfo);
    e.document_id = Some("notes".to_string());
    alice.send(e).await;
    let info = alice.recv_kind(MessageType::DocResponse).await;
    assert_eq!(info.document_version, Some(0));
    assert_eq!(info.document_name.as_deref(), Some("notes"));
}

#[tokio::test]
async fn test_rename_and_delete_semantics() {
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;
    alice.create("doc", "x").await;

    let mut e = Envelope::new(MessageType::DocRename);
    e.document_id = Some("doc".to_string());
    e.document_name = Some("renamed".to_string());
    alice.send(e).await;
    let reply = alice.recv_kind(MessageType::DocResponse).await;
    assert_eq!(reply.success, Some(true));

    let mut e = Envelope::new(MessageType::DocDelete);
    e.document_id = Some("doc".to_string());
    alice.send(e).await;
    let reply = alice.recv_kind(MessageType::DocResponse).await;
    assert_eq!(reply.success, Some(false));
}

// ───────────────────────────────────────────────────────────────────
// OT scenarios with controlled interleaving
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_inserts_converge_with_username_order() {
    // Initial "ab"; alice and bob both insert at position 1 against base 0.
    // alice sorts before bob, so both replicas must end at "aXYb".
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;
    alice.create("doc", "ab").await;
    alice.open("doc").await;

    let mut bob = RawClient::connect(port).await;
    bob.login("bob").await;
    bob.open("doc").await;

    // Both edits are authored against revision 0; alice's reaches the
    // server first.
    alice
        .send(Envelope::edit_insert("doc", 0, "1", 1, "X"))
        .await;
    let ack = alice.recv_kind(MessageType::EditApply).await;
    assert_eq!(ack.document_version, Some(1));

    // Bob sees alice's op as committed, then submits his own stale edit.
    let to_bob = bob.recv_kind(MessageType::EditInsert).await;
    assert_eq!(to_bob.position, Some(1));
    assert_eq!(to_bob.text.as_deref(), Some("X"));

    bob.send(Envelope::edit_insert("doc", 0, "1", 1, "Y")).await;
    let ack = bob.recv_kind(MessageType::EditApply).await;
    assert_eq!(ack.document_version, Some(2));

    // Alice sees bob's op transformed past her insert.
    let to_alice = alice.recv_kind(MessageType::EditInsert).await;
    assert_eq!(to_alice.position, Some(2));
    assert_eq!(to_alice.text.as_deref(), Some("Y"));

    // Server state settles at "aXYb".
    let mut e = Envelope::new(MessageType::DocInfo);
    e.document_id = Some("doc".to_string());
    alice.send(e).await;
    let info = alice.recv_kind(MessageType::DocResponse).await;
    assert_eq!(info.document_version, Some(2));
}

#[tokio::test]
async fn test_insert_inside_concurrent_delete_clamps() {
    // Initial "hello". alice deletes [1,4) first; bob's insert at 3 was
    // authored against revision 0 and clamps to position 1. Server text
    // becomes "h_o".
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;
    alice.create("doc", "hello").await;
    alice.open("doc").await;

    let mut bob = RawClient::connect(port).await;
    bob.login("bob").await;
    bob.open("doc").await;

    alice
        .send(Envelope::edit_delete("doc", 0, "1", 1, 3))
        .await;
    alice.recv_kind(MessageType::EditApply).await;
    // Wait until bob has seen the delete, so his stale submission is truly
    // the later one at the server.
    bob.recv_kind(MessageType::EditDelete).await;

    bob.send(Envelope::edit_insert("doc", 0, "9", 3, "_")).await;
    let ack = bob.recv_kind(MessageType::EditApply).await;
    assert_eq!(ack.document_version, Some(2));

    let seen = alice.recv_kind(MessageType::EditInsert).await;
    assert_eq!(seen.position, Some(1));
    assert_eq!(seen.text.as_deref(), Some("_"));

    // A fresh subscriber reads the settled text.
    let mut carol = RawClient::connect(port).await;
    carol.login("carol").await;
    let opened = carol.open("doc").await;
    assert_eq!(opened.document_content.as_deref(), Some("h_o"));
    assert_eq!(opened.document_version, Some(2));
}

#[tokio::test]
async fn test_divergent_base_rejected_without_side_effects() {
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;
    alice.create("doc", "ab").await;
    alice.open("doc").await;

    let mut bob = RawClient::connect(port).await;
    bob.login("bob").await;
    bob.open("doc").await;

    alice
        .send(Envelope::edit_insert("doc", 0, "5", 100, "x"))
        .await;
    let nack = alice.recv_kind(MessageType::EditReject).await;
    assert_eq!(nack.success, Some(false));
    assert_eq!(nack.operation_id.as_deref(), Some("5"));

    // Revision unchanged and bob saw nothing.
    let mut e = Envelope::new(MessageType::DocInfo);
    e.document_id = Some("doc".to_string());
    alice.send(e).await;
    let info = alice.recv_kind(MessageType::DocResponse).await;
    assert_eq!(info.document_version, Some(0));

    bob.send(Envelope::heartbeat()).await;
    let next = bob.recv().await;
    assert_eq!(next.kind, MessageType::SysHeartbeat);
}

#[tokio::test]
async fn test_sync_request_replays_missed_operations() {
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;
    alice.create("doc", "").await;
    alice.open("doc").await;

    for (i, ch) in ["a", "b", "c"].iter().enumerate() {
        alice
            .send(Envelope::edit_insert("doc", i as u64, &format!("{i}"), i, ch))
            .await;
        alice.recv_kind(MessageType::EditApply).await;
    }

    alice.send(Envelope::sync_request("doc", 1, None)).await;
    let resp = alice.recv_kind(MessageType::SyncResponse).await;
    assert_eq!(resp.from_version, Some(1));
    assert_eq!(resp.to_version, Some(3));
    assert_eq!(resp.operations.unwrap().len(), 2);

    // A from-version past the log falls back to a full snapshot.
    alice
        .send(Envelope::sync_request("doc", u64::MAX, None))
        .await;
    let state = alice.recv_kind(MessageType::SyncState).await;
    assert_eq!(state.document_state.as_deref(), Some("abc"));
    assert_eq!(state.document_version, Some(3));
}

// ───────────────────────────────────────────────────────────────────
// High-level client flows
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_edit_propagation() {
    let port = start_server().await;
    let (alice, mut alice_events) = join("alice", "shared", port).await;
    let (bob, mut bob_events) = join("bob", "shared", port).await;
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::PeerJoined { .. })).await;

    alice.insert(0, "hello").await.unwrap();
    assert_eq!(alice.text(), "hello");

    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::RemoteEdit { .. })).await;

    assert_eq!(bob.text(), "hello");
    assert_eq!(alice.revision(), 1);
    assert_eq!(bob.revision(), 1);
}

#[tokio::test]
async fn test_client_concurrent_edits_converge() {
    let port = start_server().await;
    let (alice, mut alice_events) = join("alice", "shared", port).await;
    let (bob, mut bob_events) = join("bob", "shared", port).await;
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::PeerJoined { .. })).await;

    // Both edit before seeing each other's operation; the ACK and remote
    // edit reach each side in either order, so poll replica state instead.
    alice.insert(0, "abc").await.unwrap();
    bob.insert(0, "xyz").await.unwrap();
    wait_until(|| alice.revision() == 2 && bob.revision() == 2).await;
    drop(bob_events);

    assert_eq!(alice.text(), bob.text(), "replicas diverged");
    assert_eq!(alice.revision(), 2);
    assert_eq!(bob.revision(), 2);
    // alice < bob, so her text sorts first at the shared insertion point.
    assert_eq!(alice.text(), "abcxyz");
}

#[tokio::test]
async fn test_client_undo_after_remote_edit() {
    // U types "foo" one character at a time; R prepends "X"; three undos
    // leave exactly "X" everywhere.
    let port = start_server().await;
    let (u, mut u_events) = join("u", "shared", port).await;
    let (r, mut r_events) = join("r", "shared", port).await;
    wait_for(&mut u_events, |e| matches!(e, ClientEvent::PeerJoined { .. })).await;

    for (i, ch) in ["f", "o", "o"].iter().enumerate() {
        u.insert(i, ch).await.unwrap();
        wait_for(&mut u_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    }
    for _ in 0..3 {
        wait_for(&mut r_events, |e| matches!(e, ClientEvent::RemoteEdit { .. })).await;
    }
    assert_eq!(r.text(), "foo");

    r.insert(0, "X").await.unwrap();
    wait_for(&mut r_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    wait_for(&mut u_events, |e| matches!(e, ClientEvent::RemoteEdit { .. })).await;
    assert_eq!(u.text(), "Xfoo");

    for _ in 0..3 {
        assert!(u.undo().await.unwrap().is_some());
        wait_for(&mut u_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    }
    assert_eq!(u.text(), "X");
    assert!(u.undo().await.unwrap().is_none());

    for _ in 0..3 {
        wait_for(&mut r_events, |e| matches!(e, ClientEvent::RemoteEdit { .. })).await;
    }
    assert_eq!(r.text(), "X");
}

#[tokio::test]
async fn test_client_replace_commits_one_revision_and_undoes_atomically() {
    let port = start_server().await;
    let (alice, mut alice_events) = join("alice", "shared", port).await;

    alice.insert(0, "hello world").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Acked { .. })).await;

    alice.replace(0, 5, "goodbye").await.unwrap();
    assert_eq!(alice.text(), "goodbye world");
    let acked = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    match acked {
        ClientEvent::Acked { revision, .. } => assert_eq!(revision, 2),
        _ => unreachable!(),
    }

    alice.undo().await.unwrap().unwrap();
    assert_eq!(alice.text(), "hello world");
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    assert_eq!(alice.revision(), 3);
}

#[tokio::test]
async fn test_rejected_edit_then_snapshot_recovery() {
    // A raw client whose replica has drifted submits an impossible edit,
    // draws a NACK, and recovers with a full snapshot, the flow the
    // engine's nack/reset path automates.
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;
    alice.create("doc", "short").await;
    alice.open("doc").await;

    alice
        .send(Envelope::edit_insert("doc", 0, "3", 99, "!"))
        .await;
    let nack = alice.recv_kind(MessageType::EditReject).await;
    assert_eq!(nack.operation_id.as_deref(), Some("3"));

    alice
        .send(Envelope::sync_request("doc", u64::MAX, None))
        .await;
    let state = alice.recv_kind(MessageType::SyncState).await;
    assert_eq!(state.document_state.as_deref(), Some("short"));
    assert_eq!(state.document_version, Some(0));
}

#[tokio::test]
async fn test_presence_relayed_between_clients() {
    let port = start_server().await;
    let (alice, mut alice_events) = join("alice", "shared", port).await;
    let (bob, mut bob_events) = join("bob", "shared", port).await;
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::PeerJoined { .. })).await;

    alice.cursor(3).await.unwrap();
    let seen = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::RemoteCursor { .. })).await;
    match seen {
        ClientEvent::RemoteCursor { username, position } => {
            assert_eq!(username, "alice");
            assert_eq!(position, 3);
        }
        _ => unreachable!(),
    }

    bob.selection(1, 4).await.unwrap();
    let seen = wait_for(&mut alice_events, |e| {
        matches!(e, ClientEvent::RemoteSelection { .. })
    })
    .await;
    match seen {
        ClientEvent::RemoteSelection { username, start, end } => {
            assert_eq!(username, "bob");
            assert_eq!(start, 1);
            assert_eq!(end, 4);
        }
        _ => unreachable!(),
    }
}

// ───────────────────────────────────────────────────────────────────
// Session lifecycle
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_session_evicted_and_username_freed() {
    let config = ServerConfig {
        max_idle: Duration::from_millis(100),
        cleanup_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let port = start_server_with(config).await;

    let mut alice = RawClient::connect(port).await;
    assert_eq!(alice.login("alice").await.kind, MessageType::AuthSuccess);
    alice.create("doc", "").await;
    alice.open("doc").await;

    // Idle past the limit; the sweeper closes the session and the server
    // shuts the transport.
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match alice.ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed, "idle session should have been disconnected");

    // The username is free again for a new session.
    let mut again = RawClient::connect(port).await;
    assert_eq!(again.login("alice").await.kind, MessageType::AuthSuccess);
    // And the membership index no longer lists the evicted session.
    let mut e = Envelope::new(MessageType::DocInfo);
    e.document_id = Some("doc".to_string());
    again.send(e).await;
    let info = again.recv_kind(MessageType::DocResponse).await;
    assert_eq!(info.document_list.as_deref(), Some(&[][..]));
}

#[tokio::test]
async fn test_heartbeats_keep_session_alive() {
    let config = ServerConfig {
        max_idle: Duration::from_millis(200),
        cleanup_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let port = start_server_with(config).await;

    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;

    // Heartbeat at half the idle limit: the session must stay up.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        alice.send(Envelope::heartbeat()).await;
        let reply = alice.recv().await;
        assert_eq!(reply.kind, MessageType::SysHeartbeat);
    }
}

#[tokio::test]
async fn test_logout_closes_session() {
    let port = start_server().await;
    let mut alice = RawClient::connect(port).await;
    alice.login("alice").await;
    alice.send(Envelope::new(MessageType::AuthLogout)).await;
    let reply = alice.recv().await;
    assert_eq!(reply.kind, MessageType::SysDisconnect);

    // Name free immediately afterwards.
    let mut again = RawClient::connect(port).await;
    assert_eq!(again.login("alice").await.kind, MessageType::AuthSuccess);
}
