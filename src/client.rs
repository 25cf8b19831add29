//! WebSocket client: a [`ClientEngine`] replica wired to the server.
//!
//! The client applies edits locally first (instant echo), then ships them
//! one at a time; remote operations and ACKs feed back into the engine,
//! which keeps the replica convergent. Application code consumes
//! [`ClientEvent`]s from the channel returned by
//! [`take_event_rx`](CollabClient::take_event_rx).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::ClientEngine;
use crate::operation::{OpKind, Operation};
use crate::protocol::{Envelope, MessageType, ProtocolError};

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Authenticated { session_id: String },
    AuthFailed { reason: String },
    DocumentOpened { doc_id: String, revision: u64 },
    /// A remote operation was integrated; the local text changed.
    RemoteEdit { revision: u64 },
    /// One of our operations committed.
    Acked { op_id: i64, revision: u64 },
    /// One of our operations was refused; a resync is underway.
    Rejected { op_id: i64, reason: String },
    /// The replica was replaced by an authoritative snapshot.
    Resynced { revision: u64 },
    PeerJoined { username: String },
    PeerLeft { username: String },
    RemoteCursor { username: String, position: usize },
    RemoteSelection { username: String, start: usize, end: usize },
    ServerError { message: String },
    Disconnected,
}

/// Connection-level client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

struct Shared {
    engine: Mutex<ClientEngine>,
    session_id: Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
}

/// A connected collaborator on one document.
pub struct CollabClient {
    username: String,
    client_id: String,
    server_url: String,
    doc_id: String,
    shared: Arc<Shared>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    seq: Arc<AtomicU64>,
}

impl CollabClient {
    pub fn new(
        username: impl Into<String>,
        doc_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let username = username.into();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id: Uuid::new_v4().to_string(),
            server_url: server_url.into(),
            doc_id: doc_id.into(),
            shared: Arc::new(Shared {
                engine: Mutex::new(ClientEngine::new(username.clone())),
                session_id: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
            }),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            seq: Arc::new(AtomicU64::new(0)),
            username,
        }
    }

    /// Take the event receiver; callable once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Current replica text.
    pub fn text(&self) -> String {
        lock(&self.shared.engine).text().to_string()
    }

    /// Last integrated server revision.
    pub fn revision(&self) -> u64 {
        lock(&self.shared.engine).revision()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared.engine).pending_len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Connect, spawning the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|e| ProtocolError::Malformed(format!("connect failed: {e}")))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender
                    .send(tokio_tungstenite::tungstenite::Message::text(frame))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        *lock(&self.shared.state) = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task.
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        let reply_tx = out_tx;
        let client_id = self.client_id.clone();
        let doc_id = self.doc_id.clone();
        let seq = self.seq.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Text(raw)) => {
                        match Envelope::decode(raw.as_str()) {
                            Ok(envelope) => {
                                handle_incoming(
                                    &shared, &event_tx, &reply_tx, &client_id, &doc_id, &seq,
                                    envelope,
                                )
                                .await;
                            }
                            Err(e) => {
                                log::warn!("undecodable frame from server: {e}");
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *lock(&shared.state) = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Authenticate with the username given at construction.
    pub async fn login(&self) -> Result<(), ProtocolError> {
        self.send_envelope(Envelope::login(&self.username)).await
    }

    /// Create the document on the server (optionally seeded).
    pub async fn create_document(&self, name: &str, content: &str) -> Result<(), ProtocolError> {
        let mut e = Envelope::new(MessageType::DocCreate);
        e.document_id = Some(self.doc_id.clone());
        e.document_name = Some(name.to_string());
        e.document_content = Some(content.to_string());
        self.send_envelope(e).await
    }

    /// Open (subscribe to) the document.
    pub async fn open(&self) -> Result<(), ProtocolError> {
        let mut e = Envelope::new(MessageType::DocOpen);
        e.document_id = Some(self.doc_id.clone());
        self.send_envelope(e).await
    }

    /// Insert text at `position`: applied locally at once, shipped when the
    /// wire is free.
    pub async fn insert(&self, position: usize, text: &str) -> Result<i64, ProtocolError> {
        let id = lock(&self.shared.engine)
            .insert(position, text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.pump_outgoing().await?;
        Ok(id)
    }

    /// Delete `length` codepoints at `position`.
    pub async fn delete(&self, position: usize, length: usize) -> Result<i64, ProtocolError> {
        let id = lock(&self.shared.engine)
            .delete(position, length)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.pump_outgoing().await?;
        Ok(id)
    }

    /// Replace a range atomically.
    pub async fn replace(
        &self,
        position: usize,
        length: usize,
        text: &str,
    ) -> Result<i64, ProtocolError> {
        let id = lock(&self.shared.engine)
            .replace(position, length, text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.pump_outgoing().await?;
        Ok(id)
    }

    /// Undo the latest local edit; the inverse ships like a normal edit.
    pub async fn undo(&self) -> Result<Option<i64>, ProtocolError> {
        let id = lock(&self.shared.engine).undo();
        if id.is_some() {
            self.pump_outgoing().await?;
        }
        Ok(id)
    }

    /// Reinstate the latest undone edit.
    pub async fn redo(&self) -> Result<Option<i64>, ProtocolError> {
        let id = lock(&self.shared.engine).redo();
        if id.is_some() {
            self.pump_outgoing().await?;
        }
        Ok(id)
    }

    /// Share this user's cursor position.
    pub async fn cursor(&self, position: usize) -> Result<(), ProtocolError> {
        self.send_envelope(Envelope::presence_cursor(&self.doc_id, &self.username, position))
            .await
    }

    /// Share this user's selection.
    pub async fn selection(&self, start: usize, end: usize) -> Result<(), ProtocolError> {
        self.send_envelope(Envelope::presence_selection(
            &self.doc_id,
            &self.username,
            start,
            end,
        ))
        .await
    }

    /// Protocol-level heartbeat.
    pub async fn heartbeat(&self) -> Result<(), ProtocolError> {
        self.send_envelope(Envelope::heartbeat()).await
    }

    async fn pump_outgoing(&self) -> Result<(), ProtocolError> {
        let outgoing = lock(&self.shared.engine).next_outgoing();
        if let Some(out) = outgoing {
            let envelope = edit_envelope(&self.doc_id, &out.op, out.base_revision);
            self.send_envelope(envelope).await?;
        }
        Ok(())
    }

    async fn send_envelope(&self, mut envelope: Envelope) -> Result<(), ProtocolError> {
        envelope.client_id = self.client_id.clone();
        if let Some(session) = lock(&self.shared.session_id).clone() {
            envelope.session_id = session;
        }
        envelope.sequence_number = self.seq.fetch_add(1, Ordering::Relaxed);
        let json = envelope.encode()?;
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or_else(|| ProtocolError::Malformed("not connected".to_string()))?;
        tx.send(json)
            .await
            .map_err(|_| ProtocolError::Malformed("connection closed".to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Build the submission envelope for an operation.
fn edit_envelope(doc_id: &str, op: &Operation, base_revision: u64) -> Envelope {
    let op_ref = op.id.to_string();
    match &op.kind {
        OpKind::Insert { position, text } => {
            Envelope::edit_insert(doc_id, base_revision, &op_ref, *position, text)
        }
        OpKind::Delete { position, length, .. } => {
            Envelope::edit_delete(doc_id, base_revision, &op_ref, *position, *length)
        }
        OpKind::Composite { .. } => {
            let mut e = Envelope::new(MessageType::EditReplace);
            e.document_id = Some(doc_id.to_string());
            e.document_version = Some(base_revision);
            e.operation_id = Some(op_ref);
            e.operations = Some(vec![op.clone()]);
            e
        }
    }
}

async fn handle_incoming(
    shared: &Arc<Shared>,
    event_tx: &mpsc::Sender<ClientEvent>,
    reply_tx: &mpsc::Sender<String>,
    client_id: &str,
    doc_id: &str,
    seq: &Arc<AtomicU64>,
    envelope: Envelope,
) {
    let event = match envelope.kind {
        MessageType::AuthSuccess => {
            let session = envelope.session_id.clone();
            *lock(&shared.session_id) = Some(session.clone());
            Some(ClientEvent::Authenticated {
                session_id: session,
            })
        }
        MessageType::AuthFailure => Some(ClientEvent::AuthFailed {
            reason: envelope
                .error_message
                .clone()
                .unwrap_or_else(|| "authentication failed".to_string()),
        }),

        MessageType::DocResponse => {
            // The open reply carries the snapshot we start editing from.
            match (&envelope.document_content, envelope.document_version) {
                (Some(content), Some(revision)) => {
                    lock(&shared.engine).reset(content.clone(), revision);
                    Some(ClientEvent::DocumentOpened {
                        doc_id: envelope.document_id.clone().unwrap_or_default(),
                        revision,
                    })
                }
                _ => None,
            }
        }

        MessageType::EditInsert | MessageType::EditDelete | MessageType::EditReplace => {
            match (envelope.to_operation(), envelope.document_version) {
                (Ok(op), Some(revision)) => {
                    let result = lock(&shared.engine).integrate_remote(op, revision);
                    match result {
                        Ok(()) => Some(ClientEvent::RemoteEdit { revision }),
                        Err(e) => {
                            // The replica can no longer follow the stream;
                            // ask for a full snapshot.
                            log::warn!("failed to integrate remote operation: {e}");
                            request_snapshot(reply_tx, client_id, doc_id, seq).await;
                            None
                        }
                    }
                }
                _ => None,
            }
        }

        MessageType::EditApply => {
            let op_id = envelope
                .operation_id
                .as_deref()
                .and_then(|s| s.parse::<i64>().ok());
            match (op_id, envelope.document_version) {
                (Some(op_id), Some(revision)) => {
                    let next = {
                        let mut engine = lock(&shared.engine);
                        engine.ack(op_id, revision);
                        engine.next_outgoing()
                    };
                    if let Some(out) = next {
                        let mut e = edit_envelope(doc_id, &out.op, out.base_revision);
                        e.client_id = client_id.to_string();
                        e.sequence_number = seq.fetch_add(1, Ordering::Relaxed);
                        if let Ok(json) = e.encode() {
                            let _ = reply_tx.send(json).await;
                        }
                    }
                    Some(ClientEvent::Acked {
                        op_id,
                        revision,
                    })
                }
                _ => None,
            }
        }

        MessageType::EditReject => {
            let op_id = envelope
                .operation_id
                .as_deref()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            lock(&shared.engine).nack(op_id);
            request_snapshot(reply_tx, client_id, doc_id, seq).await;
            Some(ClientEvent::Rejected {
                op_id,
                reason: envelope
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            })
        }

        MessageType::SyncState => {
            match (&envelope.document_state, envelope.document_version) {
                (Some(text), Some(revision)) => {
                    lock(&shared.engine).reset(text.clone(), revision);
                    Some(ClientEvent::Resynced { revision })
                }
                _ => None,
            }
        }

        MessageType::SyncResponse => {
            match (&envelope.operations, envelope.from_version) {
                (Some(ops), Some(from)) => {
                    let mut engine = lock(&shared.engine);
                    let mut revision = from;
                    for op in ops.clone() {
                        revision += 1;
                        if let Err(e) = engine.integrate_remote(op, revision) {
                            log::warn!("sync replay failed at r{revision}: {e}");
                            break;
                        }
                    }
                    let revision = engine.revision();
                    drop(engine);
                    Some(ClientEvent::RemoteEdit { revision })
                }
                _ => None,
            }
        }

        MessageType::PresenceJoin => envelope.username.clone().map(|username| {
            ClientEvent::PeerJoined { username }
        }),
        MessageType::PresenceLeave => envelope.username.clone().map(|username| {
            ClientEvent::PeerLeft { username }
        }),
        MessageType::PresenceCursor => match (&envelope.username, envelope.cursor_position) {
            (Some(username), Some(position)) => Some(ClientEvent::RemoteCursor {
                username: username.clone(),
                position,
            }),
            _ => None,
        },
        MessageType::PresenceSelection => {
            match (&envelope.username, envelope.selection_start, envelope.selection_end) {
                (Some(username), Some(start), Some(end)) => Some(ClientEvent::RemoteSelection {
                    username: username.clone(),
                    start,
                    end,
                }),
                _ => None,
            }
        }

        MessageType::SysError => Some(ClientEvent::ServerError {
            message: envelope
                .error_message
                .clone()
                .unwrap_or_else(|| "server error".to_string()),
        }),
        MessageType::SysDisconnect => Some(ClientEvent::Disconnected),
        MessageType::SysHeartbeat => None,
        _ => None,
    };

    if let Some(event) = event {
        let _ = event_tx.send(event).await;
    }
}

/// Ask for a full state snapshot: a from-version past any retained log makes
/// the server answer with `SyncState` rather than an operation range.
async fn request_snapshot(
    reply_tx: &mpsc::Sender<String>,
    client_id: &str,
    doc_id: &str,
    seq: &Arc<AtomicU64>,
) {
    let mut e = Envelope::sync_request(doc_id, u64::MAX, None);
    e.client_id = client_id.to_string();
    e.sequence_number = seq.fetch_add(1, Ordering::Relaxed);
    if let Ok(json) = e.encode() {
        let _ = reply_tx.send(json).await;
    }
}
