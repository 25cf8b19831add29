//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── DocDispatcher "notes"
//! Client B ──┼── accept/auth ── route ─┼── DocDispatcher "todo"
//! Client C ──┘   (SessionRegistry)     └── DocDispatcher …
//!                                            │
//!                                 broadcast to subscribers
//! ```
//!
//! Each connection gets a reader task (this function) and a writer task fed
//! by a bounded channel; the session registry holds the channel's sender
//! inside a [`TransportGuard`] so closing a session tears the transport down
//! from any code path. Document work never runs on connection tasks; it is
//! queued to the per-document dispatcher, which serializes it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::dispatch::{DispatcherTable, DocCommand};
use crate::protocol::{Envelope, MessageType};
use crate::session::{SessionRegistry, TransportGuard};

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Sessions idle longer than this are evicted.
    pub max_idle: Duration,
    /// How often the idle sweeper runs.
    pub cleanup_interval: Duration,
    /// Outbound frames buffered per connection before backpressure applies.
    pub subscriber_buffer: usize,
    /// How long shutdown waits for dispatcher queues to drain.
    pub drain_timeout: Duration,
    /// Unauthenticated protocol violations tolerated before disconnect.
    pub auth_violation_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_idle: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            subscriber_buffer: 64,
            drain_timeout: Duration::from_secs(5),
            auth_violation_limit: 3,
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub evicted_sessions: u64,
}

/// Startup and runtime failures, separated so the binary can map them to
/// exit codes.
#[derive(Debug)]
pub enum ServerError {
    Bind(std::io::Error),
    Fatal(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "failed to bind listener: {e}"),
            Self::Fatal(e) => write!(f, "fatal server error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    docs: Arc<DispatcherTable>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let docs = Arc::new(DispatcherTable::new(registry.clone()));
        Self {
            config,
            registry,
            docs,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn documents(&self) -> &Arc<DispatcherTable> {
        &self.docs
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Run until the `shutdown` future resolves, then drain dispatcher
    /// queues and close every session.
    pub async fn run_with_shutdown(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(ServerError::Bind)?;
        log::info!("listening on {}", self.config.bind_addr);

        let sweeper = self.spawn_idle_sweeper();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("shutdown requested; draining");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("connection from {addr}");
                        let registry = self.registry.clone();
                        let docs = self.docs.clone();
                        let stats = self.stats.clone();
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            {
                                let mut s = stats.write().await;
                                s.total_connections += 1;
                                s.active_connections += 1;
                            }
                            if let Err(e) =
                                handle_connection(stream, registry, docs, stats.clone(), config)
                                    .await
                            {
                                log::debug!("connection from {addr} ended: {e}");
                            }
                            let mut s = stats.write().await;
                            s.active_connections = s.active_connections.saturating_sub(1);
                        });
                    }
                    Err(e) => log::warn!("accept failed: {e}"),
                },
            }
        }

        sweeper.abort();
        self.docs.shutdown(self.config.drain_timeout).await;
        // Closing with a zero idle bound sweeps every remaining session.
        let _ = self.registry.cleanup_idle(Duration::ZERO);
        Ok(())
    }

    /// Run until the process dies.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_with_shutdown(std::future::pending()).await
    }

    fn spawn_idle_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let docs = self.docs.clone();
        let stats = self.stats.clone();
        let max_idle = self.config.max_idle;
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let closed = registry.cleanup_idle(max_idle);
                if closed.is_empty() {
                    continue;
                }
                log::info!("idle sweep closed {} session(s)", closed.len());
                stats.write().await.evicted_sessions += closed.len() as u64;
                for info in closed {
                    let username = info.username.clone().unwrap_or_default();
                    for doc in &info.documents {
                        if let Some(handle) = docs.get(doc) {
                            handle.try_send(DocCommand::Unsubscribe {
                                session_id: info.id,
                                username: username.clone(),
                            });
                        }
                    }
                }
            }
        })
    }
}

/// Per-connection state held by the reader task.
struct ConnState {
    session_id: Uuid,
    username: Option<String>,
    subscriptions: HashSet<String>,
    violations: u32,
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    docs: Arc<DispatcherTable>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Arc<str>>(config.subscriber_buffer);
    let shutdown = Arc::new(Notify::new());

    let session_id = registry.create_session(TransportGuard::new(out_tx.clone(), shutdown.clone()));

    // Writer task: single writer per socket. Ends on channel close or when
    // the session's guard fires the shutdown signal. The notified future is
    // pinned once so a notification cannot slip between poll cycles.
    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        let closed = writer_shutdown.notified();
        tokio::pin!(closed);
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        if ws_sender.send(Message::text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut closed => break,
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut conn = ConnState {
        session_id,
        username: None,
        subscriptions: HashSet::new(),
        violations: 0,
    };

    let evicted = shutdown.notified();
    tokio::pin!(evicted);
    loop {
        tokio::select! {
            // Session evicted underneath us (idle sweep or admin close).
            _ = &mut evicted => break,

            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(raw))) => {
                    stats.write().await.total_messages += 1;
                    registry.touch(session_id);
                    match Envelope::decode(raw.as_str()) {
                        Ok(envelope) => {
                            if !handle_envelope(&registry, &docs, &config, &mut conn, &out_tx, envelope)
                                .await
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("undecodable frame from {session_id}: {e}");
                            send(&out_tx, &Envelope::sys_error(&e.to_string())).await;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("websocket error on {session_id}: {e}");
                    break;
                }
            },
        }
    }

    // Leave every room, then retire the session (which runs the transport
    // guard's close path and wakes the writer).
    let username = conn.username.clone().unwrap_or_default();
    for doc in &conn.subscriptions {
        if let Some(handle) = docs.get(doc) {
            handle.try_send(DocCommand::Unsubscribe {
                session_id,
                username: username.clone(),
            });
        }
    }
    registry.close_session(session_id);
    let _ = writer.await;
    Ok(())
}

async fn send(out_tx: &mpsc::Sender<Arc<str>>, envelope: &Envelope) {
    match envelope.encode() {
        Ok(json) => {
            let _ = out_tx.send(Arc::from(json.as_str())).await;
        }
        Err(e) => log::error!("failed to encode reply: {e}"),
    }
}

/// Route one decoded envelope. Returns `false` when the connection should
/// close.
async fn handle_envelope(
    registry: &Arc<SessionRegistry>,
    docs: &Arc<DispatcherTable>,
    config: &ServerConfig,
    conn: &mut ConnState,
    out_tx: &mpsc::Sender<Arc<str>>,
    envelope: Envelope,
) -> bool {
    match envelope.kind {
        MessageType::AuthLogin | MessageType::AuthRegister => {
            let Some(username) = envelope.username.as_deref().filter(|u| !u.is_empty()) else {
                send(out_tx, &Envelope::auth_failure("username required")).await;
                return true;
            };
            match registry.authenticate(conn.session_id, username) {
                Ok(()) => {
                    conn.username = Some(username.to_string());
                    let reply =
                        Envelope::auth_success(&conn.session_id.to_string(), username);
                    send(out_tx, &reply).await;
                }
                Err(e) => {
                    send(out_tx, &Envelope::auth_failure(&e.to_string())).await;
                }
            }
            true
        }

        MessageType::AuthLogout => {
            send(out_tx, &Envelope::new(MessageType::SysDisconnect)).await;
            false
        }

        MessageType::SysHeartbeat => {
            // Liveness was refreshed on receipt; echo so the client can
            // measure round trips.
            send(out_tx, &Envelope::heartbeat()).await;
            true
        }

        MessageType::DocCreate => {
            let Some(user) = authenticated(conn, config, out_tx).await else {
                return conn.violations <= config.auth_violation_limit;
            };
            let doc_id = envelope
                .document_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let name = envelope.document_name.clone().unwrap_or_else(|| doc_id.clone());
            let content = envelope.document_content.clone().unwrap_or_default();
            let reply = match docs.create(&doc_id, &name, &content) {
                Some(_) => {
                    log::info!("{user} created document '{doc_id}'");
                    let mut r = Envelope::doc_response(&doc_id);
                    r.document_name = Some(name);
                    r
                }
                None => Envelope::doc_error(&doc_id, "document already exists"),
            };
            send(out_tx, &reply).await;
            true
        }

        MessageType::DocOpen => {
            let Some(user) = authenticated(conn, config, out_tx).await else {
                return conn.violations <= config.auth_violation_limit;
            };
            let Some(doc_id) = envelope.document_id.clone() else {
                send(out_tx, &Envelope::sys_error("documentId required")).await;
                return true;
            };
            let handle = docs.get_or_create(&doc_id);
            if registry.subscribe_document(conn.session_id, &doc_id).is_err() {
                send(out_tx, &Envelope::doc_error(&doc_id, "subscription failed")).await;
                return true;
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = handle
                .send(DocCommand::Subscribe {
                    session_id: conn.session_id,
                    username: user.clone(),
                    sink: out_tx.clone(),
                    reply: reply_tx,
                })
                .await;
            match reply_rx.await {
                Ok(ack) if sent => {
                    conn.subscriptions.insert(doc_id.clone());
                    let mut reply = Envelope::doc_response(&doc_id);
                    reply.document_content = Some(ack.text);
                    reply.document_version = Some(ack.revision);
                    reply.document_list = Some(ack.peers);
                    reply.document_name = docs.name_of(&doc_id);
                    send(out_tx, &reply).await;
                }
                _ => {
                    registry.unsubscribe_document(conn.session_id, &doc_id);
                    send(out_tx, &Envelope::doc_error(&doc_id, "document unavailable")).await;
                }
            }
            true
        }

        MessageType::DocClose => {
            let Some(doc_id) = envelope.document_id.clone() else {
                return true;
            };
            if conn.subscriptions.remove(&doc_id) {
                registry.unsubscribe_document(conn.session_id, &doc_id);
                if let Some(handle) = docs.get(&doc_id) {
                    handle
                        .send(DocCommand::Unsubscribe {
                            session_id: conn.session_id,
                            username: conn.username.clone().unwrap_or_default(),
                        })
                        .await;
                }
            }
            send(out_tx, &Envelope::doc_response(&doc_id)).await;
            true
        }

        MessageType::DocList => {
            let ids: Vec<String> = docs.list().into_iter().map(|(id, _)| id).collect();
            let mut reply = Envelope::new(MessageType::DocResponse);
            reply.document_list = Some(ids);
            reply.success = Some(true);
            send(out_tx, &reply).await;
            true
        }

        MessageType::DocInfo => {
            let Some(doc_id) = envelope.document_id.clone() else {
                send(out_tx, &Envelope::sys_error("documentId required")).await;
                return true;
            };
            let Some(handle) = docs.get(&doc_id) else {
                send(out_tx, &Envelope::doc_error(&doc_id, "no such document")).await;
                return true;
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            handle.send(DocCommand::Info { reply: reply_tx }).await;
            match reply_rx.await {
                Ok(info) => {
                    let mut reply = Envelope::doc_response(&doc_id);
                    reply.document_name = docs.name_of(&doc_id);
                    reply.document_version = Some(info.revision);
                    reply.document_list = Some(info.subscribers);
                    send(out_tx, &reply).await;
                }
                Err(_) => {
                    send(out_tx, &Envelope::doc_error(&doc_id, "document unavailable")).await;
                }
            }
            true
        }

        MessageType::DocDelete => {
            let doc_id = envelope.document_id.clone().unwrap_or_default();
            send(
                out_tx,
                &Envelope::doc_error(&doc_id, "live documents cannot be deleted"),
            )
            .await;
            true
        }

        MessageType::DocRename => {
            let Some(doc_id) = envelope.document_id.clone() else {
                send(out_tx, &Envelope::sys_error("documentId required")).await;
                return true;
            };
            let Some(name) = envelope.document_name.clone() else {
                send(out_tx, &Envelope::doc_error(&doc_id, "documentName required")).await;
                return true;
            };
            let reply = if docs.rename(&doc_id, &name) {
                Envelope::doc_response(&doc_id)
            } else {
                Envelope::doc_error(&doc_id, "no such document")
            };
            send(out_tx, &reply).await;
            true
        }

        MessageType::EditInsert | MessageType::EditDelete | MessageType::EditReplace => {
            let Some(user) = authenticated(conn, config, out_tx).await else {
                return conn.violations <= config.auth_violation_limit;
            };
            let Some(doc_id) = envelope.document_id.clone() else {
                send(out_tx, &Envelope::sys_error("documentId required")).await;
                return true;
            };
            if !conn.subscriptions.contains(&doc_id) {
                send(out_tx, &Envelope::doc_error(&doc_id, "not subscribed")).await;
                return true;
            }
            let op_ref = envelope.operation_id.clone().unwrap_or_default();
            let (op, base_revision) = match (envelope.to_operation(), envelope.base_revision()) {
                (Ok(op), Ok(base)) => (op, base),
                (Err(e), _) | (_, Err(e)) => {
                    send(out_tx, &Envelope::edit_reject(&doc_id, &op_ref, &e.to_string())).await;
                    return true;
                }
            };
            if let Some(handle) = docs.get(&doc_id) {
                handle
                    .send(DocCommand::Submit {
                        session_id: conn.session_id,
                        user,
                        op,
                        base_revision,
                        op_ref,
                    })
                    .await;
            }
            true
        }

        MessageType::SyncRequest => {
            let Some(_user) = authenticated(conn, config, out_tx).await else {
                return conn.violations <= config.auth_violation_limit;
            };
            let Some(doc_id) = envelope.document_id.clone() else {
                send(out_tx, &Envelope::sys_error("documentId required")).await;
                return true;
            };
            if !conn.subscriptions.contains(&doc_id) {
                send(out_tx, &Envelope::doc_error(&doc_id, "not subscribed")).await;
                return true;
            }
            if let Some(handle) = docs.get(&doc_id) {
                handle
                    .send(DocCommand::SyncRequest {
                        session_id: conn.session_id,
                        from_version: envelope.from_version.unwrap_or(0),
                        to_version: envelope.to_version,
                    })
                    .await;
            }
            true
        }

        kind if kind.is_presence() => {
            let Some(user) = authenticated(conn, config, out_tx).await else {
                return conn.violations <= config.auth_violation_limit;
            };
            let Some(doc_id) = envelope.document_id.clone() else {
                return true;
            };
            if !conn.subscriptions.contains(&doc_id) {
                return true;
            }
            // Stamp the authenticated username so presence cannot be spoofed.
            let mut forward = envelope;
            forward.username = Some(user);
            if let (Ok(json), Some(handle)) = (forward.encode(), docs.get(&doc_id)) {
                handle.try_send(DocCommand::Presence {
                    session_id: conn.session_id,
                    frame: json,
                });
            }
            true
        }

        other => {
            log::debug!("unexpected message type {other:?} from {}", conn.session_id);
            send(out_tx, &Envelope::sys_error("unexpected message type")).await;
            true
        }
    }
}

/// The authenticated username, or `None` after recording a violation.
async fn authenticated(
    conn: &mut ConnState,
    config: &ServerConfig,
    out_tx: &mpsc::Sender<Arc<str>>,
) -> Option<String> {
    match &conn.username {
        Some(user) => Some(user.clone()),
        None => {
            conn.violations += 1;
            if conn.violations > config.auth_violation_limit {
                log::warn!(
                    "session {} exceeded unauthenticated violation limit",
                    conn.session_id
                );
            } else {
                send(out_tx, &Envelope::sys_error("not authenticated")).await;
            }
            None
        }
    }
}
