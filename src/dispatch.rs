//! Per-document dispatcher: the single-writer actor that serializes every
//! operation touching one document.
//!
//! ```text
//! conn A ──┐
//! conn B ──┼──► mpsc queue ──► DocDispatcher ──► DocumentController
//! conn C ──┘   (total order)        │
//!                                   └──► BroadcastGroup ──► subscribers
//! ```
//!
//! The queue defines the commit order for the document; a command runs to
//! completion before the next is dequeued. Different documents run on
//! independent tasks and never wait on each other. The dispatcher itself
//! never blocks on I/O; outbound frames go through bounded channels with
//! the backpressure policy in [`crate::broadcast`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, FrameClass};
use crate::document::{DocError, DocumentController};
use crate::operation::Operation;
use crate::protocol::Envelope;
use crate::session::SessionRegistry;

/// Capacity of each document's command queue.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Reply to a successful subscribe: the state the new subscriber starts from.
#[derive(Debug)]
pub struct SubscribeAck {
    pub text: String,
    pub revision: u64,
    pub peers: Vec<String>,
}

/// Live metadata about a document.
#[derive(Debug, Clone)]
pub struct DocInfo {
    pub revision: u64,
    pub subscribers: Vec<String>,
}

/// Commands accepted by a document dispatcher.
pub enum DocCommand {
    /// An edit submitted by a subscriber, authored against `base_revision`.
    Submit {
        session_id: Uuid,
        user: String,
        op: Operation,
        base_revision: u64,
        /// The submitter's operation id, echoed in the ACK/NACK.
        op_ref: String,
    },
    Undo {
        session_id: Uuid,
        user: String,
    },
    Redo {
        session_id: Uuid,
        user: String,
    },
    SyncRequest {
        session_id: Uuid,
        from_version: u64,
        to_version: Option<u64>,
    },
    /// A presence envelope forwarded verbatim to the other subscribers.
    Presence {
        session_id: Uuid,
        frame: String,
    },
    Subscribe {
        session_id: Uuid,
        username: String,
        sink: mpsc::Sender<Arc<str>>,
        reply: oneshot::Sender<SubscribeAck>,
    },
    Unsubscribe {
        session_id: Uuid,
        username: String,
    },
    Info {
        reply: oneshot::Sender<DocInfo>,
    },
    /// Drain and stop. Everything already queued still runs.
    Shutdown,
}

/// The actor state for one document.
struct DocDispatcher {
    doc_id: String,
    doc: DocumentController,
    group: BroadcastGroup,
    registry: Arc<SessionRegistry>,
}

impl DocDispatcher {
    fn new(doc_id: String, initial_text: String, registry: Arc<SessionRegistry>) -> Self {
        Self {
            doc_id,
            doc: DocumentController::new(initial_text),
            group: BroadcastGroup::new(),
            registry,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocCommand>) {
        log::debug!("dispatcher for '{}' started", self.doc_id);
        while let Some(cmd) = rx.recv().await {
            match cmd {
                DocCommand::Submit {
                    session_id,
                    user,
                    op,
                    base_revision,
                    op_ref,
                } => self.handle_submit(session_id, &user, op, base_revision, &op_ref),
                DocCommand::Undo { session_id, user } => {
                    self.handle_history(session_id, &user, true)
                }
                DocCommand::Redo { session_id, user } => {
                    self.handle_history(session_id, &user, false)
                }
                DocCommand::SyncRequest {
                    session_id,
                    from_version,
                    to_version,
                } => self.handle_sync(session_id, from_version, to_version),
                DocCommand::Presence { session_id, frame } => {
                    let dropped =
                        self.group
                            .broadcast(Arc::from(frame), FrameClass::Presence, Some(&session_id));
                    self.close_dropped(dropped);
                }
                DocCommand::Subscribe {
                    session_id,
                    username,
                    sink,
                    reply,
                } => self.handle_subscribe(session_id, &username, sink, reply),
                DocCommand::Unsubscribe {
                    session_id,
                    username,
                } => self.handle_unsubscribe(session_id, &username),
                DocCommand::Info { reply } => {
                    let _ = reply.send(DocInfo {
                        revision: self.doc.revision(),
                        subscribers: self.group.usernames(),
                    });
                }
                DocCommand::Shutdown => break,
            }
        }
        log::debug!("dispatcher for '{}' stopped", self.doc_id);
    }

    fn handle_submit(
        &mut self,
        session_id: Uuid,
        user: &str,
        op: Operation,
        base_revision: u64,
        op_ref: &str,
    ) {
        // A submission queued before its session was closed (eviction,
        // disconnect) is cancelled rather than committed posthumously.
        if self.registry.get_session(session_id).is_none() {
            log::debug!("dropping submission from closed session {session_id}");
            return;
        }
        match self.doc.apply_remote(op, user, base_revision) {
            Ok((committed, revision)) => {
                let ack = Envelope::edit_apply(&self.doc_id, op_ref, revision);
                self.send_envelope(&session_id, &ack);
                let frame = Envelope::remote_edit(&self.doc_id, &committed, revision, user);
                self.broadcast_envelope(&frame, FrameClass::Edit, Some(&session_id));
                log::debug!(
                    "doc '{}' commit r{revision} by {user} (base {base_revision})",
                    self.doc_id
                );
            }
            Err(e) => {
                log::info!("doc '{}' rejected edit from {user}: {e}", self.doc_id);
                let nack = Envelope::edit_reject(&self.doc_id, op_ref, &e.to_string());
                self.send_envelope(&session_id, &nack);
            }
        }
    }

    fn handle_history(&mut self, session_id: Uuid, user: &str, undo: bool) {
        let result = if undo {
            self.doc.apply_undo(user)
        } else {
            self.doc.apply_redo(user)
        };
        match result {
            Ok((op, revision)) => {
                // The acting client has no local echo of this operation, so
                // it goes to every subscriber, originator included.
                let frame = Envelope::remote_edit(&self.doc_id, &op, revision, user);
                self.broadcast_envelope(&frame, FrameClass::Edit, None);
            }
            Err(e @ (DocError::NothingToUndo | DocError::NothingToRedo)) => {
                let nack = Envelope::edit_reject(&self.doc_id, "", &e.to_string());
                self.send_envelope(&session_id, &nack);
            }
            Err(e) => {
                log::warn!("doc '{}' {user} history apply failed: {e}", self.doc_id);
                let nack = Envelope::edit_reject(&self.doc_id, "", &e.to_string());
                self.send_envelope(&session_id, &nack);
            }
        }
    }

    fn handle_sync(&mut self, session_id: Uuid, from: u64, to: Option<u64>) {
        let current = self.doc.revision();
        let to = to.unwrap_or(current).min(current);
        let reply = if from > to {
            let (text, revision) = self.doc.snapshot();
            Envelope::sync_state(&self.doc_id, &text, revision)
        } else {
            match self.doc.log_range(from, to) {
                Some(ops) => Envelope::sync_response(&self.doc_id, from, to, ops),
                None => {
                    // Requested range predates the retained log; fall back to
                    // a full snapshot.
                    let (text, revision) = self.doc.snapshot();
                    Envelope::sync_state(&self.doc_id, &text, revision)
                }
            }
        };
        self.send_envelope(&session_id, &reply);
    }

    fn handle_subscribe(
        &mut self,
        session_id: Uuid,
        username: &str,
        sink: mpsc::Sender<Arc<str>>,
        reply: oneshot::Sender<SubscribeAck>,
    ) {
        self.group.add_peer(session_id, username, sink);
        let (text, revision) = self.doc.snapshot();
        let _ = reply.send(SubscribeAck {
            text,
            revision,
            peers: self.group.usernames(),
        });
        let join = Envelope::presence_join(&self.doc_id, username);
        self.broadcast_envelope(&join, FrameClass::Presence, Some(&session_id));
        log::info!("{username} subscribed to '{}'", self.doc_id);
    }

    fn handle_unsubscribe(&mut self, session_id: Uuid, username: &str) {
        if self.group.remove_peer(&session_id).is_some() {
            let leave = Envelope::presence_leave(&self.doc_id, username);
            self.broadcast_envelope(&leave, FrameClass::Presence, None);
            log::info!("{username} unsubscribed from '{}'", self.doc_id);
        }
    }

    fn send_envelope(&mut self, session_id: &Uuid, envelope: &Envelope) {
        match envelope.encode() {
            Ok(json) => {
                if !self
                    .group
                    .send_to(session_id, Arc::from(json.as_str()), FrameClass::Edit)
                {
                    self.close_dropped(vec![*session_id]);
                }
            }
            Err(e) => log::error!("failed to encode envelope: {e}"),
        }
    }

    fn broadcast_envelope(&mut self, envelope: &Envelope, class: FrameClass, origin: Option<&Uuid>) {
        match envelope.encode() {
            Ok(json) => {
                let dropped = self.group.broadcast(Arc::from(json.as_str()), class, origin);
                self.close_dropped(dropped);
            }
            Err(e) => log::error!("failed to encode envelope: {e}"),
        }
    }

    /// Sessions dropped for backpressure are closed outright; a subscriber
    /// that cannot keep up with edits cannot stay consistent.
    fn close_dropped(&self, dropped: Vec<Uuid>) {
        for id in dropped {
            self.registry.close_session(id);
        }
    }
}

/// Handle for pushing commands at one document.
#[derive(Clone)]
pub struct DocHandle {
    pub doc_id: String,
    tx: mpsc::Sender<DocCommand>,
}

impl DocHandle {
    /// Enqueue a command, waiting for queue space if the document is busy.
    pub async fn send(&self, cmd: DocCommand) -> bool {
        self.tx.send(cmd).await.is_ok()
    }

    /// Enqueue without waiting; used by paths that must not block (idle
    /// eviction, presence fan-in).
    pub fn try_send(&self, cmd: DocCommand) -> bool {
        self.tx.try_send(cmd).is_ok()
    }
}

struct DocEntry {
    name: String,
    tx: mpsc::Sender<DocCommand>,
    join: JoinHandle<()>,
}

/// All live documents: doc id → dispatcher. Creation is idempotent; a
/// document exists from first subscription (or explicit create) onward.
pub struct DispatcherTable {
    docs: Mutex<HashMap<String, DocEntry>>,
    registry: Arc<SessionRegistry>,
}

impl DispatcherTable {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Explicitly create a document; `None` when the id is already taken.
    pub fn create(&self, doc_id: &str, name: &str, initial_text: &str) -> Option<DocHandle> {
        let mut docs = self.lock();
        if docs.contains_key(doc_id) {
            return None;
        }
        Some(self.spawn(&mut docs, doc_id, name, initial_text))
    }

    /// Get a document's handle, creating an empty document on first touch.
    pub fn get_or_create(&self, doc_id: &str) -> DocHandle {
        let mut docs = self.lock();
        if let Some(entry) = docs.get(doc_id) {
            return DocHandle {
                doc_id: doc_id.to_string(),
                tx: entry.tx.clone(),
            };
        }
        self.spawn(&mut docs, doc_id, doc_id, "")
    }

    pub fn get(&self, doc_id: &str) -> Option<DocHandle> {
        self.lock().get(doc_id).map(|entry| DocHandle {
            doc_id: doc_id.to_string(),
            tx: entry.tx.clone(),
        })
    }

    /// `(id, name)` for every live document, sorted by id.
    pub fn list(&self) -> Vec<(String, String)> {
        let docs = self.lock();
        let mut out: Vec<(String, String)> = docs
            .iter()
            .map(|(id, entry)| (id.clone(), entry.name.clone()))
            .collect();
        out.sort();
        out
    }

    pub fn name_of(&self, doc_id: &str) -> Option<String> {
        self.lock().get(doc_id).map(|e| e.name.clone())
    }

    /// Rename a document; fails when it does not exist.
    pub fn rename(&self, doc_id: &str, new_name: &str) -> bool {
        match self.lock().get_mut(doc_id) {
            Some(entry) => {
                entry.name = new_name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.lock().contains_key(doc_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ask every dispatcher to drain and stop, then wait up to `deadline`
    /// for them to finish.
    pub async fn shutdown(&self, deadline: Duration) {
        let entries: Vec<(String, mpsc::Sender<DocCommand>, JoinHandle<()>)> = {
            let mut docs = self.lock();
            docs.drain()
                .map(|(id, entry)| (id, entry.tx, entry.join))
                .collect()
        };
        for (_, tx, _) in &entries {
            let _ = tx.send(DocCommand::Shutdown).await;
        }
        for (id, _, join) in entries {
            if tokio::time::timeout(deadline, join).await.is_err() {
                log::warn!("dispatcher for '{id}' did not drain before deadline");
            }
        }
    }

    fn spawn(
        &self,
        docs: &mut HashMap<String, DocEntry>,
        doc_id: &str,
        name: &str,
        initial_text: &str,
    ) -> DocHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let dispatcher = DocDispatcher::new(
            doc_id.to_string(),
            initial_text.to_string(),
            self.registry.clone(),
        );
        let join = tokio::spawn(dispatcher.run(rx));
        docs.insert(
            doc_id.to_string(),
            DocEntry {
                name: name.to_string(),
                tx: tx.clone(),
                join,
            },
        );
        log::info!("document '{doc_id}' ({name}) created");
        DocHandle {
            doc_id: doc_id.to_string(),
            tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DocEntry>> {
        match self.docs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
