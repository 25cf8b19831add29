//! Client-side OT engine: instant local echo plus a pending buffer that
//! reconciles against the server's commit stream.
//!
//! Local edits apply immediately and queue for submission. One operation is
//! in flight at a time; each further edit waits for the previous ACK so its
//! base revision is always meaningful to the server. Remote operations are
//! transformed through the pending buffer (and the buffer through them)
//! before applying, so the local text converges with the authoritative one.

use crate::history::HistoryManager;
use crate::operation::{OpSource, Operation, OperationError};

/// An operation ready to go to the server, tagged with the revision it
/// should be submitted against.
#[derive(Debug, Clone)]
pub struct OutgoingOp {
    pub op: Operation,
    pub base_revision: u64,
}

/// Local replica of one document.
pub struct ClientEngine {
    user: String,
    text: String,
    /// Last server revision this replica has integrated.
    revision: u64,
    /// Locally applied, not yet acknowledged; index 0 is oldest.
    pending: Vec<Operation>,
    /// Id of the pending operation currently in flight, if any.
    in_flight: Option<i64>,
    history: HistoryManager,
    next_op_id: i64,
}

impl ClientEngine {
    pub fn new(user: impl Into<String>) -> Self {
        Self::with_state(user, "", 0)
    }

    /// Start from a known server snapshot (e.g. the open/subscribe reply).
    pub fn with_state(user: impl Into<String>, text: impl Into<String>, revision: u64) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
            revision,
            pending: Vec::new(),
            in_flight: None,
            history: HistoryManager::default(),
            next_op_id: 0,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo(&self.user)
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo(&self.user)
    }

    /// Insert text locally; returns the queued operation's id.
    pub fn insert(&mut self, position: usize, text: &str) -> Result<i64, OperationError> {
        self.local_edit(Operation::insert(position, text))
    }

    /// Delete a range locally; returns the queued operation's id.
    pub fn delete(&mut self, position: usize, length: usize) -> Result<i64, OperationError> {
        self.local_edit(Operation::delete(position, length))
    }

    /// Replace a range in one atomic step (delete + insert).
    pub fn replace(
        &mut self,
        position: usize,
        length: usize,
        text: &str,
    ) -> Result<i64, OperationError> {
        self.local_edit(Operation::composite(vec![
            Operation::delete(position, length),
            Operation::insert(position, text),
        ]))
    }

    fn local_edit(&mut self, mut op: Operation) -> Result<i64, OperationError> {
        self.next_op_id += 1;
        op.id = self.next_op_id;
        op.set_author(&self.user);
        op.apply(&mut self.text)?;
        self.history.record(&op, &self.user, true);
        self.pending.push(op);
        Ok(self.next_op_id)
    }

    /// Undo the latest local edit: the inverse applies immediately and
    /// queues for the server like any other edit. Returns its id, or `None`
    /// with nothing to undo.
    pub fn undo(&mut self) -> Option<i64> {
        let user = self.user.clone();
        loop {
            let mut inverse = self.history.undo(&user)?;
            self.next_op_id += 1;
            inverse.id = self.next_op_id;
            inverse.set_author(&user);
            inverse.source = OpSource::LocalUndo;
            match inverse.apply(&mut self.text) {
                Ok(()) => {
                    self.pending.push(inverse);
                    return Some(self.next_op_id);
                }
                Err(e) => {
                    log::warn!("undo entry no longer applies ({e}); dropping");
                    self.history.drop_last_redo(&user);
                }
            }
        }
    }

    /// Reinstate the latest undone edit.
    pub fn redo(&mut self) -> Option<i64> {
        let user = self.user.clone();
        let mut redone = self.history.redo(&user)?;
        self.next_op_id += 1;
        redone.id = self.next_op_id;
        redone.set_author(&user);
        redone.source = OpSource::LocalRedo;
        match redone.apply(&mut self.text) {
            Ok(()) => {
                self.pending.push(redone);
                Some(self.next_op_id)
            }
            Err(e) => {
                log::warn!("redo entry no longer applies ({e})");
                self.history.cancel_redo(&user);
                None
            }
        }
    }

    /// The next operation to put on the wire, if any. At most one operation
    /// is outstanding; callers get `None` until the previous one is ACKed.
    pub fn next_outgoing(&mut self) -> Option<OutgoingOp> {
        if self.in_flight.is_some() {
            return None;
        }
        let op = self.pending.first()?.clone();
        self.in_flight = Some(op.id);
        Some(OutgoingOp {
            op,
            base_revision: self.revision,
        })
    }

    /// Integrate an operation committed by another client at
    /// `server_revision`. Pending operations and the remote transform
    /// symmetrically; history shifts underneath.
    pub fn integrate_remote(
        &mut self,
        remote: Operation,
        server_revision: u64,
    ) -> Result<(), OperationError> {
        let mut remote = remote;
        remote.source = OpSource::Remote;
        // Acknowledged history entries transform against the remote as the
        // server committed it; pending twins follow their folded copies.
        let received = remote.clone();
        for pending in self.pending.iter_mut() {
            let transformed_pending = pending.transform(&remote);
            remote = remote.transform(pending);
            *pending = transformed_pending;
        }
        remote.apply(&mut self.text)?;
        self.history.transform_all(&received);
        self.history.sync_with_pending(&self.user, &self.pending);
        self.revision = server_revision;
        Ok(())
    }

    /// The server acknowledged operation `op_id` at `server_revision`.
    /// Returns `true` when it matched the in-flight operation.
    pub fn ack(&mut self, op_id: i64, server_revision: u64) -> bool {
        if self.in_flight != Some(op_id) {
            log::warn!("ack for unexpected operation {op_id}");
            return false;
        }
        self.in_flight = None;
        if !self.pending.is_empty() {
            self.pending.remove(0);
        }
        self.revision = server_revision;
        true
    }

    /// The server refused operation `op_id`. The local replica has applied
    /// effects the server never will, so everything pending is dropped and
    /// the caller must resync ([`reset`](Self::reset) from a state
    /// snapshot). Returns the ids of the discarded operations.
    pub fn nack(&mut self, op_id: i64) -> Vec<i64> {
        let dropped: Vec<i64> = self.pending.iter().map(|op| op.id).collect();
        if !dropped.contains(&op_id) {
            log::warn!("nack for unknown operation {op_id}");
        }
        self.pending.clear();
        self.in_flight = None;
        dropped
    }

    /// Adopt an authoritative state snapshot, discarding local divergence.
    pub fn reset(&mut self, text: impl Into<String>, revision: u64) {
        self.text = text.into();
        self.revision = revision;
        self.pending.clear();
        self.in_flight = None;
        self.history.clear();
    }
}
