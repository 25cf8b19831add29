//! Authoritative per-document state: text, revision counter, operation log,
//! and per-user history.
//!
//! A controller is single-writer: the owning dispatcher task (or the client
//! engine) is the only mutator, so there are no locks here. Remote operations
//! arrive tagged with the revision they were authored against and are folded
//! through the committed suffix of the log before they touch the text:
//!
//! ```text
//! log:  r1  r2  r3  r4  r5          base_revision = 2
//!               └───┴───┴── op.transform(r3).transform(r4).transform(r5)
//! ```
//!
//! Every commit bumps the revision by exactly one and appends the canonical
//! (post-transform) operation to the log.

use std::time::SystemTime;

use crate::history::HistoryManager;
use crate::operation::{OpSource, Operation, OperationError};

/// Errors surfaced by the controller.
#[derive(Debug)]
pub enum DocError {
    /// The operation does not fit the current text.
    ApplyRejected(OperationError),
    /// `base_revision` is ahead of the document or behind the retained log.
    RevisionGap {
        base_revision: u64,
        retained_from: u64,
        current: u64,
    },
    /// Undo/redo requested with no applicable history entry.
    NothingToUndo,
    NothingToRedo,
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApplyRejected(e) => write!(f, "operation rejected: {e}"),
            Self::RevisionGap {
                base_revision,
                retained_from,
                current,
            } => write!(
                f,
                "base revision {base_revision} outside retained window [{retained_from}, {current}]"
            ),
            Self::NothingToUndo => write!(f, "nothing to undo"),
            Self::NothingToRedo => write!(f, "nothing to redo"),
        }
    }
}

impl std::error::Error for DocError {}

/// Callback invoked with `(committed_op, new_revision)` after every commit.
pub type ChangeSink = Box<dyn Fn(&Operation, u64) + Send>;

/// Single-document authoritative state.
pub struct DocumentController {
    text: String,
    revision: u64,
    /// Committed operations; `log[i]` produced revision `log_start + i + 1`.
    log: Vec<Operation>,
    /// First revision still covered by the log (0 unless compacted).
    log_start: u64,
    history: HistoryManager,
    sinks: Vec<ChangeSink>,
    next_op_id: i64,
    changed_at: SystemTime,
}

impl DocumentController {
    pub fn new(initial_text: impl Into<String>) -> Self {
        Self {
            text: initial_text.into(),
            revision: 0,
            log: Vec::new(),
            log_start: 0,
            history: HistoryManager::default(),
            sinks: Vec::new(),
            next_op_id: 0,
            changed_at: SystemTime::now(),
        }
    }

    /// Atomic read of `(text, revision)`.
    pub fn snapshot(&self) -> (String, u64) {
        (self.text.clone(), self.revision)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn changed_at(&self) -> SystemTime {
        self.changed_at
    }

    /// Register a callback for committed operations. Originator filtering is
    /// the dispatcher's job, not ours.
    pub fn subscribe(&mut self, sink: ChangeSink) {
        self.sinks.push(sink);
    }

    /// Apply an operation produced against the current revision by `user`.
    /// Records it in the user's undo history and commits it to the log.
    pub fn apply_local(&mut self, mut op: Operation, user: &str) -> Result<u64, DocError> {
        if !matches!(op.source, OpSource::LocalUndo | OpSource::LocalRedo) {
            op.source = OpSource::Local;
        }
        self.prepare(&mut op, user);
        op.apply(&mut self.text).map_err(DocError::ApplyRejected)?;

        if op.source == OpSource::Local {
            self.history.record(&op, user, true);
        }
        Ok(self.commit(op))
    }

    /// Apply an operation authored by `user` against `base_revision`,
    /// transforming it across every commit since. On success the transformed
    /// operation becomes the canonical record and is returned with the new
    /// revision; the submitted form is discarded.
    pub fn apply_remote(
        &mut self,
        mut op: Operation,
        user: &str,
        base_revision: u64,
    ) -> Result<(Operation, u64), DocError> {
        op.source = OpSource::Remote;
        // Stamp identity before transforming: the insert tie-break compares
        // authors (and ids) of concurrent operations.
        self.prepare(&mut op, user);
        let mut transformed = self.transform_to_current(op, base_revision)?;
        transformed
            .apply(&mut self.text)
            .map_err(DocError::ApplyRejected)?;

        // The submitter sees this as their own local edit: it enters their
        // undo history and clears their redo stack. Everyone else's stacks
        // shift underneath it.
        self.history.record(&transformed, user, true);
        self.history.transform_all_except(&transformed, user);

        let revision = self.commit(transformed.clone());
        Ok((transformed, revision))
    }

    /// Undo `user`'s most recent operation. The inverse commits like any
    /// other operation (it is broadcast to every subscriber) but is not
    /// re-recorded in the user's undo stack.
    pub fn apply_undo(&mut self, user: &str) -> Result<(Operation, u64), DocError> {
        loop {
            let mut inverse = self.history.undo(user).ok_or(DocError::NothingToUndo)?;
            self.prepare(&mut inverse, user);
            match inverse.apply(&mut self.text) {
                Ok(()) => {
                    self.history.transform_all_except(&inverse, user);
                    let revision = self.commit(inverse.clone());
                    return Ok((inverse, revision));
                }
                Err(e) => {
                    // Stale entry that no longer fits the text; discard it
                    // and try the next one.
                    log::warn!("undo entry for {user} no longer applies ({e}); dropping");
                    self.history.drop_last_redo(user);
                    continue;
                }
            }
        }
    }

    /// Reinstate `user`'s most recently undone operation.
    pub fn apply_redo(&mut self, user: &str) -> Result<(Operation, u64), DocError> {
        let mut redone = self.history.redo(user).ok_or(DocError::NothingToRedo)?;
        self.prepare(&mut redone, user);
        match redone.apply(&mut self.text) {
            Ok(()) => {
                self.history.transform_all_except(&redone, user);
                let revision = self.commit(redone.clone());
                Ok((redone, revision))
            }
            Err(e) => {
                log::warn!("redo entry for {user} no longer applies ({e})");
                self.history.cancel_redo(user);
                Err(DocError::ApplyRejected(e))
            }
        }
    }

    pub fn can_undo(&self, user: &str) -> bool {
        self.history.can_undo(user)
    }

    pub fn can_redo(&self, user: &str) -> bool {
        self.history.can_redo(user)
    }

    /// Committed operations in `(from_revision, to_revision]`, oldest first.
    /// `None` when part of the range has been compacted away.
    pub fn log_range(&self, from_revision: u64, to_revision: u64) -> Option<Vec<Operation>> {
        if from_revision > to_revision
            || from_revision < self.log_start
            || to_revision > self.revision
        {
            return None;
        }
        let lo = (from_revision - self.log_start) as usize;
        let hi = (to_revision.min(self.revision) - self.log_start) as usize;
        Some(self.log[lo..hi].to_vec())
    }

    /// First revision the log still covers.
    pub fn retained_from(&self) -> u64 {
        self.log_start
    }

    /// Drop log entries at or below `revision`. Callers lose the ability to
    /// transform submissions based below it; those draw `RevisionGap` and
    /// must resync from a snapshot.
    pub fn compact(&mut self, revision: u64) {
        let upto = revision.min(self.revision);
        if upto <= self.log_start {
            return;
        }
        let drop = (upto - self.log_start) as usize;
        self.log.drain(..drop);
        self.log_start = upto;
    }

    /// Replace the text wholesale (sync recovery). Clears all history; the
    /// log restarts at the given revision.
    pub fn reset(&mut self, text: impl Into<String>, revision: u64) {
        self.text = text.into();
        self.revision = revision;
        self.log.clear();
        self.log_start = revision;
        self.history.clear();
        self.changed_at = SystemTime::now();
    }

    /// Clear one user's history (their session ended).
    pub fn forget_user(&mut self, user: &str) {
        self.history.clear_user(user);
    }

    fn transform_to_current(
        &self,
        op: Operation,
        base_revision: u64,
    ) -> Result<Operation, DocError> {
        if base_revision > self.revision || base_revision < self.log_start {
            return Err(DocError::RevisionGap {
                base_revision,
                retained_from: self.log_start,
                current: self.revision,
            });
        }
        let start = (base_revision - self.log_start) as usize;
        Ok(self.log[start..]
            .iter()
            .fold(op, |acc, committed| acc.transform(committed)))
    }

    /// Stamp id and author, leaving already-assigned ids alone.
    fn prepare(&mut self, op: &mut Operation, user: &str) {
        if op.id == 0 {
            self.next_op_id += 1;
            op.id = self.next_op_id;
        }
        op.set_author(user);
    }

    fn commit(&mut self, op: Operation) -> u64 {
        self.revision += 1;
        self.changed_at = SystemTime::now();
        for sink in &self.sinks {
            sink(&op, self.revision);
        }
        self.log.push(op);
        self.revision
    }
}
