//! Per-user undo/redo history that stays valid under concurrent edits.
//!
//! Every user gets an undo stack and a redo stack. Stacks hold clones of
//! operations as they were at commit time. When a concurrent operation from
//! another user commits, every stored entry is transformed across it so the
//! stacks keep producing operations that apply cleanly to the current text.

use std::collections::{HashMap, VecDeque};

use crate::operation::{OpSource, Operation};

/// Default bound on each user's undo stack.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

#[derive(Debug, Default)]
struct UserHistory {
    undo: VecDeque<Operation>,
    redo: VecDeque<Operation>,
}

/// Transformation-aware undo/redo stacks, keyed by user id.
#[derive(Debug)]
pub struct HistoryManager {
    stacks: HashMap<String, UserHistory>,
    max_history: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl HistoryManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            stacks: HashMap::new(),
            max_history,
        }
    }

    /// Record a committed operation for `user`. Clears the user's redo stack
    /// unless the caller says otherwise; drops from the oldest end when the
    /// undo stack outgrows `max_history`.
    pub fn record(&mut self, op: &Operation, user: &str, clear_redo: bool) {
        let history = self.stacks.entry(user.to_string()).or_default();
        if clear_redo {
            history.redo.clear();
        }
        history.undo.push_back(op.clone());
        while history.undo.len() > self.max_history {
            history.undo.pop_front();
        }
    }

    /// Pop the user's most recent operation and return its inverse, tagged
    /// `LocalUndo` and linked to the original. The original moves to the redo
    /// stack. Entries whose delete text was never captured are skipped.
    ///
    /// The caller applies the returned operation; it must not be recorded as
    /// new history.
    pub fn undo(&mut self, user: &str) -> Option<Operation> {
        let history = self.stacks.get_mut(user)?;
        while let Some(op) = history.undo.pop_back() {
            match op.invert() {
                Ok(mut inverse) => {
                    inverse.source = OpSource::LocalUndo;
                    inverse.related_id = Some(op.id);
                    history.redo.push_back(op);
                    return Some(inverse);
                }
                Err(_) => {
                    log::warn!("dropping uninvertible history entry for {user}");
                    continue;
                }
            }
        }
        None
    }

    /// Pop the user's most recently undone operation and return it tagged
    /// `LocalRedo`; the original goes back onto the undo stack.
    pub fn redo(&mut self, user: &str) -> Option<Operation> {
        let history = self.stacks.get_mut(user)?;
        let op = history.redo.pop_back()?;
        let mut redone = op.clone();
        redone.source = OpSource::LocalRedo;
        redone.related_id = Some(op.id);
        history.undo.push_back(op);
        Some(redone)
    }

    /// Roll back the stack movement of a failed `undo` apply: the entry that
    /// moved to the redo stack returns to the undo stack.
    pub fn cancel_undo(&mut self, user: &str) {
        if let Some(history) = self.stacks.get_mut(user) {
            if let Some(op) = history.redo.pop_back() {
                history.undo.push_back(op);
            }
        }
    }

    /// Discard the entry most recently moved to the redo stack. Used when an
    /// undo's inverse turned out not to apply: the entry is dead weight.
    pub fn drop_last_redo(&mut self, user: &str) {
        if let Some(history) = self.stacks.get_mut(user) {
            history.redo.pop_back();
        }
    }

    /// Roll back the stack movement of a failed `redo` apply.
    pub fn cancel_redo(&mut self, user: &str) {
        if let Some(history) = self.stacks.get_mut(user) {
            if let Some(op) = history.undo.pop_back() {
                history.redo.push_back(op);
            }
        }
    }

    /// Transform every stored entry across a newly committed operation.
    /// Entries that collapse to no-ops are dropped so undo never replays
    /// nothing.
    pub fn transform_all(&mut self, committed: &Operation) {
        for history in self.stacks.values_mut() {
            Self::transform_stack(&mut history.undo, committed);
            Self::transform_stack(&mut history.redo, committed);
        }
    }

    /// Like [`transform_all`](Self::transform_all) but leaves `except`'s own
    /// stacks alone; used when `except` is the author of `committed`, whose
    /// stacks were already adjusted (or recorded) for it.
    pub fn transform_all_except(&mut self, committed: &Operation, except: &str) {
        for (user, history) in self.stacks.iter_mut() {
            if user == except {
                continue;
            }
            Self::transform_stack(&mut history.undo, committed);
            Self::transform_stack(&mut history.redo, committed);
        }
    }

    /// Overwrite history entries with their unacknowledged twins.
    ///
    /// A client replica records a local edit once in history and once in its
    /// pending buffer. When a remote operation folds through the pending
    /// buffer, the pending copies pick up position shifts that a plain
    /// [`transform_all`](Self::transform_all) cannot reproduce (later pending
    /// entries see the remote pre-shifted by earlier ones). Matching entries
    /// (same non-zero id) are replaced wholesale to keep both views
    /// identical.
    pub fn sync_with_pending(&mut self, user: &str, pending: &[Operation]) {
        let Some(history) = self.stacks.get_mut(user) else {
            return;
        };
        for entry in history.undo.iter_mut().chain(history.redo.iter_mut()) {
            if entry.id == 0 {
                continue;
            }
            if let Some(twin) = pending.iter().find(|p| p.id == entry.id) {
                *entry = twin.clone();
            }
        }
    }

    fn transform_stack(stack: &mut VecDeque<Operation>, committed: &Operation) {
        let mut transformed = VecDeque::with_capacity(stack.len());
        for op in stack.drain(..) {
            let next = op.transform(committed);
            if next.is_noop() {
                continue;
            }
            transformed.push_back(next);
        }
        *stack = transformed;
    }

    pub fn can_undo(&self, user: &str) -> bool {
        self.undo_depth(user) > 0
    }

    pub fn can_redo(&self, user: &str) -> bool {
        self.redo_depth(user) > 0
    }

    pub fn undo_depth(&self, user: &str) -> usize {
        self.stacks.get(user).map_or(0, |h| h.undo.len())
    }

    pub fn redo_depth(&self, user: &str) -> usize {
        self.stacks.get(user).map_or(0, |h| h.redo.len())
    }

    /// Drop all history for one user (e.g. their session closed).
    pub fn clear_user(&mut self, user: &str) {
        self.stacks.remove(user);
    }

    /// Drop everything (e.g. document content replaced wholesale).
    pub fn clear(&mut self) {
        self.stacks.clear();
    }

    /// Total entries across all stacks.
    pub fn total_entries(&self) -> usize {
        self.stacks
            .values()
            .map(|h| h.undo.len() + h.redo.len())
            .sum()
    }
}
