//! Operation algebra for operational transformation.
//!
//! The three edit primitives (insert, delete, composite) are plain value
//! objects. Every operation can apply itself to a document, produce its
//! inverse for undo, and transform itself against a concurrent operation so
//! that both sides converge regardless of arrival order:
//!
//! ```text
//!          T
//!        /   \
//!      A       B          apply(A) then apply(B.transform(A))
//!        \   /            == apply(B) then apply(A.transform(B))
//!       same text
//! ```
//!
//! Positions are codepoint indices, not byte offsets; all bounds checks and
//! splices count `char`s.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Where an operation originated. Drives undo/redo bookkeeping: only `Local`
/// operations enter a user's undo stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    /// Produced by the local user.
    Local,
    /// Received from another collaborator.
    Remote,
    /// Inverse of a local operation, produced by undo.
    LocalUndo,
    /// Reinstatement of a previously undone operation.
    LocalRedo,
    /// Not user-initiated (seeding, recovery).
    System,
}

/// Errors from applying or inverting an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Position or range falls outside the current text.
    OutOfRange {
        position: usize,
        length: usize,
        text_len: usize,
    },
    /// A delete was asked to invert before its removed text was captured.
    InversionUnavailable,
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange {
                position,
                length,
                text_len,
            } => write!(
                f,
                "range {position}+{length} out of bounds for text of length {text_len}"
            ),
            Self::InversionUnavailable => {
                write!(f, "cannot invert delete without captured text")
            }
        }
    }
}

impl std::error::Error for OperationError {}

/// The edit payload.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Insert `text` at codepoint `position`.
    Insert { position: usize, text: String },
    /// Delete `length` codepoints starting at `position`. `deleted_text` is
    /// captured on first apply so the operation can be inverted later.
    Delete {
        position: usize,
        length: usize,
        deleted_text: Option<String>,
    },
    /// An ordered group applied as one atomic unit (single undo step).
    Composite { children: Vec<Operation> },
}

/// An edit with its bookkeeping metadata.
///
/// Operations are value objects: `clone` is cheap and nothing is shared.
/// `id` 0 means unassigned; controllers stamp ids at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: i64,
    pub source: OpSource,
    /// Links an undo/redo to the operation it inverts or reinstates.
    pub related_id: Option<i64>,
    /// Author user id, used for the deterministic insert tie-break.
    pub author: String,
    pub kind: OpKind,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of codepoint index `pos`, or `None` when past the end.
fn byte_offset(s: &str, pos: usize) -> Option<usize> {
    let mut seen = 0;
    for (i, _) in s.char_indices() {
        if seen == pos {
            return Some(i);
        }
        seen += 1;
    }
    if pos == seen {
        Some(s.len())
    } else {
        None
    }
}

fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn suffix_chars(s: &str, n: usize) -> String {
    let len = char_len(s);
    s.chars().skip(len.saturating_sub(n)).collect()
}

/// Remove `count` codepoints starting at codepoint `offset`.
fn splice_out(s: &str, offset: usize, count: usize) -> String {
    s.chars()
        .take(offset)
        .chain(s.chars().skip(offset + count))
        .collect()
}

/// Insert `inserted` at codepoint `offset`.
fn splice_in(s: &str, offset: usize, inserted: &str) -> String {
    let mut out: String = s.chars().take(offset).collect();
    out.push_str(inserted);
    out.extend(s.chars().skip(offset));
    out
}

/// True when `other` takes effect before `this` at equal insert positions.
///
/// Authors compare lexicographically; ties (or unknown authors) fall back to
/// operation id, so the ordering is total whenever ids are assigned.
fn takes_precedence(other: &Operation, this: &Operation) -> bool {
    if !other.author.is_empty() && !this.author.is_empty() && other.author != this.author {
        other.author < this.author
    } else {
        other.id < this.id
    }
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::from_kind(OpKind::Insert {
            position,
            text: text.into(),
        })
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self::from_kind(OpKind::Delete {
            position,
            length,
            deleted_text: None,
        })
    }

    /// A delete whose removed text is already known (deserialized or inverted).
    pub fn delete_captured(position: usize, length: usize, text: impl Into<String>) -> Self {
        Self::from_kind(OpKind::Delete {
            position,
            length,
            deleted_text: Some(text.into()),
        })
    }

    pub fn composite(children: Vec<Operation>) -> Self {
        Self::from_kind(OpKind::Composite { children })
    }

    fn from_kind(kind: OpKind) -> Self {
        Self {
            id: 0,
            source: OpSource::Local,
            related_id: None,
            author: String::new(),
            kind,
        }
    }

    pub fn with_source(mut self, source: OpSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.set_author(&author.into());
        self
    }

    /// Stamp `author` on this operation and, for composites, every child.
    /// Children need the author for the insert tie-break.
    pub fn set_author(&mut self, author: &str) {
        self.author = author.to_string();
        if let OpKind::Composite { children } = &mut self.kind {
            for child in children {
                child.set_author(author);
            }
        }
    }

    /// Apply to `text`, capturing deleted substrings the first time a delete
    /// runs. Composite children are validated against a scratch copy and
    /// committed together, so a failing child leaves `text` untouched.
    pub fn apply(&mut self, text: &mut String) -> Result<(), OperationError> {
        match &mut self.kind {
            OpKind::Insert {
                position,
                text: inserted,
            } => {
                let at = byte_offset(text, *position).ok_or(OperationError::OutOfRange {
                    position: *position,
                    length: 0,
                    text_len: char_len(text),
                })?;
                text.insert_str(at, inserted);
                Ok(())
            }
            OpKind::Delete {
                position,
                length,
                deleted_text,
            } => {
                let out_of_range = || OperationError::OutOfRange {
                    position: *position,
                    length: *length,
                    text_len: char_len(text),
                };
                let start = byte_offset(text, *position).ok_or_else(out_of_range)?;
                let end = byte_offset(text, *position + *length).ok_or_else(out_of_range)?;
                if deleted_text.is_none() {
                    *deleted_text = Some(text[start..end].to_string());
                }
                text.replace_range(start..end, "");
                Ok(())
            }
            OpKind::Composite { children } => {
                let mut scratch = text.clone();
                for child in children.iter_mut() {
                    child.apply(&mut scratch)?;
                }
                *text = scratch;
                Ok(())
            }
        }
    }

    /// The operation that undoes this one. Composites invert children in
    /// reverse order. The result carries no id or source tagging; the history
    /// manager stamps those.
    pub fn invert(&self) -> Result<Operation, OperationError> {
        let kind = match &self.kind {
            OpKind::Insert { position, text } => OpKind::Delete {
                position: *position,
                length: char_len(text),
                deleted_text: Some(text.clone()),
            },
            OpKind::Delete {
                position,
                deleted_text: Some(removed),
                ..
            } => OpKind::Insert {
                position: *position,
                text: removed.clone(),
            },
            OpKind::Delete {
                deleted_text: None, ..
            } => return Err(OperationError::InversionUnavailable),
            OpKind::Composite { children } => {
                let inverted = children
                    .iter()
                    .rev()
                    .map(|c| c.invert())
                    .collect::<Result<Vec<_>, _>>()?;
                OpKind::Composite { children: inverted }
            }
        };
        Ok(Operation {
            id: 0,
            source: self.source,
            related_id: None,
            author: self.author.clone(),
            kind,
        })
    }

    /// Transform this operation so it applies cleanly after `other` has been
    /// applied. Total: pairings with nothing to adjust return a clone.
    pub fn transform(&self, other: &Operation) -> Operation {
        // A composite on the right folds us through its children in order.
        if let OpKind::Composite { children } = &other.kind {
            return children
                .iter()
                .fold(self.clone(), |acc, child| acc.transform(child));
        }

        let kind = match (&self.kind, &other.kind) {
            (
                OpKind::Insert { position, text },
                OpKind::Insert {
                    position: other_pos,
                    text: other_text,
                },
            ) => {
                let shifted = *other_pos < *position
                    || (*other_pos == *position && takes_precedence(other, self));
                OpKind::Insert {
                    position: if shifted {
                        position + char_len(other_text)
                    } else {
                        *position
                    },
                    text: text.clone(),
                }
            }

            (
                OpKind::Insert { position, text },
                OpKind::Delete {
                    position: del_pos,
                    length: del_len,
                    ..
                },
            ) => {
                let del_end = del_pos + del_len;
                let new_pos = if del_end <= *position {
                    position - del_len
                } else if *del_pos < *position {
                    // Our anchor fell inside the deleted range; clamp to its
                    // start.
                    *del_pos
                } else {
                    *position
                };
                OpKind::Insert {
                    position: new_pos,
                    text: text.clone(),
                }
            }

            (
                OpKind::Delete {
                    position,
                    length,
                    deleted_text,
                },
                OpKind::Insert {
                    position: ins_pos,
                    text: ins_text,
                },
            ) => {
                let ins_len = char_len(ins_text);
                if *ins_pos <= *position {
                    OpKind::Delete {
                        position: position + ins_len,
                        length: *length,
                        deleted_text: deleted_text.clone(),
                    }
                } else if *ins_pos < position + length {
                    // The insert landed inside our pending deletion: widen the
                    // range and splice the new text into the captured copy so
                    // inversion stays exact.
                    OpKind::Delete {
                        position: *position,
                        length: length + ins_len,
                        deleted_text: deleted_text
                            .as_ref()
                            .map(|t| splice_in(t, ins_pos - position, ins_text)),
                    }
                } else {
                    OpKind::Delete {
                        position: *position,
                        length: *length,
                        deleted_text: deleted_text.clone(),
                    }
                }
            }

            (
                OpKind::Delete {
                    position,
                    length,
                    deleted_text,
                },
                OpKind::Delete {
                    position: other_pos,
                    length: other_len,
                    ..
                },
            ) => {
                let (a, n) = (*position, *length);
                let (b, m) = (*other_pos, *other_len);
                if b + m <= a {
                    // Disjoint, other before us.
                    OpKind::Delete {
                        position: a - m,
                        length: n,
                        deleted_text: deleted_text.clone(),
                    }
                } else if b <= a && b + m >= a + n {
                    // Other swallowed our whole range.
                    OpKind::Delete {
                        position: b,
                        length: 0,
                        deleted_text: Some(String::new()),
                    }
                } else if b <= a {
                    // Overlap at our head: b <= a < b+m < a+n.
                    let new_len = (a + n) - (b + m);
                    OpKind::Delete {
                        position: b,
                        length: new_len,
                        deleted_text: deleted_text.as_ref().map(|t| suffix_chars(t, new_len)),
                    }
                } else if b >= a + n {
                    // Disjoint, other after us.
                    OpKind::Delete {
                        position: a,
                        length: n,
                        deleted_text: deleted_text.clone(),
                    }
                } else if b + m >= a + n {
                    // Overlap at our tail: a < b < a+n <= b+m.
                    let new_len = b - a;
                    OpKind::Delete {
                        position: a,
                        length: new_len,
                        deleted_text: deleted_text.as_ref().map(|t| prefix_chars(t, new_len)),
                    }
                } else {
                    // Other strictly inside us: a < b, b+m < a+n.
                    OpKind::Delete {
                        position: a,
                        length: n - m,
                        deleted_text: deleted_text.as_ref().map(|t| splice_out(t, b - a, m)),
                    }
                }
            }

            (OpKind::Composite { children }, _) => OpKind::Composite {
                children: children.iter().map(|c| c.transform(other)).collect(),
            },

            (OpKind::Insert { .. }, OpKind::Composite { .. })
            | (OpKind::Delete { .. }, OpKind::Composite { .. }) => {
                unreachable!("other.kind == Composite is handled by the early return above")
            }
        };

        Operation {
            kind,
            ..self.clone()
        }
    }

    /// True when transformation collapsed this operation to nothing.
    pub fn is_noop(&self) -> bool {
        match &self.kind {
            OpKind::Insert { text, .. } => text.is_empty(),
            OpKind::Delete { length, .. } => *length == 0,
            OpKind::Composite { children } => children.iter().all(|c| c.is_noop()),
        }
    }

    /// Codepoint count this operation inserts minus what it deletes.
    pub fn length_delta(&self) -> i64 {
        match &self.kind {
            OpKind::Insert { text, .. } => char_len(text) as i64,
            OpKind::Delete { length, .. } => -(*length as i64),
            OpKind::Composite { children } => children.iter().map(|c| c.length_delta()).sum(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire form
// ───────────────────────────────────────────────────────────────────

/// Serialized shape: `{"type":"insert","position":N,"text":…}`,
/// `{"type":"delete","position":N,"length":N,"text":…}`, or
/// `{"type":"composite","operations":[…]}`. Metadata (id, source, author)
/// travels in the surrounding envelope, not here.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireNode {
    Insert {
        position: usize,
        text: String,
    },
    Delete {
        position: usize,
        length: usize,
        #[serde(rename = "text", skip_serializing_if = "Option::is_none", default)]
        deleted_text: Option<String>,
    },
    Composite {
        operations: Vec<WireNode>,
    },
}

impl From<&Operation> for WireNode {
    fn from(op: &Operation) -> Self {
        match &op.kind {
            OpKind::Insert { position, text } => WireNode::Insert {
                position: *position,
                text: text.clone(),
            },
            OpKind::Delete {
                position,
                length,
                deleted_text,
            } => WireNode::Delete {
                position: *position,
                length: *length,
                deleted_text: deleted_text.clone(),
            },
            OpKind::Composite { children } => WireNode::Composite {
                operations: children.iter().map(WireNode::from).collect(),
            },
        }
    }
}

impl From<WireNode> for Operation {
    fn from(node: WireNode) -> Self {
        match node {
            WireNode::Insert { position, text } => Operation::insert(position, text),
            WireNode::Delete {
                position,
                length,
                deleted_text,
            } => match deleted_text {
                Some(text) => Operation::delete_captured(position, length, text),
                None => Operation::delete(position, length),
            },
            WireNode::Composite { operations } => {
                Operation::composite(operations.into_iter().map(Operation::from).collect())
            }
        }
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireNode::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let node = WireNode::deserialize(deserializer)?;
        if let WireNode::Delete { length: 0, .. } = node {
            // Zero-length deletes only arise from transformation collapse;
            // they are never a legitimate wire payload.
            return Err(D::Error::custom("delete length must be positive"));
        }
        Ok(Operation::from(node))
    }
}
