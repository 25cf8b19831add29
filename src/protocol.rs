//! JSON wire envelope.
//!
//! Every frame is one JSON object with a stable integer `type` code plus the
//! common fields `clientId`, `sessionId`, `sequenceNumber`, `timestamp`.
//! Kind-specific fields are optional and omitted when absent. Operations
//! embed as `{"type":"insert",…}` / `{"type":"delete",…}` objects.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::operation::{OpKind, Operation};

/// Stable numeric message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum MessageType {
    AuthLogin,
    AuthLogout,
    AuthRegister,
    AuthSuccess,
    AuthFailure,
    DocCreate,
    DocOpen,
    DocClose,
    DocList,
    DocInfo,
    DocDelete,
    DocRename,
    DocResponse,
    EditInsert,
    EditDelete,
    EditReplace,
    EditApply,
    EditReject,
    SyncRequest,
    SyncResponse,
    SyncState,
    SyncAck,
    PresenceJoin,
    PresenceLeave,
    PresenceCursor,
    PresenceSelection,
    PresenceUpdate,
    SysError,
    SysInfo,
    SysHeartbeat,
    SysDisconnect,
}

impl From<MessageType> for u16 {
    fn from(t: MessageType) -> u16 {
        use MessageType::*;
        match t {
            AuthLogin => 100,
            AuthLogout => 101,
            AuthRegister => 102,
            AuthSuccess => 103,
            AuthFailure => 104,
            DocCreate => 200,
            DocOpen => 201,
            DocClose => 202,
            DocList => 203,
            DocInfo => 204,
            DocDelete => 205,
            DocRename => 206,
            DocResponse => 207,
            EditInsert => 300,
            EditDelete => 301,
            EditReplace => 302,
            EditApply => 303,
            EditReject => 304,
            SyncRequest => 400,
            SyncResponse => 401,
            SyncState => 402,
            SyncAck => 403,
            PresenceJoin => 500,
            PresenceLeave => 501,
            PresenceCursor => 502,
            PresenceSelection => 503,
            PresenceUpdate => 504,
            SysError => 900,
            SysInfo => 901,
            SysHeartbeat => 902,
            SysDisconnect => 903,
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, ProtocolError> {
        use MessageType::*;
        Ok(match code {
            100 => AuthLogin,
            101 => AuthLogout,
            102 => AuthRegister,
            103 => AuthSuccess,
            104 => AuthFailure,
            200 => DocCreate,
            201 => DocOpen,
            202 => DocClose,
            203 => DocList,
            204 => DocInfo,
            205 => DocDelete,
            206 => DocRename,
            207 => DocResponse,
            300 => EditInsert,
            301 => EditDelete,
            302 => EditReplace,
            303 => EditApply,
            304 => EditReject,
            400 => SyncRequest,
            401 => SyncResponse,
            402 => SyncState,
            403 => SyncAck,
            500 => PresenceJoin,
            501 => PresenceLeave,
            502 => PresenceCursor,
            503 => PresenceSelection,
            504 => PresenceUpdate,
            900 => SysError,
            901 => SysInfo,
            902 => SysHeartbeat,
            903 => SysDisconnect,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::SysInfo
    }
}

impl MessageType {
    pub fn is_edit(&self) -> bool {
        matches!(
            self,
            MessageType::EditInsert | MessageType::EditDelete | MessageType::EditReplace
        )
    }

    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            MessageType::PresenceJoin
                | MessageType::PresenceLeave
                | MessageType::PresenceCursor
                | MessageType::PresenceSelection
                | MessageType::PresenceUpdate
        )
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    UnknownMessageType(u16),
    Malformed(String),
    MissingField(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMessageType(code) => write!(f, "unknown message type {code}"),
            Self::Malformed(e) => write!(f, "malformed message: {e}"),
            Self::MissingField(name) => write!(f, "missing required field '{name}'"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The wire envelope. One struct covers every message kind; fields that a
/// kind does not use stay `None` and are omitted from the JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default)]
    pub timestamp: u64,

    // Auth
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub username: Option<String>,

    // Document management
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document_list: Option<Vec<String>>,

    // Edits
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,

    // Sync
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operations: Option<Vec<Operation>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document_state: Option<String>,

    // Presence
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub selection_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub selection_end: Option<usize>,

    // Outcomes
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            timestamp: now_millis(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, client_id: &str, session_id: &str, seq: u64) -> Self {
        self.client_id = client_id.to_string();
        self.session_id = session_id.to_string();
        self.sequence_number = seq;
        self
    }

    // ── Auth ────────────────────────────────────────────────────────

    pub fn login(username: &str) -> Self {
        let mut e = Self::new(MessageType::AuthLogin);
        e.username = Some(username.to_string());
        e
    }

    pub fn auth_success(session_id: &str, username: &str) -> Self {
        let mut e = Self::new(MessageType::AuthSuccess);
        e.session_id = session_id.to_string();
        e.username = Some(username.to_string());
        e.success = Some(true);
        e
    }

    pub fn auth_failure(reason: &str) -> Self {
        let mut e = Self::new(MessageType::AuthFailure);
        e.success = Some(false);
        e.error_message = Some(reason.to_string());
        e
    }

    // ── Document management ─────────────────────────────────────────

    pub fn doc_response(doc_id: &str) -> Self {
        let mut e = Self::new(MessageType::DocResponse);
        e.document_id = Some(doc_id.to_string());
        e.success = Some(true);
        e
    }

    pub fn doc_error(doc_id: &str, reason: &str) -> Self {
        let mut e = Self::new(MessageType::DocResponse);
        e.document_id = Some(doc_id.to_string());
        e.success = Some(false);
        e.error_message = Some(reason.to_string());
        e
    }

    // ── Edits ───────────────────────────────────────────────────────

    pub fn edit_insert(doc_id: &str, base_revision: u64, op_id: &str, position: usize, text: &str) -> Self {
        let mut e = Self::new(MessageType::EditInsert);
        e.document_id = Some(doc_id.to_string());
        e.document_version = Some(base_revision);
        e.operation_id = Some(op_id.to_string());
        e.position = Some(position);
        e.text = Some(text.to_string());
        e
    }

    pub fn edit_delete(doc_id: &str, base_revision: u64, op_id: &str, position: usize, length: usize) -> Self {
        let mut e = Self::new(MessageType::EditDelete);
        e.document_id = Some(doc_id.to_string());
        e.document_version = Some(base_revision);
        e.operation_id = Some(op_id.to_string());
        e.position = Some(position);
        e.length = Some(length);
        e
    }

    pub fn edit_replace(
        doc_id: &str,
        base_revision: u64,
        op_id: &str,
        position: usize,
        length: usize,
        text: &str,
    ) -> Self {
        let mut e = Self::new(MessageType::EditReplace);
        e.document_id = Some(doc_id.to_string());
        e.document_version = Some(base_revision);
        e.operation_id = Some(op_id.to_string());
        e.position = Some(position);
        e.length = Some(length);
        e.text = Some(text.to_string());
        e
    }

    /// ACK: the submitted operation committed at `revision`.
    pub fn edit_apply(doc_id: &str, op_id: &str, revision: u64) -> Self {
        let mut e = Self::new(MessageType::EditApply);
        e.document_id = Some(doc_id.to_string());
        e.operation_id = Some(op_id.to_string());
        e.document_version = Some(revision);
        e.success = Some(true);
        e
    }

    /// NACK: the submitted operation was refused.
    pub fn edit_reject(doc_id: &str, op_id: &str, reason: &str) -> Self {
        let mut e = Self::new(MessageType::EditReject);
        e.document_id = Some(doc_id.to_string());
        e.operation_id = Some(op_id.to_string());
        e.success = Some(false);
        e.error_message = Some(reason.to_string());
        e
    }

    /// A committed operation broadcast to subscribers. Carries the canonical
    /// transformed operation and the revision it produced.
    pub fn remote_edit(doc_id: &str, op: &Operation, revision: u64, author: &str) -> Self {
        let mut e = match &op.kind {
            OpKind::Insert { position, text } => {
                let mut e = Self::new(MessageType::EditInsert);
                e.position = Some(*position);
                e.text = Some(text.clone());
                e
            }
            OpKind::Delete {
                position,
                length,
                deleted_text,
            } => {
                let mut e = Self::new(MessageType::EditDelete);
                e.position = Some(*position);
                e.length = Some(*length);
                e.text = deleted_text.clone();
                e
            }
            OpKind::Composite { .. } => {
                let mut e = Self::new(MessageType::EditReplace);
                e.operations = Some(vec![op.clone()]);
                e
            }
        };
        e.document_id = Some(doc_id.to_string());
        e.document_version = Some(revision);
        e.operation_id = Some(op.id.to_string());
        e.username = Some(author.to_string());
        e
    }

    // ── Sync ────────────────────────────────────────────────────────

    pub fn sync_request(doc_id: &str, from_version: u64, to_version: Option<u64>) -> Self {
        let mut e = Self::new(MessageType::SyncRequest);
        e.document_id = Some(doc_id.to_string());
        e.from_version = Some(from_version);
        e.to_version = to_version;
        e
    }

    pub fn sync_response(doc_id: &str, from: u64, to: u64, ops: Vec<Operation>) -> Self {
        let mut e = Self::new(MessageType::SyncResponse);
        e.document_id = Some(doc_id.to_string());
        e.from_version = Some(from);
        e.to_version = Some(to);
        e.operations = Some(ops);
        e.success = Some(true);
        e
    }

    /// Full-state fallback when the requested range is unavailable.
    pub fn sync_state(doc_id: &str, text: &str, revision: u64) -> Self {
        let mut e = Self::new(MessageType::SyncState);
        e.document_id = Some(doc_id.to_string());
        e.document_state = Some(text.to_string());
        e.document_version = Some(revision);
        e.success = Some(true);
        e
    }

    // ── Presence ────────────────────────────────────────────────────

    pub fn presence_join(doc_id: &str, username: &str) -> Self {
        let mut e = Self::new(MessageType::PresenceJoin);
        e.document_id = Some(doc_id.to_string());
        e.username = Some(username.to_string());
        e
    }

    pub fn presence_leave(doc_id: &str, username: &str) -> Self {
        let mut e = Self::new(MessageType::PresenceLeave);
        e.document_id = Some(doc_id.to_string());
        e.username = Some(username.to_string());
        e
    }

    pub fn presence_cursor(doc_id: &str, username: &str, position: usize) -> Self {
        let mut e = Self::new(MessageType::PresenceCursor);
        e.document_id = Some(doc_id.to_string());
        e.username = Some(username.to_string());
        e.cursor_position = Some(position);
        e
    }

    pub fn presence_selection(doc_id: &str, username: &str, start: usize, end: usize) -> Self {
        let mut e = Self::new(MessageType::PresenceSelection);
        e.document_id = Some(doc_id.to_string());
        e.username = Some(username.to_string());
        e.selection_start = Some(start);
        e.selection_end = Some(end);
        e
    }

    // ── System ──────────────────────────────────────────────────────

    pub fn sys_error(message: &str) -> Self {
        let mut e = Self::new(MessageType::SysError);
        e.error_message = Some(message.to_string());
        e
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::SysHeartbeat)
    }

    // ── Codec ───────────────────────────────────────────────────────

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Build the OT operation an edit envelope describes. Replace becomes a
    /// composite delete-then-insert at the same position.
    pub fn to_operation(&self) -> Result<Operation, ProtocolError> {
        match self.kind {
            MessageType::EditInsert => {
                let position = self.position.ok_or(ProtocolError::MissingField("position"))?;
                let text = self.text.as_ref().ok_or(ProtocolError::MissingField("text"))?;
                Ok(Operation::insert(position, text.clone()))
            }
            MessageType::EditDelete => {
                let position = self.position.ok_or(ProtocolError::MissingField("position"))?;
                let length = self.length.ok_or(ProtocolError::MissingField("length"))?;
                Ok(Operation::delete(position, length))
            }
            MessageType::EditReplace => {
                if let Some(ops) = &self.operations {
                    // Pre-built composite (broadcast form).
                    if ops.len() == 1 {
                        return Ok(ops[0].clone());
                    }
                    return Ok(Operation::composite(ops.clone()));
                }
                let position = self.position.ok_or(ProtocolError::MissingField("position"))?;
                let length = self.length.ok_or(ProtocolError::MissingField("length"))?;
                let text = self.text.as_ref().ok_or(ProtocolError::MissingField("text"))?;
                Ok(Operation::composite(vec![
                    Operation::delete(position, length),
                    Operation::insert(position, text.clone()),
                ]))
            }
            _ => Err(ProtocolError::Malformed(format!(
                "message type {:?} does not carry an operation",
                self.kind
            ))),
        }
    }

    /// The base revision an edit was authored against.
    pub fn base_revision(&self) -> Result<u64, ProtocolError> {
        self.document_version
            .ok_or(ProtocolError::MissingField("documentVersion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_stable() {
        assert_eq!(u16::from(MessageType::AuthLogin), 100);
        assert_eq!(u16::from(MessageType::AuthFailure), 104);
        assert_eq!(u16::from(MessageType::DocCreate), 200);
        assert_eq!(u16::from(MessageType::DocResponse), 207);
        assert_eq!(u16::from(MessageType::EditInsert), 300);
        assert_eq!(u16::from(MessageType::EditReject), 304);
        assert_eq!(u16::from(MessageType::SyncRequest), 400);
        assert_eq!(u16::from(MessageType::SyncAck), 403);
        assert_eq!(u16::from(MessageType::PresenceJoin), 500);
        assert_eq!(u16::from(MessageType::PresenceUpdate), 504);
        assert_eq!(u16::from(MessageType::SysError), 900);
        assert_eq!(u16::from(MessageType::SysDisconnect), 903);
    }

    #[test]
    fn test_type_roundtrip_all_codes() {
        for code in [
            100u16, 101, 102, 103, 104, 200, 201, 202, 203, 204, 205, 206, 207, 300, 301, 302,
            303, 304, 400, 401, 402, 403, 500, 501, 502, 503, 504, 900, 901, 902, 903,
        ] {
            let t = MessageType::try_from(code).unwrap();
            assert_eq!(u16::from(t), code);
        }
        assert!(MessageType::try_from(105).is_err());
        assert!(MessageType::try_from(0).is_err());
    }

    #[test]
    fn test_envelope_json_shape() {
        let mut e = Envelope::login("alice").with_session("c1", "s1", 7);
        e.timestamp = 1234;
        let json = e.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], 100);
        assert_eq!(value["clientId"], "c1");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["sequenceNumber"], 7);
        assert_eq!(value["timestamp"], 1234);
        assert_eq!(value["username"], "alice");
        // Unused optionals are omitted entirely.
        assert!(value.get("documentId").is_none());
        assert!(value.get("errorMessage").is_none());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let e = Envelope::edit_insert("doc-1", 5, "42", 3, "hi");
        let back = Envelope::decode(&e.encode().unwrap()).unwrap();
        assert_eq!(back.kind, MessageType::EditInsert);
        assert_eq!(back.document_id.as_deref(), Some("doc-1"));
        assert_eq!(back.document_version, Some(5));
        assert_eq!(back.operation_id.as_deref(), Some("42"));
        assert_eq!(back.position, Some(3));
        assert_eq!(back.text.as_deref(), Some("hi"));
    }

    #[test]
    fn test_decode_unknown_type_is_error() {
        let raw = r#"{"type":777,"clientId":"","sessionId":"","sequenceNumber":0,"timestamp":0}"#;
        assert!(Envelope::decode(raw).is_err());
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode("{}").is_err());
    }

    #[test]
    fn test_insert_envelope_to_operation() {
        let e = Envelope::edit_insert("d", 0, "1", 4, "xy");
        let op = e.to_operation().unwrap();
        match op.kind {
            OpKind::Insert { position, text } => {
                assert_eq!(position, 4);
                assert_eq!(text, "xy");
            }
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn test_delete_envelope_to_operation() {
        let e = Envelope::edit_delete("d", 0, "1", 2, 3);
        let op = e.to_operation().unwrap();
        match op.kind {
            OpKind::Delete { position, length, deleted_text } => {
                assert_eq!(position, 2);
                assert_eq!(length, 3);
                assert!(deleted_text.is_none());
            }
            _ => panic!("expected delete"),
        }
    }

    #[test]
    fn test_replace_envelope_builds_composite() {
        let e = Envelope::edit_replace("d", 0, "1", 2, 3, "new");
        let op = e.to_operation().unwrap();
        match &op.kind {
            OpKind::Composite { children } => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0].kind, OpKind::Delete { position: 2, length: 3, .. }));
                assert!(matches!(children[1].kind, OpKind::Insert { position: 2, .. }));
            }
            _ => panic!("expected composite"),
        }
    }

    #[test]
    fn test_missing_fields_reported() {
        let mut e = Envelope::new(MessageType::EditInsert);
        e.document_version = Some(0);
        assert!(matches!(
            e.to_operation(),
            Err(ProtocolError::MissingField("position"))
        ));
        let e = Envelope::new(MessageType::SysHeartbeat);
        assert!(e.to_operation().is_err());
        assert!(matches!(
            Envelope::new(MessageType::EditInsert).base_revision(),
            Err(ProtocolError::MissingField("documentVersion"))
        ));
    }

    #[test]
    fn test_remote_edit_broadcast_roundtrip() {
        let mut op = Operation::insert(2, "Q");
        op.id = 9;
        let e = Envelope::remote_edit("doc-1", &op, 4, "alice");
        let back = Envelope::decode(&e.encode().unwrap()).unwrap();
        assert_eq!(back.kind, MessageType::EditInsert);
        assert_eq!(back.document_version, Some(4));
        assert_eq!(back.username.as_deref(), Some("alice"));
        let got = back.to_operation().unwrap();
        assert_eq!(got.kind, op.kind);
    }

    #[test]
    fn test_remote_edit_composite_carries_operations() {
        let op = Operation::composite(vec![
            Operation::delete_captured(0, 2, "ab"),
            Operation::insert(0, "XY"),
        ]);
        let e = Envelope::remote_edit("doc-1", &op, 7, "bob");
        let back = Envelope::decode(&e.encode().unwrap()).unwrap();
        assert_eq!(back.kind, MessageType::EditReplace);
        let got = back.to_operation().unwrap();
        assert_eq!(got.kind, op.kind);
    }

    #[test]
    fn test_sync_response_carries_ops() {
        let ops = vec![Operation::insert(0, "a"), Operation::delete_captured(1, 1, "b")];
        let e = Envelope::sync_response("d", 2, 4, ops.clone());
        let back = Envelope::decode(&e.encode().unwrap()).unwrap();
        let got = back.operations.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind, ops[0].kind);
        assert_eq!(got[1].kind, ops[1].kind);
    }

    #[test]
    fn test_presence_envelopes() {
        let cursor = Envelope::presence_cursor("d", "alice", 12);
        let back = Envelope::decode(&cursor.encode().unwrap()).unwrap();
        assert_eq!(back.kind, MessageType::PresenceCursor);
        assert_eq!(back.cursor_position, Some(12));
        assert!(back.kind.is_presence());

        let sel = Envelope::presence_selection("d", "alice", 3, 9);
        let back = Envelope::decode(&sel.encode().unwrap()).unwrap();
        assert_eq!(back.selection_start, Some(3));
        assert_eq!(back.selection_end, Some(9));
    }

    #[test]
    fn test_kind_class_helpers() {
        assert!(MessageType::EditInsert.is_edit());
        assert!(MessageType::EditReplace.is_edit());
        assert!(!MessageType::EditApply.is_edit());
        assert!(MessageType::PresenceCursor.is_presence());
        assert!(!MessageType::SyncRequest.is_presence());
    }
}
