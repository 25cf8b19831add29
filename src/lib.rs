//! # collabedit — real-time collaborative text editing
//!
//! A multi-user editing core built on operational transformation (OT): an
//! authoritative server reconciles concurrent edits submitted against stale
//! revisions, and every client runs the same engine so local edits echo
//! instantly while remote ones merge without conflict.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │ ClientEngine │   JSON envelopes   │   sessions   │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │ per document
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ local text + │                    │ DocDispatcher│
//! │ pending ops  │                    │ (total order)│
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ Document     │
//!                                     │ Controller   │
//!                                     │ text · log · │
//!                                     │ undo history │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — insert/delete/composite algebra: apply, invert, transform
//! - [`history`] — per-user undo/redo that survives concurrent edits
//! - [`document`] — authoritative text, revision counter, operation log
//! - [`session`] — connection registry, username binding, idle eviction
//! - [`broadcast`] — subscriber fan-out with backpressure
//! - [`dispatch`] — per-document single-writer actor
//! - [`engine`] — client-side replica with a pending buffer
//! - [`protocol`] — JSON wire envelope with stable numeric type codes
//! - [`server`] / [`client`] — WebSocket transport on either side
//! - [`config`] — `KEY=VALUE` configuration files

pub mod broadcast;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod engine;
pub mod history;
pub mod operation;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, FrameClass};
pub use client::{ClientEvent, CollabClient};
pub use config::{ConfigFile, EditorMode};
pub use dispatch::{DispatcherTable, DocCommand, DocHandle, DocInfo};
pub use document::{DocError, DocumentController};
pub use engine::ClientEngine;
pub use history::HistoryManager;
pub use operation::{OpKind, OpSource, Operation, OperationError};
pub use protocol::{Envelope, MessageType, ProtocolError};
pub use server::{CollabServer, ServerConfig, ServerError, ServerStats};
pub use session::{SessionRegistry, SessionState, TransportGuard};
