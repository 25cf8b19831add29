//! Fan-out to a document's subscribers with backpressure.
//!
//! Each subscriber is a bounded channel feeding that connection's writer
//! task. Sends never block the dispatcher:
//!
//! - edit frames: a full channel means the peer cannot keep up with the
//!   document, so it is dropped from the group and reported for disconnect
//! - presence frames: head-of-line drop, the peer stays subscribed
//!
//! Encoded frames are shared as `Arc<str>` so a room-wide broadcast clones a
//! pointer per peer, not the payload.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

/// How a frame behaves under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Must be delivered in order; a peer that cannot take it is dropped.
    Edit,
    /// Droppable; losing one costs a stale cursor at worst.
    Presence,
}

/// One subscriber of a document room.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub session_id: Uuid,
    pub username: String,
    tx: mpsc::Sender<Arc<str>>,
}

/// Delivery counters for one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub presence_dropped: u64,
    pub peers_disconnected: u64,
}

/// Subscriber set for one document. Owned by the document's dispatcher task,
/// so no interior locking is needed.
pub struct BroadcastGroup {
    peers: HashMap<Uuid, Subscriber>,
    stats: BroadcastStats,
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            stats: BroadcastStats::default(),
        }
    }

    pub fn add_peer(&mut self, session_id: Uuid, username: &str, tx: mpsc::Sender<Arc<str>>) {
        self.peers.insert(
            session_id,
            Subscriber {
                session_id,
                username: username.to_string(),
                tx,
            },
        );
    }

    pub fn remove_peer(&mut self, session_id: &Uuid) -> Option<Subscriber> {
        self.peers.remove(session_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, session_id: &Uuid) -> bool {
        self.peers.contains_key(session_id)
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.values().map(|p| p.username.clone()).collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    /// Send one frame directly to one peer, subject to the class policy.
    /// Returns `false` when the peer had to be dropped.
    pub fn send_to(&mut self, session_id: &Uuid, frame: Arc<str>, class: FrameClass) -> bool {
        let Some(peer) = self.peers.get(session_id) else {
            return true;
        };
        match peer.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) if class == FrameClass::Presence => {
                self.stats.presence_dropped += 1;
                true
            }
            Err(_) => {
                self.stats.peers_disconnected += 1;
                self.peers.remove(session_id);
                false
            }
        }
    }

    /// Fan a frame out to every peer except `origin`. Returns the session
    /// ids of peers dropped for falling behind (or having gone away); the
    /// caller closes their sessions.
    pub fn broadcast(
        &mut self,
        frame: Arc<str>,
        class: FrameClass,
        origin: Option<&Uuid>,
    ) -> Vec<Uuid> {
        let mut dropped = Vec::new();
        for peer in self.peers.values() {
            if Some(&peer.session_id) == origin {
                continue;
            }
            match peer.tx.try_send(frame.clone()) {
                Ok(()) => self.stats.frames_sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) if class == FrameClass::Presence => {
                    self.stats.presence_dropped += 1;
                }
                Err(_) => dropped.push(peer.session_id),
            }
        }
        for id in &dropped {
            self.stats.peers_disconnected += 1;
            self.peers.remove(id);
            log::warn!("dropping slow or vanished subscriber {id}");
        }
        dropped
    }
}
