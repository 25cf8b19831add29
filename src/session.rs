//! Connection sessions: identity, lifecycle state, document subscriptions,
//! and idle eviction.
//!
//! The registry is the single source of truth for who is connected, which
//! username they hold, and which documents they watch. One mutex guards the
//! session map, the username index, and the subscription index together;
//! every operation is a short map update, never network I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authenticated,
    /// Terminal; the registry forgets the session as it enters this state.
    Disconnected,
}

/// Registry-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    NoSuchSession,
    UsernameTaken(String),
    NotAuthenticated,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchSession => write!(f, "no such session"),
            Self::UsernameTaken(name) => write!(f, "username '{name}' already in use"),
            Self::NotAuthenticated => write!(f, "session is not authenticated"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Scoped ownership of a connection's outbound side.
///
/// Holds the sender feeding the connection's writer task plus a shutdown
/// signal shared with both connection tasks. `close` runs at most once; drop
/// closes too, so removal from the registry always tears the transport down.
#[derive(Debug)]
pub struct TransportGuard {
    sender: Option<mpsc::Sender<Arc<str>>>,
    shutdown: Arc<Notify>,
}

impl TransportGuard {
    pub fn new(sender: mpsc::Sender<Arc<str>>, shutdown: Arc<Notify>) -> Self {
        Self {
            sender: Some(sender),
            shutdown,
        }
    }

    /// For tests and loopback wiring: a guard with no live transport.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            sender: Some(tx),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Clone of the outbound sender, for reply routing.
    pub fn sender(&self) -> Option<mpsc::Sender<Arc<str>>> {
        self.sender.clone()
    }

    fn close(&mut self) {
        if self.sender.take().is_some() {
            self.shutdown.notify_waiters();
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Snapshot of one session's public state.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub username: Option<String>,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub documents: HashSet<String>,
}

struct SessionEntry {
    info: SessionInfo,
    guard: TransportGuard,
}

struct RegistryInner {
    sessions: HashMap<Uuid, SessionEntry>,
    by_username: HashMap<String, Uuid>,
    /// doc id → subscribed session ids.
    doc_index: HashMap<String, HashSet<Uuid>>,
}

/// Thread-safe session registry.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                by_username: HashMap::new(),
                doc_index: HashMap::new(),
            }),
        }
    }

    /// Register a fresh connection. The guard owns the transport's close
    /// path for the rest of the session's life.
    pub fn create_session(&self, guard: TransportGuard) -> Uuid {
        let id = Uuid::new_v4();
        let now = Instant::now();
        let entry = SessionEntry {
            info: SessionInfo {
                id,
                username: None,
                state: SessionState::Connecting,
                created_at: now,
                last_activity: now,
                documents: HashSet::new(),
            },
            guard,
        };
        let mut inner = self.lock();
        inner.sessions.insert(id, entry);
        log::info!("session {id} created");
        id
    }

    /// Atomic username test-and-set; moves the session to `Authenticated`.
    pub fn authenticate(&self, id: Uuid, username: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if let Some(&holder) = inner.by_username.get(username) {
            if holder != id {
                return Err(RegistryError::UsernameTaken(username.to_string()));
            }
        }
        let entry = inner
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::NoSuchSession)?;
        entry.info.username = Some(username.to_string());
        entry.info.state = SessionState::Authenticated;
        entry.info.last_activity = Instant::now();
        inner.by_username.insert(username.to_string(), id);
        log::info!("session {id} authenticated as {username}");
        Ok(())
    }

    pub fn get_session(&self, id: Uuid) -> Option<SessionInfo> {
        self.lock().sessions.get(&id).map(|e| e.info.clone())
    }

    pub fn get_by_username(&self, username: &str) -> Option<SessionInfo> {
        let inner = self.lock();
        let id = inner.by_username.get(username)?;
        inner.sessions.get(id).map(|e| e.info.clone())
    }

    /// Record inbound traffic for liveness. This, not state churn, is what
    /// keeps a session alive.
    pub fn touch(&self, id: Uuid) {
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.info.last_activity = Instant::now();
        }
    }

    /// Outbound sender for direct replies to a session.
    pub fn outbound(&self, id: Uuid) -> Option<mpsc::Sender<Arc<str>>> {
        self.lock().sessions.get(&id).and_then(|e| e.guard.sender())
    }

    /// Subscribe an authenticated session to a document.
    pub fn subscribe_document(&self, id: Uuid, doc_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = inner
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::NoSuchSession)?;
        if entry.info.state != SessionState::Authenticated {
            return Err(RegistryError::NotAuthenticated);
        }
        entry.info.documents.insert(doc_id.to_string());
        entry.info.last_activity = Instant::now();
        inner
            .doc_index
            .entry(doc_id.to_string())
            .or_default()
            .insert(id);
        Ok(())
    }

    pub fn unsubscribe_document(&self, id: Uuid, doc_id: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.sessions.get_mut(&id) {
            entry.info.documents.remove(doc_id);
            entry.info.last_activity = Instant::now();
        }
        if let Some(subs) = inner.doc_index.get_mut(doc_id) {
            subs.remove(&id);
            if subs.is_empty() {
                inner.doc_index.remove(doc_id);
            }
        }
    }

    /// Usernames of authenticated sessions subscribed to `doc_id`.
    pub fn subscribed_users(&self, doc_id: &str) -> Vec<String> {
        let inner = self.lock();
        let Some(subs) = inner.doc_index.get(doc_id) else {
            return Vec::new();
        };
        let mut users: Vec<String> = subs
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|e| e.info.state == SessionState::Authenticated)
            .filter_map(|e| e.info.username.clone())
            .collect();
        users.sort();
        users
    }

    /// Close a session: release its username, drop its subscription-index
    /// entries, run the transport close path. Returns the session's final
    /// snapshot, or `None` if it was already gone.
    pub fn close_session(&self, id: Uuid) -> Option<SessionInfo> {
        let mut inner = self.lock();
        let mut entry = inner.sessions.remove(&id)?;
        entry.info.state = SessionState::Disconnected;
        if let Some(name) = &entry.info.username {
            inner.by_username.remove(name);
        }
        for doc in &entry.info.documents {
            if let Some(subs) = inner.doc_index.get_mut(doc) {
                subs.remove(&id);
                if subs.is_empty() {
                    inner.doc_index.remove(doc);
                }
            }
        }
        log::info!("session {id} closed");
        // Guard dropped here; transport close runs exactly once.
        Some(entry.info)
    }

    /// Close every session idle for longer than `max_idle`; returns the
    /// closed sessions so callers can notify dispatchers. Never blocks on
    /// I/O: closing only drops channel handles.
    pub fn cleanup_idle(&self, max_idle: Duration) -> Vec<SessionInfo> {
        let stale: Vec<Uuid> = {
            let inner = self.lock();
            let now = Instant::now();
            inner
                .sessions
                .iter()
                .filter(|(_, e)| now.duration_since(e.info.last_activity) > max_idle)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut closed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(info) = self.close_session(id) {
                log::info!(
                    "evicted idle session {id} ({})",
                    info.username.as_deref().unwrap_or("unauthenticated")
                );
                closed.push(info);
            }
        }
        closed
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_username_available(&self, username: &str) -> bool {
        !self.lock().by_username.contains_key(username)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_session() -> (SessionRegistry, Uuid) {
        let registry = SessionRegistry::new();
        let id = registry.create_session(TransportGuard::detached());
        (registry, id)
    }

    #[test]
    fn test_create_session_starts_connecting() {
        let (registry, id) = registry_with_session();
        let info = registry.get_session(id).unwrap();
        assert_eq!(info.state, SessionState::Connecting);
        assert!(info.username.is_none());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_authenticate_binds_username() {
        let (registry, id) = registry_with_session();
        registry.authenticate(id, "alice").unwrap();

        let info = registry.get_session(id).unwrap();
        assert_eq!(info.state, SessionState::Authenticated);
        assert_eq!(info.username.as_deref(), Some("alice"));
        assert_eq!(registry.get_by_username("alice").unwrap().id, id);
        assert!(!registry.is_username_available("alice"));
    }

    #[test]
    fn test_username_unique_across_live_sessions() {
        let (registry, id) = registry_with_session();
        registry.authenticate(id, "alice").unwrap();

        let other = registry.create_session(TransportGuard::detached());
        let err = registry.authenticate(other, "alice").unwrap_err();
        assert_eq!(err, RegistryError::UsernameTaken("alice".to_string()));

        // Re-authenticating the holder is fine.
        registry.authenticate(id, "alice").unwrap();
    }

    #[test]
    fn test_close_releases_username() {
        let (registry, id) = registry_with_session();
        registry.authenticate(id, "alice").unwrap();
        let info = registry.close_session(id).unwrap();
        assert_eq!(info.state, SessionState::Disconnected);

        // Terminal: lookups return absent.
        assert!(registry.get_session(id).is_none());
        assert!(registry.get_by_username("alice").is_none());
        assert!(registry.is_username_available("alice"));

        // A new session can take the name.
        let next = registry.create_session(TransportGuard::detached());
        registry.authenticate(next, "alice").unwrap();
    }

    #[test]
    fn test_subscribe_requires_authentication() {
        let (registry, id) = registry_with_session();
        assert_eq!(
            registry.subscribe_document(id, "doc-1").unwrap_err(),
            RegistryError::NotAuthenticated
        );
        registry.authenticate(id, "alice").unwrap();
        registry.subscribe_document(id, "doc-1").unwrap();
        assert_eq!(registry.subscribed_users("doc-1"), vec!["alice"]);
    }

    #[test]
    fn test_membership_index_tracks_subscriptions() {
        let registry = SessionRegistry::new();
        let a = registry.create_session(TransportGuard::detached());
        let b = registry.create_session(TransportGuard::detached());
        registry.authenticate(a, "alice").unwrap();
        registry.authenticate(b, "bob").unwrap();

        registry.subscribe_document(a, "doc-1").unwrap();
        registry.subscribe_document(b, "doc-1").unwrap();
        registry.subscribe_document(b, "doc-2").unwrap();

        assert_eq!(registry.subscribed_users("doc-1"), vec!["alice", "bob"]);
        assert_eq!(registry.subscribed_users("doc-2"), vec!["bob"]);

        registry.unsubscribe_document(b, "doc-1");
        assert_eq!(registry.subscribed_users("doc-1"), vec!["alice"]);
        assert!(registry.subscribed_users("doc-3").is_empty());
    }

    #[test]
    fn test_close_removes_membership_entries() {
        let (registry, id) = registry_with_session();
        registry.authenticate(id, "alice").unwrap();
        registry.subscribe_document(id, "doc-1").unwrap();

        registry.close_session(id);
        assert!(registry.subscribed_users("doc-1").is_empty());
    }

    #[test]
    fn test_cleanup_idle_evicts_and_frees_username() {
        let (registry, id) = registry_with_session();
        registry.authenticate(id, "alice").unwrap();
        registry.subscribe_document(id, "doc-1").unwrap();

        // Nothing is stale yet.
        assert!(registry.cleanup_idle(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let closed = registry.cleanup_idle(Duration::from_millis(5));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].username.as_deref(), Some("alice"));

        assert!(registry.get_session(id).is_none());
        assert!(registry.is_username_available("alice"));
        assert!(registry.subscribed_users("doc-1").is_empty());
    }

    #[test]
    fn test_touch_refreshes_liveness() {
        let (registry, id) = registry_with_session();
        registry.authenticate(id, "alice").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        registry.touch(id);
        assert!(registry.cleanup_idle(Duration::from_millis(15)).is_empty());
        assert!(registry.get_session(id).is_some());
    }

    #[test]
    fn test_transport_guard_closes_once() {
        let (tx, mut rx) = mpsc::channel::<Arc<str>>(1);
        let shutdown = Arc::new(Notify::new());
        let guard = TransportGuard::new(tx, shutdown);

        let registry = SessionRegistry::new();
        let id = registry.create_session(guard);
        registry.close_session(id);

        // Sender dropped with the guard: the channel reports disconnected.
        assert_eq!(
            rx.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }

    #[test]
    fn test_last_activity_monotonic() {
        let (registry, id) = registry_with_session();
        let t0 = registry.get_session(id).unwrap().last_activity;
        registry.authenticate(id, "alice").unwrap();
        let t1 = registry.get_session(id).unwrap().last_activity;
        assert!(t1 >= t0);
        registry.touch(id);
        let t2 = registry.get_session(id).unwrap().last_activity;
        assert!(t2 >= t1);
    }
}
