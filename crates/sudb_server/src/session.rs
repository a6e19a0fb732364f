//! Per-connection session state machine.
//!
//! Lifecycle: Unauthenticated → Authenticated → Closed. A session only
//! accepts `Query` frames once authenticated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// One client connection's state.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub state: SessionState,
    pub user: String,
    pub remote_addr: String,
    pub created_at: Instant,
    pub last_active: Instant,
    pub request_count: u64,
}

static SESSION_ID_SEQ: AtomicU64 = AtomicU64::new(1);

impl Session {
    pub fn new(remote_addr: String) -> Self {
        Self {
            id: SESSION_ID_SEQ.fetch_add(1, Ordering::Relaxed),
            state: SessionState::Unauthenticated,
            user: String::new(),
            remote_addr,
            created_at: Instant::now(),
            last_active: Instant::now(),
            request_count: 0,
        }
    }

    /// Mark the session authenticated as `user`.
    pub fn on_auth_ok(&mut self, user: &str) {
        self.state = SessionState::Authenticated;
        self.user = user.to_string();
        self.last_active = Instant::now();
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Record a processed request.
    pub fn on_request(&mut self) {
        self.request_count += 1;
        self.last_active = Instant::now();
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// Thread-safe session registry with a capacity bound; shutdown iterates it
/// to wait out in-flight connections.
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<Mutex<Session>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    /// Register a new session. Returns `None` at capacity.
    pub fn register(&self, session: Session) -> Option<Arc<Mutex<Session>>> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        let id = session.id;
        let arc = Arc::new(Mutex::new(session));
        self.sessions.insert(id, arc.clone());
        Some(arc)
    }

    pub fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut s = Session::new("127.0.0.1:4000".into());
        assert_eq!(s.state, SessionState::Unauthenticated);
        assert!(!s.is_authenticated());

        s.on_auth_ok("root");
        assert!(s.is_authenticated());
        assert_eq!(s.user, "root");

        s.on_request();
        assert_eq!(s.request_count, 1);

        s.close();
        assert_eq!(s.state, SessionState::Closed);
        assert!(!s.is_authenticated());
    }

    #[test]
    fn test_registry_capacity() {
        let reg = SessionRegistry::new(2);
        let a = Session::new("a".into());
        let b = Session::new("b".into());
        let c = Session::new("c".into());
        let id_a = a.id;

        assert!(reg.register(a).is_some());
        assert!(reg.register(b).is_some());
        assert!(reg.register(c).is_none());
        assert_eq!(reg.count(), 2);

        reg.remove(id_a);
        assert_eq!(reg.count(), 1);
        assert!(reg.register(Session::new("d".into())).is_some());
    }
}
