//! Session table shared by every connection handler of a server or router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::crypto::SessionKey;

/// Security context created by a successful handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub key: SessionKey,
    /// Display name the remote side announced.
    pub name: String,
    pub peer: SocketAddr,
    pub established: Instant,
    pub last_seen: Instant,
}

impl Session {
    pub fn new(key: SessionKey, name: String, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            key,
            name,
            peer,
            established: now,
            last_seen: now,
        }
    }
}

/// Concurrent session-id → session map. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> String {
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Look up and touch a session.
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut entry = self.sessions.get_mut(id)?;
        entry.last_seen = Instant::now();
        Some(entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Drop sessions idle for longer than `idle`. Returns how many were dropped.
    pub fn prune(&self, idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.last_seen.elapsed() <= idle);
        before.saturating_sub(self.sessions.len())
    }
}
