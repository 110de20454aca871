//! Session Tokens
//!
//! Tokens issued after a successful login, each bound to the identity
//! (caller IP) that logged in. Every successful verification renews the
//! expiry; expired entries are purged lazily.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Session {
    identity: String,
    expires_at: Instant,
}

/// In-memory session table
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Create a new store with the given time-to-live
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session and return its token
    pub fn create(&self, identity: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.lock();
        purge_expired(&mut sessions);
        sessions.insert(
            token.clone(),
            Session {
                identity: identity.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        tracing::info!("New session from {}", identity);
        token
    }

    /// Check that `token` is live and belongs to `identity`, renewing it
    pub fn verify(&self, token: &str, identity: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.lock();
        match sessions.get_mut(token) {
            Some(session) if session.expires_at > now && session.identity == identity => {
                session.expires_at = now + self.ttl;
                true
            }
            Some(session) if session.expires_at <= now => {
                sessions.remove(token);
                false
            }
            _ => false,
        }
    }

    /// End a session. Returns whether it existed.
    pub fn remove(&self, token: &str) -> bool {
        let removed = self.lock().remove(token).is_some();
        if removed {
            tracing::info!("Session logged out");
        }
        removed
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        let mut sessions = self.lock();
        purge_expired(&mut sessions);
        sessions.len()
    }

    /// Whether there are no live sessions
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn purge_expired(sessions: &mut HashMap<String, Session>) {
    let now = Instant::now();
    sessions.retain(|_, s| s.expires_at > now);
}
