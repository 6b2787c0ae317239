//! Process-local session registry.
//!
//! A session binds a principal to a socket for the duration of a
//! conversation. Ids carry 256 bits of entropy; expiry is enforced on every
//! access and by a periodic sweep, both against a sliding inactivity window
//! and an absolute lifetime cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use tracing::debug;

use super::Principal;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub principal: Principal,
    pub created_at: DateTime<Utc>,
    /// Sliding expiry, pushed forward by [`SessionRegistry::extend`].
    pub expires_at: DateTime<Utc>,
    /// Hard cap; extending never moves a session past this.
    pub absolute_expires_at: DateTime<Utc>,
    /// Connection the session is bound to, once `authenticate` has run.
    pub bound_connection: Option<u64>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at || now >= self.absolute_expires_at
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    timeout: Duration,
    absolute_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(timeout_secs: u64, absolute_timeout_secs: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout: Duration::seconds(timeout_secs as i64),
            absolute_timeout: Duration::seconds(absolute_timeout_secs as i64),
        }
    }

    /// Mint a session for `principal`. The id is 32 random bytes, hex-encoded.
    pub fn create_session(&self, principal: Principal) -> Session {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let id = hex::encode(raw);

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            principal,
            created_at: now,
            expires_at: now + self.timeout,
            absolute_expires_at: now + self.absolute_timeout,
            bound_connection: None,
        };
        self.sessions
            .lock()
            .expect("session lock")
            .insert(id, session.clone());
        session
    }

    /// Look up a live session. Expired entries are purged on the spot and
    /// reported as missing — callers cannot distinguish the two.
    pub fn validate(&self, id: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session lock");
        match sessions.get(id) {
            Some(s) if s.is_expired(now) => {
                sessions.remove(id);
                None
            }
            Some(s) => Some(s.clone()),
            None => None,
        }
    }

    /// Slide the expiry forward by `seconds`, capped at the absolute
    /// lifetime. Atomic with validation: an expired session never extends.
    pub fn extend(&self, id: &str, seconds: u64) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session lock");
        match sessions.get_mut(id) {
            Some(s) if s.is_expired(now) => {
                sessions.remove(id);
                false
            }
            Some(s) => {
                let slid = now + Duration::seconds(seconds as i64);
                s.expires_at = slid.min(s.absolute_expires_at);
                true
            }
            None => false,
        }
    }

    /// Validate-and-delete, for single-use binding semantics.
    pub fn consume(&self, id: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session lock");
        let session = sessions.remove(id)?;
        if session.is_expired(now) {
            return None;
        }
        Some(session)
    }

    /// Bind a live, unbound session to `connection_id`. Fails if the session
    /// is missing, expired, or already bound to a different connection.
    pub fn bind_connection(&self, id: &str, connection_id: u64) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session lock");
        let session = sessions.get_mut(id)?;
        if session.is_expired(now) {
            sessions.remove(id);
            return None;
        }
        match session.bound_connection {
            Some(bound) if bound != connection_id => None,
            _ => {
                session.bound_connection = Some(connection_id);
                Some(session.clone())
            }
        }
    }

    pub fn delete(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .expect("session lock")
            .remove(id)
            .is_some()
    }

    pub fn list_for_principal(&self, user_id: &str) -> Vec<Session> {
        let now = Utc::now();
        self.sessions
            .lock()
            .expect("session lock")
            .values()
            .filter(|s| s.principal.user_id == user_id && !s.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("session lock").len()
    }

    pub fn clear_all(&self) {
        self.sessions.lock().expect("session lock").clear();
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session lock");
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }
}

/// Start the background sweeper. The spawned task lives on the runtime and
/// dies with it, so it never delays shutdown.
pub fn start_sweeper(registry: Arc<SessionRegistry>, cleanup_interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            let removed = registry.sweep_expired();
            if removed > 0 {
                debug!(removed, "session sweep");
            }
        }
    });
}
