use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Compaction pass interval for expired sessions.
const COMPACT_INTERVAL_SECS: u64 = 60;

/// An issued session. The token is opaque to callers; capabilities are a
/// snapshot of the tenant's capability names at creation time.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub capabilities: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Per-tenant in-memory session store.
///
/// Tokens carry 256 bits of OS entropy, hex-encoded. Expired entries are
/// evicted lazily on validation and swept by a background compaction task.
/// The store dies with its tenant: `destroy` drops every session regardless
/// of remaining TTL.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl_secs: u64,
    shutdown: Arc<Notify>,
    destroyed: AtomicBool,
}

impl SessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_secs,
            shutdown: Arc::new(Notify::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Issue a new session over the given capability snapshot.
    pub fn create(&self, capabilities: Vec<String>) -> Session {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);

        let session = Session {
            token: hex::encode(raw),
            capabilities,
            expires_at: Utc::now() + chrono::Duration::seconds(self.ttl_secs as i64),
        };
        self.sessions
            .insert(session.token.clone(), session.clone());
        session
    }

    /// Look up a token. Unknown or expired tokens return `None`; an expired
    /// entry is evicted on the spot.
    pub fn validate(&self, token: &str) -> Option<Session> {
        let expired = match self.sessions.get(token) {
            Some(entry) => {
                if entry.is_expired() {
                    true
                } else {
                    return Some(entry.value().clone());
                }
            }
            None => return None,
        };
        if expired {
            self.sessions.remove(token);
        }
        None
    }

    /// Remove a token. Idempotent; unknown tokens are a no-op.
    pub fn end(&self, token: &str) {
        self.sessions.remove(token);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Spawn the background sweep for expired sessions; exits on `destroy`.
    pub fn start_compaction(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(COMPACT_INTERVAL_SECS)) => {}
                    _ = shutdown.notified() => return,
                }
                store.compact();
            }
        });
    }

    fn compact(&self) {
        self.sessions.retain(|_, s| !s.is_expired());
    }

    /// Stop compaction and drop all sessions. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        self.sessions.clear();
    }
}
