//! Ephemeral per-session item collections (e.g. an anonymous cart).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::ResilientStore;

/// Default lifetime of a session after its last write.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 86400);

const NAMESPACE: &str = "session:";

/// Identifies whose session data is stored.
///
/// Derived deterministically: an authenticated user always maps to the same
/// id, and a guest maps to the durable token it was issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionId {
    User(String),
    Guest(Uuid),
}

impl SessionId {
    pub fn for_user(user_id: impl ToString) -> Self {
        SessionId::User(user_id.to_string())
    }

    pub fn guest(token: Uuid) -> Self {
        SessionId::Guest(token)
    }

    /// Issue a fresh guest token.
    pub fn new_guest() -> Self {
        SessionId::Guest(Uuid::new_v4())
    }

    /// Parse the string form produced by `Display`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, value) = raw.split_once(':')?;
        match kind {
            "user" if !value.is_empty() => Some(SessionId::User(value.to_string())),
            "guest" => Uuid::parse_str(value).ok().map(SessionId::Guest),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionId::User(id) => write!(f, "user:{}", id),
            SessionId::Guest(token) => write!(f, "guest:{}", token),
        }
    }
}

/// Persists and expires session item lists. Each write refreshes the TTL.
#[derive(Debug)]
pub struct SessionStore {
    store: ResilientStore,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(store: ResilientStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(session: &SessionId) -> String {
        format!("{}{}", NAMESPACE, session)
    }

    /// Items for `session`, or an empty list if none are stored.
    pub async fn get<T: DeserializeOwned>(&self, session: &SessionId) -> Vec<T> {
        let key = Self::key(session);
        let Some(bytes) = self.store.get(&key).await else {
            return Vec::new();
        };

        match serde_json::from_slice(&bytes) {
            Ok(items) => items,
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt session entry, treating as empty");
                Vec::new()
            }
        }
    }

    /// Replace the items for `session` and extend its lifetime.
    pub async fn set<T: Serialize>(&self, session: &SessionId, items: &[T]) {
        let key = Self::key(session);
        match serde_json::to_vec(items) {
            Ok(bytes) => {
                self.store.set(&key, bytes, self.ttl).await;
                debug!(key = %key, items = items.len(), "Stored session items");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Session items are not serializable, not stored");
            }
        }
    }

    /// Drop the session entirely.
    pub async fn clear(&self, session: &SessionId) {
        self.store.delete(&Self::key(session)).await;
    }
}
