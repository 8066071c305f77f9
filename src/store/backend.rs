//! Trait for the distributed key/counter service.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by a distributed backend.
///
/// These never reach business callers: the deadline guard turns every one of
/// them into a fallback to the local store.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Unexpected backend reply: {0}")]
    Protocol(String),
}

/// Result of an atomic increment within a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count after this increment.
    pub count: u64,
    /// When the current window expires.
    pub reset_at: DateTime<Utc>,
}

/// Which storage tier a store is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Distributed backend with local fallback.
    Distributed,
    /// In-process store only.
    Local,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Distributed => "distributed",
            BackendMode::Local => "local",
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote key/counter service shared by every instance.
///
/// Keys passed in are already fully derived; implementations may add their own
/// namespace prefix.
#[async_trait]
pub trait Backend: Send + Sync + Debug {
    /// Atomically increment `key`, attaching an expiry of `window` when the key
    /// is fresh (or has lost its expiry).
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, BackendError>;

    /// Fetch the raw bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store `value` under `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Remove every key starting with `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, BackendError>;
}
