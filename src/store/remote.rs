//! Redis-backed distributed counter and key/value client.
//!
//! Keys are namespaced with the configured prefix. Counters use a Lua script
//! so the increment and the expiry are applied in one atomic step, and prefix
//! deletion walks the keyspace with `SCAN` rather than `KEYS`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, Script};
use tracing::{debug, info};

use super::backend::{Backend, BackendError, WindowCount};
use crate::clock::{to_delta, Clock};
use crate::config::BackendConfig;

/// Increment a counter, attaching the window expiry when the key is fresh or
/// has somehow lost its TTL. Returns `{count, pttl}`.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 200;

/// Redis implementation of [`Backend`].
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    increment: Script,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect using the backend section of the configuration.
    ///
    /// The connection attempt is bounded by `connect_timeout_ms`.
    pub async fn connect(config: &BackendConfig, clock: Arc<dyn Clock>) -> Result<Self, BackendError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| BackendError::Unavailable("no backend url configured".to_string()))?;

        let mut info = url.into_connection_info()?;
        if let Some(username) = &config.username {
            info.redis.username = Some(username.clone());
        }
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }

        let client = Client::open(info)?;
        let timeout = config.connect_timeout();
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;

        info!(key_prefix = %config.key_prefix, "Connected to Redis backend");

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
            key_prefix: config.key_prefix.clone(),
            clock,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, BackendError> {
        let key = self.key(key);
        let window_ms = window.as_millis().max(1) as u64;
        let mut conn = self.connection.clone();

        let (count, ttl_ms): (i64, i64) = self
            .increment
            .key(&key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        if count < 1 {
            return Err(BackendError::Protocol(format!(
                "counter {} returned {}",
                key, count
            )));
        }

        let remaining = Duration::from_millis(ttl_ms.max(0) as u64);
        Ok(WindowCount {
            count: count as u64,
            reset_at: self.clock.now() + to_delta(remaining),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, BackendError> {
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted.max(0) as u64;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed = removed, "Deleted keys by prefix");
        Ok(removed)
    }
}

/// Escape Redis glob metacharacters so a prefix matches literally.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    const REDIS_URL: &str = "redis://127.0.0.1/";

    async fn connect(prefix: &str) -> Option<RedisBackend> {
        let config = BackendConfig {
            url: Some(REDIS_URL.to_string()),
            key_prefix: format!("bulwark-test:{}:", prefix),
            connect_timeout_ms: 500,
            ..BackendConfig::default()
        };
        match RedisBackend::connect(&config, Arc::new(SystemClock::new())).await {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("Skipping test: Redis not available ({})", e);
                None
            }
        }
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("cache:plain"), "cache:plain");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[tokio::test]
    async fn test_connect_without_url_is_unavailable() {
        let config = BackendConfig::default();
        let result = RedisBackend::connect(&config, Arc::new(SystemClock::new())).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_increment_sets_expiry() {
        let Some(backend) = connect("increment").await else {
            return;
        };
        backend.delete("ip-1").await.unwrap();

        let first = backend.increment("ip-1", Duration::from_secs(60)).await.unwrap();
        let second = backend.increment("ip-1", Duration::from_secs(60)).await.unwrap();

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.reset_at > chrono::Utc::now());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_set_get_delete_prefix() {
        let Some(backend) = connect("prefix").await else {
            return;
        };
        let ttl = Duration::from_secs(60);
        backend.set("cat:1", b"one".to_vec(), ttl).await.unwrap();
        backend.set("cat:2", b"two".to_vec(), ttl).await.unwrap();
        backend.set("dog:1", b"three".to_vec(), ttl).await.unwrap();

        assert_eq!(backend.get("cat:1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.delete_prefix("cat:").await.unwrap(), 2);
        assert_eq!(backend.get("cat:2").await.unwrap(), None);
        assert_eq!(backend.get("dog:1").await.unwrap(), Some(b"three".to_vec()));

        backend.delete("dog:1").await.unwrap();
    }
}
