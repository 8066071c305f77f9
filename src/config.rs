//! Configuration management for Bulwark.
//!
//! Every field is optional. With no backend URL the layer runs on the local
//! fallback store only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::{RateLimitPolicy, TimeUnit, DEFAULT_SCOPE};

/// Main configuration for the Bulwark layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// HTTP ingress configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Distributed backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Deadline applied to every backend call
    #[serde(default)]
    pub deadline: DeadlineConfig,

    /// Local fallback store
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Rate limiting policies
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Read-through cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Ephemeral session store
    #[serde(default)]
    pub session: SessionConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Distributed backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Connection URL, e.g. `redis://cache.internal:6379/0`
    #[serde(default)]
    pub url: Option<String>,

    /// Overrides the username in the URL
    #[serde(default)]
    pub username: Option<String>,

    /// Overrides the password in the URL
    #[serde(default)]
    pub password: Option<String>,

    /// Prefix applied to every key on the backend
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on the initial connection attempt in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "bulwark:".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

/// Deadline guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Timeout for a single backend call in milliseconds
    #[serde(default = "default_deadline_timeout")]
    pub timeout_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_deadline_timeout(),
        }
    }
}

impl DeadlineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_deadline_timeout() -> u64 {
    1500
}

/// Local fallback store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Sweep interval in seconds (local-only mode)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl FallbackConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// A named rate limit, in Envoy's `requests_per_unit` / `unit` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Key scope shared by all limiter keys
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Policy applied by the HTTP ingress middleware
    #[serde(default = "default_ingress_policy")]
    pub ingress_policy: String,

    /// Named policies
    #[serde(default = "default_policies")]
    pub policies: HashMap<String, PolicyConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            ingress_policy: default_ingress_policy(),
            policies: default_policies(),
        }
    }
}

impl RateLimitingConfig {
    /// Validate and convert every named policy.
    pub fn policies(&self) -> Result<HashMap<String, RateLimitPolicy>> {
        self.policies
            .iter()
            .map(|(name, policy)| {
                RateLimitPolicy::per_unit(policy.requests_per_unit, policy.unit)
                    .map(|validated| (name.clone(), validated))
                    .map_err(|e| BulwarkError::Config(format!("policy '{}': {}", name, e)))
            })
            .collect()
    }
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_ingress_policy() -> String {
    "default".to_string()
}

fn default_policies() -> HashMap<String, PolicyConfig> {
    let mut policies = HashMap::new();
    policies.insert(
        "default".to_string(),
        PolicyConfig {
            requests_per_unit: 100,
            unit: TimeUnit::Minute,
        },
    );
    policies
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default TTL for cached reads in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

fn default_cache_ttl() -> u64 {
    300
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime after the last write, in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_session_ttl() -> u64 {
    7 * 86400
}

impl BulwarkConfig {
    /// Load configuration from an optional file layered under `BULWARK__*`
    /// environment variables (e.g. `BULWARK__BACKEND__URL`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix("BULWARK").separator("__"));

        let config: BulwarkConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reject settings the layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.deadline.timeout_ms == 0 {
            return Err(BulwarkError::Config(
                "deadline.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.fallback.sweep_interval_secs == 0 {
            return Err(BulwarkError::Config(
                "fallback.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(BulwarkError::Config(
                "cache.default_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(BulwarkError::Config(
                "session.ttl_secs must be greater than zero".to_string(),
            ));
        }

        let policies = self.rate_limiting.policies()?;
        if !policies.contains_key(&self.rate_limiting.ingress_policy) {
            return Err(BulwarkError::Config(format!(
                "ingress policy '{}' is not defined",
                self.rate_limiting.ingress_policy
            )));
        }
        Ok(())
    }
}
