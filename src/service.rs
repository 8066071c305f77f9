//! The process-wide service object.
//!
//! `Bulwark` is constructed once at startup and passed by reference to
//! request handlers. It owns the storage tier, the limiter, the cache, the
//! session store and, in local-only mode, the background fallback sweeper.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{CacheStore, SessionStore};
use crate::clock::{Clock, SystemClock};
use crate::config::BulwarkConfig;
use crate::deadline::DeadlineGuard;
use crate::error::Result;
use crate::ratelimit::{RateLimitPolicy, RateLimiter};
use crate::store::{Backend, BackendMode, LocalStore, RedisBackend, ResilientStore, Sweeper};

/// Rate limiting, caching and session storage behind one handle.
#[derive(Debug)]
pub struct Bulwark {
    store: ResilientStore,
    rate_limiter: RateLimiter,
    cache: CacheStore,
    sessions: SessionStore,
    sweeper: Option<Sweeper>,
    ingress_policy: String,
}

impl Bulwark {
    /// Build the layer from configuration using the system clock.
    pub async fn connect(config: &BulwarkConfig) -> Result<Self> {
        Self::connect_with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// Build the layer from configuration.
    ///
    /// Invalid configuration is the only error. A configured backend that
    /// cannot be reached puts the layer in local-only mode.
    pub async fn connect_with_clock(config: &BulwarkConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let remote: Option<Arc<dyn Backend>> = if config.backend.is_configured() {
            match RedisBackend::connect(&config.backend, Arc::clone(&clock)).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    warn!(error = %e, "Distributed backend unreachable, running on local store only");
                    None
                }
            }
        } else {
            info!("No distributed backend configured, running on local store only");
            None
        };

        Self::assemble(config, remote, clock)
    }

    /// Build the layer around an already-connected backend.
    pub fn with_backend(
        config: &BulwarkConfig,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, Some(backend), clock)
    }

    /// Build the layer on the local store only.
    pub fn local(config: &BulwarkConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, None, clock)
    }

    fn assemble(
        config: &BulwarkConfig,
        remote: Option<Arc<dyn Backend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let local = Arc::new(LocalStore::new(Arc::clone(&clock)));

        let (store, sweeper) = match remote {
            Some(remote) => {
                let guard = DeadlineGuard::new(config.deadline.timeout());
                (
                    ResilientStore::distributed(
                        remote,
                        local,
                        guard,
                        config.fallback.sweep_interval(),
                    ),
                    None,
                )
            }
            None => {
                let sweeper = Sweeper::start(Arc::clone(&local), config.fallback.sweep_interval());
                (ResilientStore::local(local), Some(sweeper))
            }
        };

        let rate_limiter = RateLimiter::with_policies(
            store.clone(),
            clock,
            config.rate_limiting.scope.clone(),
            config.rate_limiting.policies()?,
        );
        let cache = CacheStore::new(store.clone(), config.cache.default_ttl());
        let sessions = SessionStore::new(store.clone(), config.session.ttl());

        info!(
            mode = %store.mode(),
            deadline_ms = config.deadline.timeout_ms,
            "Bulwark initialized"
        );

        Ok(Self {
            store,
            rate_limiter,
            cache,
            sessions,
            sweeper,
            ingress_policy: config.rate_limiting.ingress_policy.clone(),
        })
    }

    pub fn mode(&self) -> BackendMode {
        self.store.mode()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The in-process store, for inspection.
    pub fn local_store(&self) -> &Arc<LocalStore> {
        self.store.local_store()
    }

    /// Look up a configured policy by name.
    pub fn policy(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.rate_limiter.policy(name)
    }

    /// Name of the policy the HTTP ingress applies.
    pub fn ingress_policy(&self) -> &str {
        &self.ingress_policy
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.as_ref().is_some_and(Sweeper::is_running)
    }

    /// Stop background work.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop().await;
        }
        info!("Bulwark shut down");
    }
}
