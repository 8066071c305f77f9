//! Fixed-window rate limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::policy::RateLimitPolicy;
use crate::clock::Clock;
use crate::store::{BackendMode, ResilientStore};

/// Scope used when none is configured.
pub const DEFAULT_SCOPE: &str = "default";

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request is within quota
    pub allowed: bool,
    /// The policy limit applied
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// How long a denied caller should wait; zero when allowed
    pub retry_after: Duration,
}

/// Answers "is this identifier within its quota for the current window?".
///
/// The hit is counted before the comparison, so denied requests are recorded
/// too and cannot shorten or reset a window.
#[derive(Debug)]
pub struct RateLimiter {
    store: ResilientStore,
    clock: Arc<dyn Clock>,
    scope: String,
    policies: HashMap<String, RateLimitPolicy>,
}

impl RateLimiter {
    pub fn new(store: ResilientStore, clock: Arc<dyn Clock>) -> Self {
        Self::with_policies(store, clock, DEFAULT_SCOPE, HashMap::new())
    }

    /// Create a limiter with a key scope and a table of named policies.
    pub fn with_policies(
        store: ResilientStore,
        clock: Arc<dyn Clock>,
        scope: impl Into<String>,
        policies: HashMap<String, RateLimitPolicy>,
    ) -> Self {
        Self {
            store,
            clock,
            scope: scope.into(),
            policies,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn mode(&self) -> BackendMode {
        self.store.mode()
    }

    /// Look up a configured policy by name.
    pub fn policy(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(name)
    }

    fn key(&self, identifier: &str) -> String {
        format!("ratelimit:{}:{}", self.scope, identifier)
    }

    /// Count one hit for `identifier` and decide against `policy`.
    pub async fn check(&self, identifier: &str, policy: &RateLimitPolicy) -> RateDecision {
        let key = self.key(identifier);

        trace!(
            key = %key,
            limit = policy.limit(),
            window_secs = policy.window().as_secs(),
            "Checking rate limit"
        );

        let counted = self.store.increment(&key, policy.window()).await;
        let allowed = counted.count <= policy.limit();
        let remaining = policy.limit().saturating_sub(counted.count);

        let retry_after = if allowed {
            Duration::ZERO
        } else {
            debug!(
                key = %key,
                count = counted.count,
                limit = policy.limit(),
                "Rate limit exceeded"
            );
            (counted.reset_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        };

        RateDecision {
            allowed,
            limit: policy.limit(),
            remaining,
            reset_at: counted.reset_at,
            retry_after,
        }
    }

    /// Check against a named policy.
    ///
    /// Returns `None` when no such policy is configured; callers let the
    /// request through rather than block on a missing policy.
    pub async fn check_named(&self, identifier: &str, policy_name: &str) -> Option<RateDecision> {
        let Some(policy) = self.policies.get(policy_name).copied() else {
            warn!(policy = %policy_name, "Unknown rate limit policy, allowing request");
            return None;
        };
        Some(self.check(identifier, &policy).await)
    }
}
