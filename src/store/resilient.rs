//! The single storage interface used by the limiter, cache and sessions.
//!
//! The tier is chosen once at construction. In distributed mode every call
//! goes to the remote backend under the deadline guard and degrades to the
//! local store when the backend errors or is too slow; in local mode the
//! local store is used directly.
//!
//! No background sweeper runs in distributed mode, so records written to the
//! fallback during an outage are reclaimed from the request path at most once
//! per sweep interval.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::backend::{Backend, BackendMode, WindowCount};
use super::local::LocalStore;
use crate::deadline::DeadlineGuard;

/// Storage facade whose operations always produce a value.
#[derive(Debug, Clone)]
pub enum ResilientStore {
    /// No distributed backend is configured or reachable.
    Local(Arc<LocalStore>),
    /// Distributed backend with the local store as fallback.
    Distributed {
        remote: Arc<dyn Backend>,
        fallback: Arc<LocalStore>,
        guard: DeadlineGuard,
        sweep_interval: Duration,
    },
}

impl ResilientStore {
    pub fn local(store: Arc<LocalStore>) -> Self {
        ResilientStore::Local(store)
    }

    pub fn distributed(
        remote: Arc<dyn Backend>,
        fallback: Arc<LocalStore>,
        guard: DeadlineGuard,
        sweep_interval: Duration,
    ) -> Self {
        ResilientStore::Distributed {
            remote,
            fallback,
            guard,
            sweep_interval,
        }
    }

    pub fn mode(&self) -> BackendMode {
        match self {
            ResilientStore::Local(_) => BackendMode::Local,
            ResilientStore::Distributed { .. } => BackendMode::Distributed,
        }
    }

    /// The in-process store, present in both modes.
    pub fn local_store(&self) -> &Arc<LocalStore> {
        match self {
            ResilientStore::Local(store) => store,
            ResilientStore::Distributed { fallback, .. } => fallback,
        }
    }

    /// Atomically count a hit for `key` within a fixed window.
    pub async fn increment(&self, key: &str, window: Duration) -> WindowCount {
        match self {
            ResilientStore::Local(store) => store.increment(key, window),
            ResilientStore::Distributed {
                remote,
                fallback,
                guard,
                sweep_interval,
            } => {
                let counted = guard
                    .run("increment", remote.increment(key, window), || {
                        fallback.increment(key, window)
                    })
                    .await;
                fallback.sweep_if_due(*sweep_interval);
                counted
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self {
            ResilientStore::Local(store) => store.get(key),
            ResilientStore::Distributed {
                remote,
                fallback,
                guard,
                sweep_interval,
            } => {
                let value = guard
                    .run("get", remote.get(key), || fallback.get(key))
                    .await;
                fallback.sweep_if_due(*sweep_interval);
                value
            }
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        match self {
            ResilientStore::Local(store) => store.set(key, value, ttl),
            ResilientStore::Distributed {
                remote,
                fallback,
                guard,
                sweep_interval,
            } => {
                // The fallback needs its own copy in case the remote call fails.
                let local_copy = value.clone();
                guard
                    .run("set", remote.set(key, value, ttl), || {
                        fallback.set(key, local_copy, ttl)
                    })
                    .await;
                fallback.sweep_if_due(*sweep_interval);
            }
        }
    }

    /// Remove `key`: best effort on the remote backend, always locally.
    pub async fn delete(&self, key: &str) {
        match self {
            ResilientStore::Local(store) => {
                store.delete(key);
            }
            ResilientStore::Distributed {
                remote,
                fallback,
                guard,
                ..
            } => {
                guard.run("delete", remote.delete(key), || ()).await;
                fallback.delete(key);
            }
        }
        trace!(key = %key, "Deleted key");
    }

    /// Remove every key starting with `prefix` from both tiers.
    pub async fn delete_prefix(&self, prefix: &str) -> u64 {
        match self {
            ResilientStore::Local(store) => store.delete_prefix(prefix),
            ResilientStore::Distributed {
                remote,
                fallback,
                guard,
                ..
            } => {
                let remote_removed = guard
                    .run("delete_prefix", remote.delete_prefix(prefix), || 0)
                    .await;
                remote_removed + fallback.delete_prefix(prefix)
            }
        }
    }
}
