//! In-process fallback store.
//!
//! Holds fixed-window counters and TTL'd byte entries in sharded concurrent
//! maps. Mutation of a single key happens under that key's shard lock, so
//! concurrent increments for the same identifier are linearizable while
//! unrelated keys proceed in parallel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::WindowCount;
use crate::clock::{to_delta, Clock};

/// A fixed-window counter record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// Hits recorded in the current window
    pub count: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl CounterRecord {
    fn open(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            window_start: now,
            count: 0,
            reset_at: now + to_delta(window),
        }
    }

    /// A window is elapsed once `now` reaches its end.
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// A cached byte value with an absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl StoredEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Process-wide fallback store.
#[derive(Debug)]
pub struct LocalStore {
    counters: DashMap<String, CounterRecord>,
    entries: DashMap<String, StoredEntry>,
    last_sweep: Mutex<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            entries: DashMap::new(),
            last_sweep: Mutex::new(clock.now()),
            clock,
        }
    }

    /// Increment the counter for `key`, opening a fresh window if none exists
    /// or the previous one has elapsed.
    pub fn increment(&self, key: &str, window: Duration) -> WindowCount {
        let now = self.clock.now();

        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut record = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterRecord::open(now, window));

        if record.is_elapsed(now) {
            trace!(key = %key, "Window elapsed, opening a new one");
            *record = CounterRecord::open(now, window);
        }

        record.count += 1;

        WindowCount {
            count: record.count,
            reset_at: record.reset_at,
        }
    }

    /// Current record for `key`, if its window is still open.
    pub fn counter(&self, key: &str) -> Option<CounterRecord> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .map(|record| record.clone())
            .filter(|record| !record.is_elapsed(now))
    }

    /// Fetch a live entry. Expired entries are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();

        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        // Read guard is released; re-check under the write lock.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store `value` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let expires_at = self.clock.now() + to_delta(ttl);
        self.entries
            .insert(key.to_string(), StoredEntry { value, expires_at });
    }

    /// Remove `key` from both maps. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        let counter = self.counters.remove(key).is_some();
        let entry = self.entries.remove(key).is_some();
        counter || entry
    }

    /// Remove every key starting with `prefix` by linear scan.
    pub fn delete_prefix(&self, prefix: &str) -> u64 {
        let mut removed = 0u64;
        self.counters.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.entries.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Drop every expired counter and entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.len();

        self.counters.retain(|_, record| !record.is_elapsed(now));
        self.entries.retain(|_, entry| !entry.is_expired(now));

        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired fallback entries");
        }
        removed
    }

    /// Sweep unless a sweep already ran within the last `interval`.
    ///
    /// Reclaims fallback records on the request path when no background
    /// sweeper is running.
    pub fn sweep_if_due(&self, interval: Duration) -> usize {
        let now = self.clock.now();
        {
            let mut last = self.last_sweep.lock();
            if now < *last + to_delta(interval) {
                return 0;
            }
            *last = now;
        }
        self.sweep()
    }

    /// Number of counter records currently held.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of byte entries currently held.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.counter_count() + self.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all counters and entries.
    pub fn clear(&self) {
        self.counters.clear();
        self.entries.clear();
    }
}
