//! Deadline guard for backend calls.
//!
//! Races a backend operation against a timer. The operation's value is used if
//! it succeeds in time; a failure or a timeout runs the synchronous fallback
//! instead. The guard never returns an error.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::BackendError;

/// Default deadline for backend calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Bounds every backend call with a fixed timeout.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineGuard {
    timeout: Duration,
}

impl DeadlineGuard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation` under the deadline, falling back on error or timeout.
    ///
    /// `op` names the operation in log output.
    pub async fn run<T, Fut, F>(&self, op: &'static str, operation: Fut, fallback: F) -> T
    where
        Fut: Future<Output = Result<T, BackendError>>,
        F: FnOnce() -> T,
    {
        with_deadline(op, operation, self.timeout, fallback).await
    }
}

impl Default for DeadlineGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// Race `operation` against `timeout`.
///
/// The timer is owned by the `tokio::time::timeout` future and is dropped on
/// every path, so neither side outlives this call.
pub async fn with_deadline<T, Fut, F>(
    op: &'static str,
    operation: Fut,
    timeout: Duration,
    fallback: F,
) -> T
where
    Fut: Future<Output = Result<T, BackendError>>,
    F: FnOnce() -> T,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            debug!(op = op, error = %e, "Backend call failed, using fallback");
            fallback()
        }
        Err(_) => {
            warn!(
                op = op,
                timeout_ms = timeout.as_millis() as u64,
                "Backend call timed out, using fallback"
            );
            fallback()
        }
    }
}
