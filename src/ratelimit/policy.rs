//! Rate limit policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BulwarkError, Result};

/// Time unit for configured policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A validated `{limit, window}` pair.
///
/// Construction rejects a zero limit or a zero window, so a policy that exists
/// is always usable at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    limit: u64,
    window: Duration,
}

impl RateLimitPolicy {
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(BulwarkError::Config(
                "rate limit must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(BulwarkError::Config(
                "rate limit window must be greater than zero".to_string(),
            ));
        }
        Ok(Self { limit, window })
    }

    /// `limit` requests per one `unit`.
    pub fn per_unit(limit: u64, unit: TimeUnit) -> Result<Self> {
        Self::new(limit, unit.duration())
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
