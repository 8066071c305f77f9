//! Rate limiting logic.

mod limiter;
mod policy;

pub use limiter::{RateDecision, RateLimiter, DEFAULT_SCOPE};
pub use policy::{RateLimitPolicy, TimeUnit};
