//! Read-through caching and session-scoped storage.

mod key;
mod session;
mod singleflight;
mod store;

pub use key::CacheKey;
pub use session::{SessionId, SessionStore, DEFAULT_SESSION_TTL};
pub use singleflight::{FlightTicket, SingleFlight};
pub use store::{CacheStore, DEFAULT_CACHE_TTL};
