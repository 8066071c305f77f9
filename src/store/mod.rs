//! Storage tiers: the distributed backend, the local fallback and the
//! facade that picks between them.

mod backend;
mod local;
mod remote;
mod resilient;
mod sweeper;

pub use backend::{Backend, BackendError, BackendMode, WindowCount};
pub use local::{CounterRecord, LocalStore, StoredEntry};
pub use remote::RedisBackend;
pub use resilient::ResilientStore;
pub use sweeper::{Sweeper, DEFAULT_SWEEP_INTERVAL};

#[cfg(test)]
pub(crate) use resilient::tests::FailingBackend;
