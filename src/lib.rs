//! Bulwark - request throttling and resilient caching
//!
//! This crate bounds per-caller request rates, memoizes expensive reads and
//! holds short-lived session data. Each primitive runs against a distributed
//! key/counter backend when one is configured and reachable, and degrades to
//! an in-process store when it is absent, slow or failing.

pub mod cache;
pub mod clock;
pub mod config;
pub mod deadline;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod service;
pub mod store;

pub use service::Bulwark;
