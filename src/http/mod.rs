//! HTTP ingress.

mod middleware;
mod server;

pub use middleware::{
    client_identifier, enforce_rate_limit, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use server::HttpServer;
