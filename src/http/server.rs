//! HTTP server fronted by the ingress rate limiter.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tracing::{error, info};

use super::middleware::enforce_rate_limit;
use crate::error::{BulwarkError, Result};
use crate::service::Bulwark;

/// HTTP server exposing the health endpoint behind the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The shared layer
    bulwark: Arc<Bulwark>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, bulwark: Arc<Bulwark>) -> Self {
        Self { addr, bulwark }
    }

    /// Build the router. Every route passes through the ingress limiter.
    pub fn router(bulwark: Arc<Bulwark>) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&bulwark),
                enforce_rate_limit,
            ))
            .with_state(bulwark)
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");

        let app = Self::router(self.bulwark);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            BulwarkError::Io(e)
        })
    }
}

async fn healthz(State(bulwark): State<Arc<Bulwark>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "backend": bulwark.mode().as_str(),
    }))
}
