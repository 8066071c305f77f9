//! Ingress rate limiting middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::ratelimit::RateDecision;
use crate::service::Bulwark;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Apply the ingress policy to every request.
///
/// Denied requests get `429 Too Many Requests`; every limited response carries
/// the quota headers.
pub async fn enforce_rate_limit(
    State(bulwark): State<Arc<Bulwark>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identifier = client_identifier(&request);

    let Some(decision) = bulwark
        .rate_limiter()
        .check_named(&identifier, bulwark.ingress_policy())
        .await
    else {
        return next.run(request).await;
    };

    if !decision.allowed {
        debug!(identifier = %identifier, "Rejecting request over quota");
        let mut response = StatusCode::TOO_MANY_REQUESTS.into_response();
        let headers = response.headers_mut();
        apply_quota_headers(headers, &decision);
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(&decision)));
        return response;
    }

    let mut response = next.run(request).await;
    apply_quota_headers(response.headers_mut(), &decision);
    response
}

/// Caller identity: the first `X-Forwarded-For` hop, else the peer address.
pub fn client_identifier<B>(request: &Request<B>) -> String {
    let forwarded = request
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if let Some(forwarded) = forwarded {
        return forwarded.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

fn apply_quota_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp().max(0)),
    );
}

/// Whole seconds to wait, rounded up and never zero.
fn retry_after_secs(decision: &RateDecision) -> u64 {
    let wait = decision.retry_after;
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::{BulwarkConfig, PolicyConfig};
    use crate::ratelimit::TimeUnit;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(limit: u64) -> Router {
        let mut config = BulwarkConfig::default();
        config.rate_limiting.policies.insert(
            "default".to_string(),
            PolicyConfig {
                requests_per_unit: limit,
                unit: TimeUnit::Minute,
            },
        );
        let bulwark = Arc::new(Bulwark::local(&config, Arc::new(MockClock::default())).unwrap());

        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(bulwark, enforce_rate_limit))
    }

    fn request(forwarded_for: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header(X_FORWARDED_FOR, forwarded_for)
            .body(Body::empty())
            .expect("request should build")
    }

    #[tokio::test]
    async fn test_allowed_requests_carry_quota_headers() {
        let app = app(2);
        let response = app.oneshot(request("10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "2");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "1");
        assert!(response.headers().contains_key(X_RATELIMIT_RESET));
        assert!(!response.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_over_quota_is_rejected() {
        let app = app(1);
        let first = app.clone().oneshot(request("10.0.0.2")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(request("10.0.0.2")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(second.headers()[RETRY_AFTER], "60");

        let other = app.oneshot(request("10.0.0.3")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[test]
    fn test_client_identifier_prefers_forwarded_for() {
        let request = Request::builder()
            .header(X_FORWARDED_FOR, " 203.0.113.9 , 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_identifier(&request), "203.0.113.9");
    }

    #[test]
    fn test_client_identifier_falls_back_to_peer() {
        let mut request = Request::builder().body(()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 5000))));
        assert_eq!(client_identifier(&request), "192.0.2.4");

        let bare = Request::builder().body(()).unwrap();
        assert_eq!(client_identifier(&bare), "anonymous");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: chrono::Utc::now(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(retry_after_secs(&decision), 2);

        let immediate = RateDecision {
            retry_after: Duration::ZERO,
            ..decision
        };
        assert_eq!(retry_after_secs(&immediate), 1);
    }
}
