//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers::{self, HealthInfo};
use super::middleware::{admit, AdmissionState};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{RateLimitKey, RateLimiter};

/// HTTP server fronted by the admission middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state, including the rate limiter
    admission: AdmissionState,
    health: HealthInfo,
}

impl HttpServer {
    /// Create a new HTTP server with the given rate limiter.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            admission: AdmissionState::new(rate_limiter),
            health: HealthInfo::new(),
        }
    }

    /// Derive rate limit keys with `key_fn` instead of the client address.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request) -> RateLimitKey + Send + Sync + 'static,
    {
        self.admission = self.admission.with_key_fn(key_fn);
        self
    }

    /// Build the router: `/health` plus JSON 404 and 405 fallbacks, all behind
    /// admission control.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .fallback(handlers::not_found)
            .method_not_allowed_fallback(handlers::method_not_allowed)
            .with_state(self.health.clone())
            .layer(axum::middleware::from_fn_with_state(
                self.admission.clone(),
                admit,
            ))
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiterOptions;
    use axum::body::Body;
    use axum::http::{self, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    fn limiter(burst: u32) -> Arc<RateLimiter> {
        Arc::new(
            RateLimiter::new(RateLimiterOptions {
                requests_per_second: 0.001,
                burst,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn get_request(uri: &str) -> Request {
        http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let _server = HttpServer::new(addr, limiter(20));
    }

    #[tokio::test]
    async fn test_health_route() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), limiter(20));

        let response = server.router().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), limiter(20));

        let response = server.router().oneshot(get_request("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: handlers::ErrorEnvelope = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope.error.code, "NOT_FOUND");
        assert!(!envelope.success);
    }

    #[tokio::test]
    async fn test_wrong_method_is_json_405() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), limiter(20));
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = server.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: handlers::ErrorEnvelope = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope.error.code, "METHOD_NOT_ALLOWED");
        assert!(!envelope.success);
    }

    #[tokio::test]
    async fn test_routes_are_rate_limited() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), limiter(2))
            .with_key_fn(|_| RateLimitKey::new("client"));
        let router = server.router();

        for _ in 0..2 {
            let response = router.clone().oneshot(get_request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = router.oneshot(get_request("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_serve_keys_by_peer_address() {
        let limiter = limiter(20);
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&limiter));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let serve = tokio::spawn(server.serve_listener(listener, async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        stream.write_all(request).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200"), "unexpected response: {}", raw);
        assert!(limiter.registry().contains(&RateLimitKey::new("127.0.0.1")));

        stop_tx.send(()).unwrap();
        serve.await.unwrap().unwrap();
    }
}
