//! Admission middleware that rate limits requests per client.

use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, error};

use super::handlers::error_response;
use crate::ratelimit::{derive_key, Decision, RateLimitKey, RateLimiter, UNKNOWN_KEY};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Error code sent with rejected requests.
pub const RATE_LIMITED_CODE: &str = "RATE_LIMITED";
const RATE_LIMITED_MESSAGE: &str = "Too many requests, please try again later";

/// Canonical client address placed in request extensions by an upstream stage.
///
/// When present it is used as the key instead of the proxy headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Derives the rate limit key for a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> RateLimitKey + Send + Sync>;

/// Shared state for the [`admit`] middleware.
#[derive(Clone)]
pub struct AdmissionState {
    limiter: Arc<RateLimiter>,
    key_fn: KeyFn,
}

impl AdmissionState {
    /// Create admission state keyed by [`client_key`].
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            key_fn: Arc::new(client_key),
        }
    }

    /// Replace the key derivation function.
    ///
    /// If `key_fn` panics the request is keyed as [`UNKNOWN_KEY`].
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request) -> RateLimitKey + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// Get the rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn key_for(&self, request: &Request) -> RateLimitKey {
        catch_unwind(AssertUnwindSafe(|| (self.key_fn)(request))).unwrap_or_else(|_| {
            error!(
                method = %request.method(),
                path = %request.uri().path(),
                "Key derivation panicked; using the shared unknown key"
            );
            RateLimitKey::new(UNKNOWN_KEY)
        })
    }
}

/// Default key derivation: upstream [`ClientIp`], then proxy headers, then the
/// connection's peer address.
pub fn client_key(request: &Request) -> RateLimitKey {
    if let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>() {
        return RateLimitKey::from_ip(*ip);
    }

    let headers = request.headers();
    let forwarded = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok());
    let real_ip = headers.get(X_REAL_IP).and_then(|value| value.to_str().ok());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());

    derive_key(forwarded, real_ip, peer.as_deref())
}

/// Reject the request with 429 when its key is out of tokens, otherwise pass it on.
///
/// Install with `axum::middleware::from_fn_with_state(state, admit)`.
pub async fn admit(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let key = state.key_for(&request);

    match state.limiter.check(&key) {
        Decision::Allowed => next.run(request).await,
        Decision::Rejected => {
            debug!(
                key = %key,
                method = %request.method(),
                path = %request.uri().path(),
                "Rejecting rate limited request"
            );
            rejection_response()
        }
    }
}

/// The response sent for a rate limited request.
pub fn rejection_response() -> Response {
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        RATE_LIMITED_CODE,
        RATE_LIMITED_MESSAGE,
    );
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    response
}
