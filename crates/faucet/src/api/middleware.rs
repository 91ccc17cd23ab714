//! Request middleware: client source resolution, admission and API keys.

use crate::admission::RateLimitInfo;
use crate::error::{AuthFailure, FaucetError, FaucetResult};
use crate::service::FaucetService;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::SecondsFormat;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Network address the request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSource(pub String);

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_value("x-real-ip") {
        return real_ip.to_string();
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn apply_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    if let Ok(reset) = HeaderValue::from_str(&info.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true)) {
        headers.insert(X_RATELIMIT_RESET, reset);
    }
}

/// Global then source tier. Admitted requests carry their [`ClientSource`]
/// and get rate limit headers unless the handler already set them.
pub async fn admission_layer(
    State(service): State<Arc<FaucetService>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    mut request: Request,
    next: Next,
) -> Response {
    let source = client_ip(request.headers(), peer.map(|ConnectInfo(addr)| addr));

    let info = match service.admit(&source).await {
        Ok(info) => info,
        Err(e) => {
            if e.is_infrastructure() {
                error!(source = %source, error = %e, "Admission check failed");
            }
            return e.into_response();
        }
    };

    debug!(source = %source, remaining = info.remaining, "Request admitted");
    request.extensions_mut().insert(ClientSource(source));

    let mut response = next.run(request).await;
    if !response.headers().contains_key(&X_RATELIMIT_LIMIT) {
        apply_rate_limit_headers(response.headers_mut(), &info);
    }
    response
}

fn keys_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Check an `Authorization: Bearer <key>` header against `expected`.
pub fn check_bearer(headers: &HeaderMap, expected: &str) -> FaucetResult<()> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(FaucetError::Unauthorized(AuthFailure::MissingKey))?;
    let value = value
        .to_str()
        .map_err(|_| FaucetError::Unauthorized(AuthFailure::InvalidFormat))?;
    let key = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(FaucetError::Unauthorized(AuthFailure::InvalidFormat))?;

    if !keys_match(key, expected) {
        return Err(FaucetError::Unauthorized(AuthFailure::InvalidKey));
    }
    Ok(())
}

/// Enforce `api_key` when one is configured.
pub async fn require_api_key(
    State(service): State<Arc<FaucetService>>,
    request: Request,
    next: Next,
) -> Result<Response, FaucetError> {
    if let Some(expected) = &service.config().api_key {
        check_bearer(request.headers(), expected)?;
    }
    Ok(next.run(request).await)
}

/// Enforce `admin_api_key`. Without one every admin call is refused.
pub async fn require_admin_key(
    State(service): State<Arc<FaucetService>>,
    request: Request,
    next: Next,
) -> Result<Response, FaucetError> {
    match &service.config().admin_api_key {
        Some(expected) => check_bearer(request.headers(), expected)?,
        None => return Err(FaucetError::Unauthorized(AuthFailure::InvalidKey)),
    }
    Ok(next.run(request).await)
}
