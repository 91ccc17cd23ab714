//! Error types for the faucet service

use crate::admission::{RateLimitInfo, Scope};
use crate::api::middleware::apply_rate_limit_headers;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a request failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingKey,
    InvalidFormat,
    InvalidKey,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::MissingKey => "MISSING_API_KEY",
            AuthFailure::InvalidFormat => "INVALID_AUTH_FORMAT",
            AuthFailure::InvalidKey => "INVALID_API_KEY",
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AuthFailure::MissingKey => "missing Authorization header",
            AuthFailure::InvalidFormat => "Authorization header must be in format: Bearer <api-key>",
            AuthFailure::InvalidKey => "the provided API key is incorrect",
        };
        f.write_str(text)
    }
}

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Rate limit exceeded ({scope}): try again in {retry_after} seconds")]
    RateLimitExceeded {
        scope: Scope,
        retry_after: u64,
        info: Option<RateLimitInfo>,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient faucet reserve: {0}")]
    InsufficientReserve(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(AuthFailure),

    #[error("Counter store error: {0}")]
    StoreError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<redis::RedisError> for FaucetError {
    fn from(err: redis::RedisError) -> Self {
        FaucetError::StoreError(err.to_string())
    }
}

impl FaucetError {
    /// Store, database, RPC and configuration failures. Their details are
    /// logged and never returned to callers.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FaucetError::StoreError(_)
                | FaucetError::DatabaseError(_)
                | FaucetError::RpcError(_)
                | FaucetError::ConfigError(_)
                | FaucetError::InternalError(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FaucetError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            FaucetError::InvalidAddress(_)
            | FaucetError::InvalidAmount(_)
            | FaucetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FaucetError::InsufficientReserve(_) | FaucetError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FaucetError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FaucetError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            FaucetError::InvalidAddress(_) => "INVALID_ADDRESS",
            FaucetError::InvalidAmount(_) => "INVALID_AMOUNT",
            FaucetError::InvalidRequest(_) => "INVALID_REQUEST",
            FaucetError::InsufficientReserve(_) => "INSUFFICIENT_FAUCET_BALANCE",
            FaucetError::TransferFailed(_) => "FAUCET_TRANSACTION_FAILED",
            FaucetError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            FaucetError::Unauthorized(failure) => failure.code(),
            _ => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        let (message, details, retry_after) = match &self {
            FaucetError::RateLimitExceeded { scope, retry_after, .. } => (
                scope.denial_message().to_string(),
                Some(format!("Please wait {} seconds before requesting again", retry_after)),
                Some(*retry_after),
            ),
            FaucetError::InvalidAddress(msg) => (format!("Invalid address: {}", msg), None, None),
            FaucetError::InvalidAmount(msg) => (format!("Invalid amount: {}", msg), None, None),
            FaucetError::InvalidRequest(msg) => (format!("Invalid request: {}", msg), None, None),
            FaucetError::InsufficientReserve(msg) => (
                "Faucet is temporarily out of funds. Please try again later.".to_string(),
                Some(msg.clone()),
                None,
            ),
            FaucetError::TransferFailed(msg) => {
                (format!("Faucet request failed: {}", msg), Some(msg.clone()), None)
            }
            FaucetError::ServiceUnavailable(msg) => (
                "Faucet is temporarily unavailable. Please try again later.".to_string(),
                Some(msg.clone()),
                None,
            ),
            FaucetError::Unauthorized(failure) => (format!("Unauthorized: {}", failure), None, None),
            _ => (
                "Internal server error occurred while processing the request".to_string(),
                None,
                None,
            ),
        };

        let mut error = json!({ "code": code });
        if let Some(details) = details {
            error["details"] = json!(details);
        }

        let mut body = json!({
            "success": false,
            "message": message,
            "error": error,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(seconds) = retry_after {
            body["retryAfter"] = json!(seconds);
        }

        let mut response = (status, Json(body)).into_response();

        if let FaucetError::RateLimitExceeded { retry_after, info, .. } = &self {
            if let Some(info) = info {
                apply_rate_limit_headers(response.headers_mut(), info);
            }
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limit_response_carries_retry_metadata() {
        let err = FaucetError::RateLimitExceeded {
            scope: Scope::Source,
            retry_after: 42,
            info: Some(RateLimitInfo {
                scope: Scope::Source,
                limit: 3,
                remaining: 0,
                reset_at: Utc::now(),
            }),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert!(response.headers().contains_key("x-ratelimit-reset"));

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["retryAfter"], 42);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_transfer_failure_keeps_backend_detail() {
        let response = FaucetError::TransferFailed("insufficient gas".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "FAUCET_TRANSACTION_FAILED");
        assert_eq!(body["error"]["details"], "insufficient gas");
    }

    #[tokio::test]
    async fn test_infrastructure_details_are_hidden() {
        let err = FaucetError::StoreError("connection refused at 10.0.0.5:6379".to_string());
        assert!(err.is_infrastructure());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert!(body["error"].get("details").is_none());
        assert!(!body["message"].as_str().unwrap().contains("10.0.0.5"));
    }

    #[test]
    fn test_reserve_and_readiness_map_to_503() {
        assert_eq!(
            FaucetError::InsufficientReserve("low".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            FaucetError::InsufficientReserve("low".into()).code(),
            "INSUFFICIENT_FAUCET_BALANCE"
        );
        assert_eq!(
            FaucetError::ServiceUnavailable("not ready".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_auth_failure_codes() {
        assert_eq!(FaucetError::Unauthorized(AuthFailure::MissingKey).code(), "MISSING_API_KEY");
        assert_eq!(
            FaucetError::Unauthorized(AuthFailure::InvalidKey).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
