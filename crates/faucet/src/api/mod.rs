//! HTTP API for faucet service

pub mod middleware;

use crate::admission::{RateLimitInfo, Scope};
use crate::error::{FaucetError, FaucetResult};
use crate::service::{FaucetInfo, FaucetRequest, FaucetResponse, FaucetService, FaucetStatus};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use middleware::{admission_layer, require_admin_key, require_api_key, ClientSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
    pub timestamp: String,
}

impl<T> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Admin reset request
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub scope: Scope,
    pub identifier: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResult {
    pub scope: Scope,
    pub identifier: String,
    pub existed: bool,
}

/// Build the full router. Health, metrics and admin routes bypass admission.
pub fn router(service: Arc<FaucetService>) -> Router {
    let config = service.config().clone();

    let faucet = Router::new()
        .route(
            "/faucet/request",
            post(request_handler).route_layer(from_fn_with_state(service.clone(), require_api_key)),
        )
        .route("/faucet/status", get(status_handler))
        .route("/faucet/info", get(info_handler))
        .route_layer(from_fn_with_state(service.clone(), admission_layer));

    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(faucet);

    if config.admin_api_key.is_some() {
        let admin = Router::new()
            .route("/admin/rate-limits/reset", post(reset_handler))
            .route("/admin/rate-limits/:scope/:identifier", get(rate_limit_status_handler))
            .route_layer(from_fn_with_state(service.clone(), require_admin_key));
        app = app.merge(admin);
        info!("Admin endpoints enabled");
    }

    let mut app = app.with_state(service).layer(TraceLayer::new_for_http());

    if config.cors_enabled {
        app = app.layer(cors_layer(&config.allowed_origins));
        info!("CORS enabled");
    }
    app
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}

/// Token request handler
pub async fn request_handler(
    State(service): State<Arc<FaucetService>>,
    Extension(ClientSource(source)): Extension<ClientSource>,
    payload: Result<Json<FaucetRequest>, JsonRejection>,
) -> FaucetResult<Json<FaucetResponse>> {
    let Json(request) = payload.map_err(|rejection| FaucetError::InvalidRequest(rejection.body_text()))?;

    match service.request_tokens(request, &source).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            if e.is_infrastructure() {
                error!(source = %source, error = %e, "Faucet request failed");
            }
            Err(e)
        }
    }
}

/// Status handler
pub async fn status_handler(State(service): State<Arc<FaucetService>>) -> Json<SuccessResponse<FaucetStatus>> {
    Json(SuccessResponse::new(service.status().await))
}

pub async fn info_handler(State(service): State<Arc<FaucetService>>) -> Json<SuccessResponse<FaucetInfo>> {
    Json(SuccessResponse::new(service.info()))
}

/// Health check handler
pub async fn health_handler(State(service): State<Arc<FaucetService>>) -> impl IntoResponse {
    let ready = service.is_ready();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ok" } else { "unavailable" },
            "ready": ready,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

pub async fn metrics_handler(State(service): State<Arc<FaucetService>>) -> impl IntoResponse {
    match service.metrics().gather() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Root handler with info
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Drip Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Rate-limited token faucet",
        "endpoints": {
            "POST /faucet/request": "Request tokens",
            "GET /faucet/status": "Get faucet status",
            "GET /faucet/info": "Get faucet limits and amounts",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}

pub async fn reset_handler(
    State(service): State<Arc<FaucetService>>,
    payload: Result<Json<ResetRequest>, JsonRejection>,
) -> FaucetResult<Json<SuccessResponse<ResetResult>>> {
    let Json(request) = payload.map_err(|rejection| FaucetError::InvalidRequest(rejection.body_text()))?;
    let existed = service.reset_rate_limit(request.scope, &request.identifier).await?;

    Ok(Json(SuccessResponse::new(ResetResult {
        scope: request.scope,
        identifier: request.identifier,
        existed,
    })))
}

pub async fn rate_limit_status_handler(
    State(service): State<Arc<FaucetService>>,
    Path((scope, identifier)): Path<(String, String)>,
) -> FaucetResult<Json<SuccessResponse<RateLimitInfo>>> {
    let scope: Scope = scope.parse()?;
    let info = service.rate_limit_status(scope, &identifier).await?;
    Ok(Json(SuccessResponse::new(info)))
}
