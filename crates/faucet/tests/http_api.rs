mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use common::{harness, test_config};
use drip_faucet::api::router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn faucet_request(source: &str, wallet: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/faucet/request")
        .header("content-type", "application/json")
        .header("x-forwarded-for", source)
        .body(Body::from(json!({ "walletAddress": wallet }).to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_fourth_request_from_source_is_limited() {
    let mut config = test_config();
    config.source_limit = 3;
    config.rate_limit_window_secs = 60;
    let h = harness(config);
    let app = router(h.service.clone());

    for (i, wallet) in ["0x01", "0x02", "0x03"].iter().enumerate() {
        let response = send(&app, faucet_request("203.0.113.5", wallet)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(
            response.headers()["x-ratelimit-remaining"],
            (2 - i).to_string().as_str()
        );
    }

    let response = send(&app, faucet_request("203.0.113.5", "0x04")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body = body_json(response).await;
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!((1..=60).contains(&retry_after), "retryAfter {}", retry_after);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");

    // Other sources are unaffected.
    let response = send(&app, faucet_request("198.51.100.7", "0x04")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.relay.sends(), 4);
}

#[tokio::test]
async fn test_success_body_shape() {
    let h = harness(test_config());
    let app = router(h.service.clone());

    let response = send(&app, faucet_request("203.0.113.5", "0xbeef")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["transactionHash"], "0xfeed");
    assert_eq!(body["amount"], "100");
    assert_eq!(
        body["walletAddress"],
        "0x000000000000000000000000000000000000000000000000000000000000beef"
    );
    assert!(body["requestId"].as_str().is_some());
}

#[tokio::test]
async fn test_wallet_cooldown_overrides_source_headers() {
    let h = harness(test_config());
    let app = router(h.service.clone());

    assert_eq!(send(&app, faucet_request("10.0.0.1", "0xbeef")).await.status(), StatusCode::OK);
    let response = send(&app, faucet_request("10.0.0.2", "0xbeef")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-limit"], "1");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(response.headers()["retry-after"], "3600");
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let h = harness(test_config());
    let app = router(h.service.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/faucet/request")
        .header("content-type", "application/json")
        .body(Body::from("{\"wallet\":"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "INVALID_REQUEST");
    assert_eq!(h.relay.sends(), 0);
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let mut config = test_config();
    config.api_key = Some("s3cret".to_string());
    let h = harness(config);
    let app = router(h.service.clone());

    let response = send(&app, faucet_request("10.0.0.1", "0xbeef")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["code"], "MISSING_API_KEY");

    let mut request = faucet_request("10.0.0.1", "0xbeef");
    request
        .headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(body_json(response).await["error"]["code"], "INVALID_API_KEY");

    let mut request = faucet_request("10.0.0.1", "0xbeef");
    request
        .headers_mut()
        .insert("authorization", "Bearer s3cret".parse().unwrap());
    assert_eq!(send(&app, request).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_follows_relay_readiness() {
    let h = harness(test_config());
    let app = router(h.service.clone());

    assert_eq!(send(&app, get("/health")).await.status(), StatusCode::OK);
    h.relay.set_ready(false);
    let response = send(&app, get("/health")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["ready"], false);
}

#[tokio::test]
async fn test_health_and_metrics_skip_admission() {
    let mut config = test_config();
    config.global_limit = 1;
    let h = harness(config);
    let app = router(h.service.clone());

    assert_eq!(send(&app, get("/faucet/info")).await.status(), StatusCode::OK);
    assert_eq!(send(&app, get("/faucet/info")).await.status(), StatusCode::TOO_MANY_REQUESTS);

    assert_eq!(send(&app, get("/health")).await.status(), StatusCode::OK);
    let response = send(&app, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("faucet_rate_limited_total"));
}

#[tokio::test]
async fn test_status_and_info_payloads() {
    let h = harness(test_config());
    let app = router(h.service.clone());

    let body = body_json(send(&app, get("/faucet/status")).await).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["ready"], true);
    assert_eq!(body["data"]["minReserveBalance"], "1000");

    let body = body_json(send(&app, get("/faucet/info")).await).await;
    assert_eq!(body["data"]["maxAmount"], "500");
    assert_eq!(body["data"]["authRequired"], false);
    assert_eq!(body["data"]["limits"]["cooldownMode"], "record_on_success");
}

#[tokio::test]
async fn test_admin_routes() {
    let mut config = test_config();
    config.source_limit = 1;
    config.admin_api_key = Some("admin".to_string());
    let h = harness(config);
    let app = router(h.service.clone());

    assert_eq!(send(&app, faucet_request("10.9.9.9", "0x01")).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, faucet_request("10.9.9.9", "0x02")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let status = Request::builder()
        .uri("/admin/rate-limits/ip/10.9.9.9")
        .header("authorization", "Bearer admin")
        .body(Body::empty())
        .unwrap();
    let body = body_json(send(&app, status).await).await;
    assert_eq!(body["data"]["limit"], 1);
    assert_eq!(body["data"]["remaining"], 0);

    let unauthorized = Request::builder()
        .method("POST")
        .uri("/admin/rate-limits/reset")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "scope": "source", "identifier": "10.9.9.9" }).to_string()))
        .unwrap();
    assert_eq!(send(&app, unauthorized).await.status(), StatusCode::UNAUTHORIZED);

    let reset = Request::builder()
        .method("POST")
        .uri("/admin/rate-limits/reset")
        .header("content-type", "application/json")
        .header("authorization", "Bearer admin")
        .body(Body::from(json!({ "scope": "source", "identifier": "10.9.9.9" }).to_string()))
        .unwrap();
    let response = send(&app, reset).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["existed"], true);

    assert_eq!(send(&app, faucet_request("10.9.9.9", "0x02")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_absent_without_key() {
    let h = harness(test_config());
    let app = router(h.service.clone());

    let response = send(&app, get("/admin/rate-limits/ip/10.0.0.1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
