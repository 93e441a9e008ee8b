use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tower::ServiceExt;

fn temp_database_url(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();

    let mut temp_path = std::env::temp_dir();
    temp_path.push(format!("sirius-{tag}-{}-{}.sqlite", std::process::id(), nanos));
    format!("sqlite:{}", temp_path.display())
}

async fn test_state(tag: &str) -> (sirius::server::router::GatewayState, Arc<str>) {
    let db = sirius::db::spawn(&temp_database_url(tag)).await;
    let store = sirius::accounts::store::spawn(db).await;

    let mut cfg = sirius::config::Config::default();
    cfg.basic.gateway_key = "pwd".to_string();

    let state = sirius::server::router::GatewayState::new(cfg, store);
    let key = state.gateway_key.clone();
    (state, key)
}

#[tokio::test]
async fn messages_route_requires_key_rejects_bad_json_and_maps_empty_pool_to_503() {
    let (state, key) = test_state("router-basic").await;
    let app = sirius::server::router::gateway_router(state);

    let valid_body =
        r#"{"model":"claude-3-5-sonnet-20241022","messages":[{"role":"user","content":"hi"}]}"#;

    // 1) no key -> 401
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .body(Body::from(valid_body))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // 2) correct key + invalid JSON -> 400
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .header("x-api-key", key.as_ref())
                .body(Body::from("not-json"))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // 3) correct key + valid body, but no accounts configured -> 503
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .header("x-api-key", key.as_ref())
                .body(Body::from(valid_body))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["type"], "no_available_accounts");
}

#[tokio::test]
async fn streaming_capacity_error_uses_sse_framing() {
    let (state, key) = test_state("router-sse").await;
    let app = sirius::server::router::gateway_router(state);

    let body = r#"{"model":"claude-3-5-sonnet-20241022","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .header("x-api-key", key.as_ref())
                .body(Body::from(body))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");

    // Streaming errors are delivered as an SSE error event over HTTP 200.
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("event: error\ndata: {\"error\":{\"type\":\"no_available_accounts\""));
    assert!(text.ends_with("\n\ndata: [DONE]\n\n"));
}

#[tokio::test]
async fn healthz_is_open_and_unknown_routes_404() {
    let (state, _key) = test_state("router-health").await;
    let app = sirius::server::router::gateway_router(state);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn account_test_route_enforces_cooldown() {
    let (state, key) = test_state("router-cooldown").await;
    let app = sirius::server::router::gateway_router(state);

    // Unknown account: the cooldown is recorded before the lookup fails, so
    // no upstream traffic happens in this test.
    let request = |app: axum::Router| async move {
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri("/accounts/424242/test")
                .header("x-api-key", "pwd")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    };
    let _ = key;

    let first = request(app.clone()).await;
    assert_eq!(first.status(), StatusCode::BAD_REQUEST);

    let second = request(app).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let bytes = to_bytes(second.into_body(), 64 * 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");
}
