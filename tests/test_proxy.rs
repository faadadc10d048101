//! End-to-end forwarding tests against mock upstreams.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use cil_router::{
    core::config::{AppConfig, ProviderConfig},
    create_router, AppState,
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(endpoints: Vec<(String, String)>) -> AppConfig {
    let mut config = AppConfig::default();
    if !endpoints.is_empty() {
        config.providers = vec![ProviderConfig::new(endpoints)];
    }
    config.request.backoff_base = Duration::from_millis(1);
    config.request.backoff_max = Duration::from_millis(5);
    config.request.heartbeat_interval = Duration::from_secs(2);
    config
}

fn build_app(config: &AppConfig) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState::from_config(config).unwrap());
    (create_router(state.clone()), state)
}

fn endpoint(base: String, key: &str) -> (String, String) {
    (base, key.to_string())
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn post(uri: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

// ============================================================================
// Retry behaviour
// ============================================================================

#[tokio::test]
async fn test_retries_on_next_endpoint_before_commit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/a/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/b/v1/messages"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/c/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"id\":\"msg_1\"}"))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(vec![
        endpoint(format!("{}/a", server.uri()), "ka"),
        endpoint(format!("{}/b", server.uri()), "kb"),
        endpoint(format!("{}/c", server.uri()), "kc"),
    ]);
    let (app, _) = build_app(&config);

    let response = app.oneshot(post("/v1/messages", "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"{\"id\":\"msg_1\"}");
}

#[tokio::test]
async fn test_sse_after_two_retryable_failures_is_byte_identical() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/a/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/b/v1/messages"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/c/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: 1\n\ndata: 2\n\n", "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let first = format!("{}/a", server.uri());
    let config = test_config(vec![
        endpoint(first.clone(), "ka"),
        endpoint(format!("{}/b", server.uri()), "kb"),
        endpoint(format!("{}/c", server.uri()), "kc"),
    ]);
    let (app, state) = build_app(&config);

    let response = app
        .oneshot(post("/v1/messages", "{\"stream\":true}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"data: 1\n\ndata: 2\n\n");

    // Three attempts advanced the rotation exactly three times
    assert_eq!(state.selector.get_current_endpoint().unwrap().base_url, first);
}

#[tokio::test]
async fn test_non_retryable_status_passes_through_after_one_call() {
    let server = MockServer::start().await;
    Mock::given(path("/a/v1/messages"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("x-upstream-trace", "t-1")
                .set_body_string("{\"error\":\"not found\"}"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/b/v1/messages"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(vec![
        endpoint(format!("{}/a", server.uri()), "ka"),
        endpoint(format!("{}/b", server.uri()), "kb"),
    ]);
    let (app, _) = build_app(&config);

    let response = app.oneshot(post("/v1/messages", "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers().get("x-upstream-trace").unwrap(), "t-1");
    assert_eq!(body_bytes(response).await, b"{\"error\":\"not found\"}");
}

#[tokio::test]
async fn test_retryable_status_on_last_attempt_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = test_config(vec![
        endpoint(format!("{}/a", server.uri()), "ka"),
        endpoint(format!("{}/b", server.uri()), "kb"),
    ]);
    config.request.max_attempts = 2;
    let (app, _) = build_app(&config);

    let response = app.oneshot(post("/v1/messages", "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_bytes(response).await, b"busy");
}

#[tokio::test]
async fn test_exhausted_attempts_return_502() {
    let config = test_config(vec![endpoint("http://127.0.0.1:1".to_string(), "k")]);
    let (app, _) = build_app(&config);

    let response = app.oneshot(post("/v1/messages", "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let detail = body_json(response).await["detail"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(
        detail.starts_with("upstream request failed after 3 attempts"),
        "unexpected detail: {}",
        detail
    );
}

#[tokio::test]
async fn test_no_providers_returns_503() {
    let (app, _) = build_app(&test_config(vec![]));

    let response = app.oneshot(post("/v1/messages", "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_json(response).await["detail"].is_string());
}

#[tokio::test]
async fn test_round_robin_across_requests() {
    let server = MockServer::start().await;
    for name in ["a", "b"] {
        Mock::given(path(format!("/{}/v1/models", name)))
            .respond_with(ResponseTemplate::new(200).set_body_string(name))
            .expect(2)
            .mount(&server)
            .await;
    }

    let config = test_config(vec![
        endpoint(format!("{}/a", server.uri()), "ka"),
        endpoint(format!("{}/b", server.uri()), "kb"),
    ]);
    let (app, _) = build_app(&config);

    let mut seen = Vec::new();
    for _ in 0..4 {
        let response = app
            .clone()
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        seen.push(String::from_utf8(body_bytes(response).await).unwrap());
    }
    assert_eq!(seen, vec!["a", "b", "a", "b"]);
}

// ============================================================================
// Authentication and header handling
// ============================================================================

#[tokio::test]
async fn test_auth_failures_never_reach_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = test_config(vec![endpoint(server.uri(), "upstream-key")]);
    config.request.auth_key = "router-key".to_string();
    let (app, _) = build_app(&config);

    let response = app
        .clone()
        .oneshot(post("/v1/messages", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["detail"], "missing bearer token");

    let mut request = post("/v1/messages", "{}");
    request
        .headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["detail"], "invalid bearer token");
}

#[tokio::test]
async fn test_credentials_swapped_and_headers_sanitized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("authorization", "Bearer upstream-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cf-cache-status", "HIT")
                .insert_header("x-request-cost", "3")
                .set_body_string("{}"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(vec![endpoint(server.uri(), "upstream-key")]);
    config.request.auth_key = "router-key".to_string();
    let (app, _) = build_app(&config);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("authorization", "bearer router-key")
        .header("x-api-key", "client-key")
        .header("x-forwarded-for", "10.0.0.1")
        .header("cf-ray", "abc")
        .header("via", "1.1 edge")
        .header("anthropic-version", "2023-06-01")
        .body(Body::from("{\"model\":\"m\"}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("cf-cache-status").is_none());
    assert_eq!(response.headers().get("x-request-cost").unwrap(), "3");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let upstream = &received[0];
    assert_eq!(upstream.body, b"{\"model\":\"m\"}");
    assert_eq!(
        upstream.headers.get("anthropic-version").unwrap(),
        "2023-06-01"
    );
    for name in ["x-api-key", "x-forwarded-for", "cf-ray", "via"] {
        assert!(
            upstream.headers.get(name).is_none(),
            "{} leaked upstream",
            name
        );
    }
}

#[tokio::test]
async fn test_query_string_and_method_preserved() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .and(query_param("limit", "5"))
        .and(query_param("after", "m-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/files/f-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (app, _) = build_app(&test_config(vec![endpoint(server.uri(), "k")]));

    let response = app
        .clone()
        .oneshot(
            Request::get("/v1/models?limit=5&after=m-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::delete("/v1/files/f-1")
                .body(Body::from("ignored"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let received = server.received_requests().await.unwrap();
    assert!(received.iter().all(|r| r.body.is_empty()));
}

#[tokio::test]
async fn test_other_methods_on_router_paths_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/select"))
        .respond_with(ResponseTemplate::new(200).set_body_string("upstream select"))
        .expect(1)
        .mount(&server)
        .await;

    let (app, _) = build_app(&test_config(vec![endpoint(server.uri(), "k")]));

    let response = app.clone().oneshot(post("/", "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .oneshot(Request::get("/select").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await, b"upstream select");
}

#[tokio::test]
async fn test_head_keeps_upstream_content_length() {
    let addr = raw_upstream(|mut socket| async move {
        read_request_head(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 1234\r\n\r\n",
            )
            .await
            .unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    })
    .await;

    let (app, _) = build_app(&test_config(vec![endpoint(format!("http://{}", addr), "k")]));

    let response = app
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-length").unwrap(), "1234");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_get_drops_upstream_content_length_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("four"))
        .mount(&server)
        .await;

    let (app, _) = build_app(&test_config(vec![endpoint(server.uri(), "k")]));

    let response = app
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().get("content-length").is_none());
    assert_eq!(body_bytes(response).await, b"four");
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = test_config(vec![endpoint(server.uri(), "k")]);
    config.request.max_body_bytes = 8;
    let (app, _) = build_app(&config);

    let response = app
        .oneshot(post("/v1/messages", "{\"too\":\"large\"}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_sse_passthrough() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: {\"n\":1}\n\ndata: [DONE]\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let (app, _) = build_app(&test_config(vec![endpoint(server.uri(), "k")]));

    let response = app
        .oneshot(post("/v1/chat/completions", "{\"stream\":true}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(
        body_bytes(response).await,
        b"data: {\"n\":1}\n\ndata: [DONE]\n\n"
    );
}

const SSE_HEAD: &[u8] =
    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";

async fn read_request_head(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Upstream that serves one connection with `serve`.
async fn raw_upstream<F, Fut>(serve: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            serve(socket).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_no_retry_after_first_byte() {
    let addr = raw_upstream(|mut socket| async move {
        read_request_head(&mut socket).await;
        socket.write_all(SSE_HEAD).await.unwrap();
        socket.write_all(b"9\r\ndata: a\n\n\r\n").await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Abrupt close without the terminating chunk
        drop(socket);
    })
    .await;

    let fallback = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&fallback)
        .await;

    let config = test_config(vec![
        endpoint(format!("http://{}", addr), "k1"),
        endpoint(fallback.uri(), "k2"),
    ]);
    let (app, _) = build_app(&config);

    let response = app
        .oneshot(Request::get("/v1/stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"data: a\n\n");
}

#[tokio::test]
async fn test_stream_failure_before_first_byte_is_retried() {
    let addr = raw_upstream(|mut socket| async move {
        read_request_head(&mut socket).await;
        socket.write_all(SSE_HEAD).await.unwrap();
        socket.flush().await.unwrap();
        drop(socket);
    })
    .await;

    let fallback = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: b\n\n", "text/event-stream"))
        .expect(1)
        .mount(&fallback)
        .await;

    let config = test_config(vec![
        endpoint(format!("http://{}", addr), "k1"),
        endpoint(fallback.uri(), "k2"),
    ]);
    let (app, _) = build_app(&config);

    let response = app
        .oneshot(Request::get("/v1/stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"data: b\n\n");
}

#[tokio::test]
async fn test_heartbeat_during_upstream_silence() {
    let addr = raw_upstream(|mut socket| async move {
        read_request_head(&mut socket).await;
        socket.write_all(SSE_HEAD).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        socket.write_all(b"9\r\ndata: z\n\n\r\n0\r\n\r\n").await.unwrap();
        socket.flush().await.unwrap();
    })
    .await;

    let mut config = test_config(vec![endpoint(format!("http://{}", addr), "k")]);
    config.request.heartbeat_interval = Duration::from_millis(40);
    let (app, _) = build_app(&config);

    let response = app
        .oneshot(Request::get("/v1/stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text = String::from_utf8(body_bytes(response).await).unwrap();

    assert!(text.starts_with(": ping\n\n"), "got {:?}", text);
    assert!(text.ends_with("data: z\n\n"), "got {:?}", text);
    assert!(text.matches(": ping\n\n").count() >= 2);
}

// ============================================================================
// Request log
// ============================================================================

#[tokio::test]
async fn test_attempts_recorded_in_request_log() {
    let server = MockServer::start().await;
    Mock::given(path("/a/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/b/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"id\":\"msg_2\"}"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("requests.jsonl");
    let mut config = test_config(vec![
        endpoint(format!("{}/a", server.uri()), "ka"),
        endpoint(format!("{}/b", server.uri()), "kb"),
    ]);
    config.request_log.enabled = true;
    config.request_log.path = log_path.clone();
    let (app, state) = build_app(&config);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages?beta=true")
        .header("authorization", "Bearer client-token")
        .header("content-type", "application/json")
        .body(Body::from("{\"model\":\"m\"}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    state.shutdown().await;

    let raw = tokio::fs::read_to_string(&log_path).await.unwrap();
    assert!(!raw.contains("client-token"));
    let records: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .filter(|record: &Value| record["type"] != "rate_limit")
        .collect();
    let kinds: Vec<&str> = records.iter().map(|r| r["type"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        vec![
            "request_start",
            "forward_request",
            "forward_response",
            "forward_request",
            "forward_response",
        ]
    );

    assert_eq!(records[0]["path"], "/v1/messages");
    assert_eq!(records[0]["query"], "beta=true");
    assert_eq!(records[0]["body"]["model"], "m");
    assert_eq!(records[1]["attempt"], 1);
    assert!(records[1]["url"].as_str().unwrap().ends_with("/a/v1/messages?beta=true"));
    assert_eq!(records[2]["status_code"], 503);
    assert_eq!(records[2]["streaming"], false);
    assert_eq!(records[3]["attempt"], 2);
    assert_eq!(records[4]["status_code"], 200);
    assert_eq!(records[4]["body"]["id"], "msg_2");
}
