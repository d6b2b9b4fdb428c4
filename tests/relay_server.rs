//! Integration tests for the relay server
//!
//! A thin axum app stands in for the upstream model endpoint; the relay
//! server runs on its own port and is driven over HTTP with reqwest.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream;
use serde_json::{json, Value};
use tokio::time::sleep;

use cloudflow::config::RelaySettings;
use cloudflow::server::{create_router, AppState};
use cloudflow::store::MemoryStore;

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

async fn upstream_chat(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    if body["model"] == json!("slow-model") {
        // five lines, 100ms apart: longer in total than the relay's idle limit
        let ticks = stream::unfold(0u8, |n| async move {
            if n == 5 {
                return None;
            }
            sleep(Duration::from_millis(100)).await;
            Some((Ok::<_, std::io::Error>(format!("tick{}\n", n)), n + 1))
        });
        return Body::from_stream(ticks).into_response();
    }

    let forwarded = headers
        .get("x-openai-auth")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer sk-"));

    if body["stream"] == json!(true) {
        // plain-text lines, one split across chunks, then a proper SSE event
        let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
            Ok("Hello\nwor"),
            Ok("ld\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n"),
        ];
        return Body::from_stream(stream::iter(chunks)).into_response();
    }

    Json(json!({"response": format!("forwarded={}", forwarded)})).into_response()
}

async fn upstream_models() -> impl IntoResponse {
    (StatusCode::BAD_GATEWAY, "<html>bad gateway</html>")
}

async fn spawn(app: Router) -> String {
    let port = find_available_port();
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // Give server time to start
    sleep(Duration::from_millis(100)).await;
    format!("http://127.0.0.1:{}", port)
}

async fn start_relay() -> String {
    start_relay_with_timeout(RelaySettings::default().request_timeout).await
}

async fn start_relay_with_timeout(request_timeout: Duration) -> String {
    let upstream = spawn(
        Router::new()
            .route("/v1/chat/completions", post(upstream_chat))
            .route("/v1/models", get(upstream_models)),
    )
    .await;

    let settings = RelaySettings {
        upstream_url: upstream,
        upstream_token: Some("upstream-secret".to_string()),
        request_timeout,
        ..RelaySettings::default()
    };
    let state = AppState::new(Arc::new(MemoryStore::new()), settings).unwrap();
    spawn(create_router(state)).await
}

async fn issue_key(client: &reqwest::Client, relay: &str) -> String {
    let created: Value = client
        .put(format!("{}/api/keys", relay))
        .json(&json!({"userId": "integration"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    created["key"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_streaming_chat_completion() {
    let relay = start_relay().await;
    let client = reqwest::Client::new();
    let key = issue_key(&client, &relay).await;

    let response = client
        .post(format!("{}/v1/chat/completions", relay))
        .bearer_auth(&key)
        .json(&json!({
            "model": "test-model",
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(response.headers()["x-ratelimit-remaining"], "499");

    let body = response.text().await.unwrap();
    assert_eq!(
        body,
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n\
         data: [DONE]\n\n"
    );
}

#[tokio::test]
async fn test_long_stream_outlives_idle_timeout() {
    let relay = start_relay_with_timeout(Duration::from_millis(300)).await;
    let client = reqwest::Client::new();
    let key = issue_key(&client, &relay).await;

    let body = client
        .post(format!("{}/v1/chat/completions", relay))
        .bearer_auth(&key)
        .json(&json!({"model": "slow-model", "messages": [], "stream": true}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(!body.contains("Streaming error"), "body: {}", body);
    assert!(body.contains("tick0"));
    assert!(body.contains("tick4"));
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_non_streaming_chat_completion() {
    let relay = start_relay().await;
    let client = reqwest::Client::new();
    let key = issue_key(&client, &relay).await;

    let body: Value = client
        .post(format!("{}/v1/chat/completions", relay))
        .header("api-key", &key)
        .header("authorization", format!("Bearer {}", key))
        .json(&json!({"model": "test-model", "messages": []}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["choices"][0]["message"]["content"], "forwarded=true");
}

#[tokio::test]
async fn test_models_error_is_shaped() {
    let relay = start_relay().await;
    let client = reqwest::Client::new();
    let key = issue_key(&client, &relay).await;

    let response = client
        .get(format!("{}/v1/models", relay))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "proxy_error");
    assert_eq!(body["error"]["proxy_text"], "<html>bad gateway</html>");
}

#[tokio::test]
async fn test_revoked_key_is_rejected() {
    let relay = start_relay().await;
    let client = reqwest::Client::new();
    let key = issue_key(&client, &relay).await;

    let response = client
        .delete(format!("{}/api/keys?key={}&userId=integration", relay, key))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .post(format!("{}/v1/chat/completions", relay))
        .bearer_auth(&key)
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Invalid API key");
}

#[tokio::test]
async fn test_ping() {
    let relay = start_relay().await;
    let body: Value = reqwest::get(format!("{}/api/ping", relay))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"pong": true, "backend": "memory"}));
}
