//! OpenAI-compatible chat relay.
//!
//! Requests are forwarded to the configured upstream. Streaming replies are
//! re-emitted as SSE; everything else comes back as one JSON object with a
//! guaranteed `choices[0].message.content` path.

pub mod client;
pub mod format;
pub mod stream;

pub use client::{upstream_headers, upstream_url, UpstreamClient};
pub use format::{format_streaming_line, normalize_completion, proxy_error_body, DONE_EVENT};
pub use stream::{reformat_stream, SseReformatter};

use std::convert::Infallible;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RelaySettings;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Failed to build upstream client: {0}")]
    Client(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>>;

pub enum RelayResponse {
    /// One JSON object with the status to reply with
    Json { status: StatusCode, body: Value },
    /// `text/event-stream` body ending in `data: [DONE]`
    Stream(EventStream),
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayResponse::Json { status, body } => f
                .debug_struct("Json")
                .field("status", status)
                .field("body", body)
                .finish(),
            RelayResponse::Stream(_) => f.write_str("Stream"),
        }
    }
}

pub fn server_error(message: &str) -> Value {
    json!({"error": {"message": message, "type": "server_error"}})
}

fn wants_stream(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Shape a fully-read upstream reply
pub fn json_reply(status: StatusCode, text: &str) -> RelayResponse {
    let parsed = serde_json::from_str::<Value>(text);

    if !status.is_success() {
        let body = parsed.unwrap_or_else(|_| {
            proxy_error_body(
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
                text,
            )
        });
        return RelayResponse::Json { status, body };
    }

    match parsed {
        Ok(data) => RelayResponse::Json {
            status: StatusCode::OK,
            body: normalize_completion(data),
        },
        Err(_) => RelayResponse::Json {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: server_error("Failed to parse proxy response as JSON"),
        },
    }
}

/// Single-entry model list used when the upstream has none to offer
pub fn fallback_models(model_name: &str) -> Value {
    json!({
        "object": "list",
        "data": [{"id": model_name, "object": "model", "owned_by": "cloudflow"}]
    })
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

#[derive(Clone)]
pub struct ChatRelay {
    client: UpstreamClient,
    model_name: String,
}

impl ChatRelay {
    pub fn new(settings: &RelaySettings) -> Result<Self, RelayError> {
        Ok(Self {
            client: UpstreamClient::new(settings)?,
            model_name: settings.model_name.clone(),
        })
    }

    pub fn upstream(&self) -> &str {
        self.client.base_url()
    }

    /// Forward a chat completion request
    pub async fn relay(&self, body: Value, headers: &HeaderMap) -> Result<RelayResponse, RelayError> {
        let stream = wants_stream(&body);
        let response = self.client.chat_completions(&body, headers).await?;
        let status = response.status();
        info!(status = status.as_u16(), stream, "Upstream responded");

        if stream && status.is_success() {
            return Ok(RelayResponse::Stream(Box::pin(reformat_stream(
                response.bytes_stream(),
            ))));
        }

        Ok(json_reply(status, &read_text(response).await?))
    }

    /// Upstream model list, or the configured model when the upstream is
    /// unreachable or answers with something that is not JSON
    pub async fn models(&self, headers: &HeaderMap) -> RelayResponse {
        let response = match self.client.models(headers).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Model list unavailable, using configured model");
                return self.fallback();
            }
        };

        let status = response.status();
        let text = match read_text(response).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Model list unreadable, using configured model");
                return self.fallback();
            }
        };

        if !status.is_success() {
            return json_reply(status, &text);
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(body) => RelayResponse::Json {
                status: StatusCode::OK,
                body,
            },
            Err(_) => self.fallback(),
        }
    }

    fn fallback(&self) -> RelayResponse {
        RelayResponse::Json {
            status: StatusCode::OK,
            body: fallback_models(&self.model_name),
        }
    }
}

async fn read_text(response: Response) -> Result<String, RelayError> {
    response
        .text()
        .await
        .map_err(|e| RelayError::Upstream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use reqwest::header::{HeaderValue, AUTHORIZATION};
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay_for(server: &MockServer, token: Option<&str>) -> ChatRelay {
        let settings = RelaySettings {
            upstream_url: server.uri(),
            upstream_token: token.map(String::from),
            request_timeout: Duration::from_secs(5),
            ..RelaySettings::default()
        };
        ChatRelay::new(&settings).unwrap()
    }

    fn expect_json(response: RelayResponse) -> (StatusCode, Value) {
        match response {
            RelayResponse::Json { status, body } => (status, body),
            RelayResponse::Stream(_) => panic!("expected JSON reply"),
        }
    }

    #[test]
    fn test_json_reply_error_passthrough() {
        let (status, body) = expect_json(json_reply(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"bad model"}}"#,
        ));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "bad model");
    }

    #[test]
    fn test_json_reply_non_json_error() {
        let (status, body) = expect_json(json_reply(StatusCode::BAD_GATEWAY, "<html>oops</html>"));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "proxy_error");
        assert_eq!(body["error"]["message"], "Proxy error: 502 Bad Gateway");
        assert_eq!(body["error"]["proxy_text"], "<html>oops</html>");
    }

    #[test]
    fn test_json_reply_unparseable_success() {
        let (status, body) = expect_json(json_reply(StatusCode::OK, "not json"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Failed to parse proxy response as JSON");
    }

    #[tokio::test]
    async fn test_non_streaming_relay_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("x-api-key", "upstream-secret"))
            .and(header("x-openai-auth", "Bearer sk-client"))
            .and(body_json(json!({"model": "m", "messages": []})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "hi there"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-client"));

        let relay = relay_for(&server, Some("upstream-secret"));
        let (status, body) = expect_json(
            relay
                .relay(json!({"model": "m", "messages": []}), &headers)
                .await
                .unwrap(),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "hi there");
    }

    #[tokio::test]
    async fn test_streaming_relay_reformats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("Hello\nworld\n"),
            )
            .mount(&server)
            .await;

        let relay = relay_for(&server, None);
        let response = relay
            .relay(json!({"model": "m", "messages": [], "stream": true}), &HeaderMap::new())
            .await
            .unwrap();

        let RelayResponse::Stream(events) = response else {
            panic!("expected stream");
        };
        let out: String = events
            .map(|e| String::from_utf8(e.unwrap().to_vec()).unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();

        assert_eq!(
            out,
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n\
             data: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn test_streaming_request_with_error_status_is_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let relay = relay_for(&server, None);
        let (status, body) = expect_json(
            relay
                .relay(json!({"stream": true}), &HeaderMap::new())
                .await
                .unwrap(),
        );
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["proxy_status"], 503);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_an_error() {
        let settings = RelaySettings {
            upstream_url: "http://127.0.0.1:1".to_string(),
            request_timeout: Duration::from_secs(2),
            ..RelaySettings::default()
        };
        let relay = ChatRelay::new(&settings).unwrap();
        assert!(matches!(
            relay.relay(json!({}), &HeaderMap::new()).await,
            Err(RelayError::Upstream(_))
        ));

        let (status, body) = expect_json(relay.models(&HeaderMap::new()).await);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], settings.model_name);
    }

    #[tokio::test]
    async fn test_models_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"object": "list", "data": [{"id": "upstream-model"}]})),
            )
            .mount(&server)
            .await;

        let (_, body) = expect_json(relay_for(&server, None).models(&HeaderMap::new()).await);
        assert_eq!(body["data"][0]["id"], "upstream-model");
    }
}
