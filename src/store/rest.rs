//! Upstash-style REST backend: one POST per command, JSON array body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use super::{KeyValueStore, StoreError};

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct RestStore {
    client: Client,
    endpoint: String,
    token: String,
}

impl RestStore {
    /// `domain` may be a bare host (HTTPS is assumed) or a full URL
    pub fn new(domain: &str, token: &str) -> Self {
        let endpoint = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", domain.trim_end_matches('/'))
        };
        Self {
            client: Client::new(),
            endpoint,
            token: token.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn command(&self, args: &[&str]) -> Result<Value, StoreError> {
        trace!(command = args.first().copied().unwrap_or_default(), "REST store command");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let reply: RestReply = serde_json::from_str(&text).map_err(|_| {
            StoreError::Protocol(format!("HTTP {}: {}", status.as_u16(), text))
        })?;

        if let Some(error) = reply.error {
            return Err(StoreError::Command(error));
        }
        if !status.is_success() {
            return Err(StoreError::Command(format!("HTTP {}", status.as_u16())));
        }

        Ok(reply.result.unwrap_or(Value::Null))
    }
}

// ============================================================================
// SBIO: Pure reply decoding (no I/O)
// ============================================================================

fn as_opt_string(value: Value) -> Result<Option<String>, StoreError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(StoreError::Protocol(format!("expected string, got {}", other))),
    }
}

fn as_integer(value: &Value) -> Result<i64, StoreError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| StoreError::Protocol(format!("expected integer, got {}", n))),
        Value::String(s) => s
            .parse()
            .map_err(|_| StoreError::Protocol(format!("expected integer, got {}", s))),
        other => Err(StoreError::Protocol(format!("expected integer, got {}", other))),
    }
}

fn as_string_list(value: Value) -> Result<Vec<String>, StoreError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(StoreError::Protocol(format!("expected key, got {}", other))),
            })
            .collect(),
        other => Err(StoreError::Protocol(format!("expected array, got {}", other))),
    }
}

#[async_trait]
impl KeyValueStore for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        as_opt_string(self.command(&["GET", key]).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1).to_string();
                self.command(&["SET", key, value, "EX", &secs]).await?;
            }
            None => {
                self.command(&["SET", key, value]).await?;
            }
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        match self.command(&["INCR", key]).await {
            Ok(value) => as_integer(&value),
            Err(StoreError::Command(msg)) if msg.contains("not an integer") => {
                Err(StoreError::NotAnInteger(key.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let secs = ttl.as_secs().max(1).to_string();
        let value = self.command(&["EXPIRE", key, &secs]).await?;
        Ok(as_integer(&value)? == 1)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = as_string_list(self.command(&["KEYS", pattern]).await?)?;
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let value = self.command(&["DEL", key]).await?;
        Ok(as_integer(&value)? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_endpoint_from_domain() {
        assert_eq!(
            RestStore::new("eu1-demo.upstash.io", "t").endpoint(),
            "https://eu1-demo.upstash.io"
        );
        assert_eq!(
            RestStore::new("http://127.0.0.1:8080/", "t").endpoint(),
            "http://127.0.0.1:8080"
        );
    }

    #[tokio::test]
    async fn test_get_sends_command_array_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!(["GET", "apikey:sk-1"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "alice"})))
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "secret");
        assert_eq!(store.get("apikey:sk-1").await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_set_with_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["SET", "k", "v", "EX", "60"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "OK"})))
            .expect(1)
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "secret");
        store.set("k", "v", Some(Duration::from_secs(60))).await.unwrap();
    }

    #[tokio::test]
    async fn test_incr_expire_keys_del() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["INCR", "n"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 3})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!(["EXPIRE", "n", "10"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 1})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!(["KEYS", "user-keys:u1:*"])))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": ["user-keys:u1:sk-b", "user-keys:u1:sk-a"]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!(["DEL", "n"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 0})))
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "secret");
        assert_eq!(store.incr("n").await.unwrap(), 3);
        assert!(store.expire("n", Duration::from_secs(10)).await.unwrap());
        assert_eq!(
            store.keys("user-keys:u1:*").await.unwrap(),
            vec!["user-keys:u1:sk-a", "user-keys:u1:sk-b"]
        );
        assert!(!store.del("n").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"error": "ERR value is not an integer or out of range"})),
            )
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "secret");
        assert_eq!(
            store.incr("word").await.unwrap_err(),
            StoreError::NotAnInteger("word".to_string())
        );
        assert!(matches!(store.get("x").await, Err(StoreError::Command(_))));
    }

    #[tokio::test]
    async fn test_unauthorized_plain_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "wrong");
        assert!(matches!(store.get("x").await, Err(StoreError::Protocol(_))));
    }
}
