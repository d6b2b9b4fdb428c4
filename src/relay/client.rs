//! HTTP client for the upstream model endpoint

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use std::time::Duration;

use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use super::RelayError;
use crate::config::RelaySettings;

pub const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
pub const X_OPENAI_AUTH: HeaderName = HeaderName::from_static("x-openai-auth");

/// Client headers copied onto the upstream request.
/// `accept-encoding` is left out so the body arrives as plain text.
const FORWARDED_HEADERS: [HeaderName; 3] = [USER_AGENT, ACCEPT, ACCEPT_LANGUAGE];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// `{base}/v1/{endpoint}` with slashes normalised
pub fn upstream_url(base: &str, endpoint: &str) -> String {
    format!(
        "{}/v1/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Headers sent upstream for a client request
pub fn upstream_headers(inbound: &HeaderMap, token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(value) = token
        .filter(|t| !t.is_empty())
        .and_then(|t| HeaderValue::from_str(t).ok())
    {
        headers.insert(X_API_KEY, value);
    }

    if let Some(auth) = inbound.get(AUTHORIZATION) {
        if auth.to_str().is_ok_and(|a| a.starts_with("Bearer sk-")) {
            headers.insert(X_OPENAI_AUTH, auth.clone());
        }
    }

    for name in FORWARDED_HEADERS {
        if let Some(value) = inbound.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    headers
}

// ============================================================================
// SBIO: I/O implementation
// ============================================================================

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl UpstreamClient {
    pub fn new(settings: &RelaySettings) -> Result<Self, RelayError> {
        // an idle limit rather than a total one, so long streams are not cut off
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(settings.request_timeout)
            .build()
            .map_err(|e| RelayError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.upstream_url.clone(),
            token: settings.upstream_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat_completions(
        &self,
        body: &Value,
        inbound: &HeaderMap,
    ) -> Result<Response, RelayError> {
        let url = upstream_url(&self.base_url, "chat/completions");
        debug!(url = %url, "Forwarding chat completion");

        self.client
            .post(&url)
            .headers(upstream_headers(inbound, self.token.as_deref()))
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))
    }

    pub async fn models(&self, inbound: &HeaderMap) -> Result<Response, RelayError> {
        let url = upstream_url(&self.base_url, "models");
        debug!(url = %url, "Fetching upstream models");

        self.client
            .get(&url)
            .headers(upstream_headers(inbound, self.token.as_deref()))
            .send()
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))
    }
}
