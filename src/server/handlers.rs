use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::relay::RelayResponse;
use crate::server::error::{ApiError, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
use crate::server::state::AppState;
use crate::store::keys::has_key_format;
use crate::store::{mask_key, Identity, RateLimitDecision};

const FALLBACK_CLIENT_IP: &str = "127.0.0.1";

/// Query parameters of the key management endpoint
#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CreateKeyRequest {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

// ============================================================================
// SBIO: Pure request inspection (no I/O)
// ============================================================================

/// Bearer token, or the OpenAI-style `api-key` header
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    bearer
        .or_else(|| headers.get("api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// First `x-forwarded-for` entry, then `x-real-ip`, then loopback
pub fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .unwrap_or(FALLBACK_CLIENT_IP)
        .to_string()
}

fn rate_headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers
}

// ============================================================================
// Guards
// ============================================================================

/// Validate the caller's API key, returning the token
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = extract_token(headers).ok_or_else(|| ApiError::unauthorized("Missing API key"))?;

    if !has_key_format(&token) {
        return Err(ApiError::unauthorized("Invalid API key format"));
    }

    match state.keys.lookup(&token).await? {
        Some(user_id) => {
            debug!(user_id = %user_id, key = %mask_key(&token), "API key accepted");
            Ok(token)
        }
        None => Err(ApiError::unauthorized("Invalid API key")),
    }
}

async fn limit_token(state: &AppState, token: &str) -> Result<HeaderMap, ApiError> {
    let decision = state
        .limiter
        .enforce(&Identity::Token(token.to_string()), &state.settings.token_limit)
        .await?;
    Ok(rate_headers(&decision))
}

async fn limit_ip(state: &AppState, headers: &HeaderMap) -> Result<HeaderMap, ApiError> {
    let decision = state
        .limiter
        .enforce(&Identity::Ip(client_ip(headers)), &state.settings.ip_limit)
        .await?;
    Ok(rate_headers(&decision))
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn ping(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"pong": true, "backend": state.backend()}))
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

/// OpenAI-compatible chat endpoint, relayed upstream
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let token = authenticate(&state, &headers).await?;
    let limit_headers = limit_token(&state, &token).await?;

    let request: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))?;

    let mut response = match state.relay.relay(request, &headers).await? {
        RelayResponse::Json { status, body } => (status, Json(body)).into_response(),
        RelayResponse::Stream(events) => {
            let mut response = Body::from_stream(events).into_response();
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
    };

    response.headers_mut().extend(limit_headers);
    Ok(response)
}

pub async fn models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = authenticate(&state, &headers).await?;
    let limit_headers = limit_token(&state, &token).await?;

    let response = match state.relay.models(&headers).await {
        RelayResponse::Json { status, body } => (status, Json(body)).into_response(),
        RelayResponse::Stream(events) => Body::from_stream(events).into_response(),
    };
    Ok((limit_headers, response).into_response())
}

/// Issue a key. The body is optional: `{"userId": "..."}`
pub async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let limit_headers = limit_ip(&state, &headers).await?;

    let request: CreateKeyRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateKeyRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))?
    };

    let record = state.keys.issue(request.user_id.as_deref()).await?;
    info!(user_id = %record.user_id, "Key created via API");

    Ok((
        limit_headers,
        Json(json!({
            "done": true,
            "key": record.key,
            "type": "simple",
            "createdAt": record.created_at.to_rfc3339(),
        })),
    )
        .into_response())
}

pub async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Response, ApiError> {
    let limit_headers = limit_ip(&state, &headers).await?;

    let records = state.keys.list(query.user_id.as_deref()).await?;
    let api_keys: Vec<Value> = records
        .iter()
        .map(|r| json!([r.key, r.claims(&state.settings.token_limit)]))
        .collect();

    Ok((limit_headers, Json(json!({ "apiKeys": api_keys }))).into_response())
}

pub async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Response, ApiError> {
    let limit_headers = limit_ip(&state, &headers).await?;

    let key = query.key.unwrap_or_default();
    state.keys.revoke(&key, query.user_id.as_deref()).await?;

    Ok((limit_headers, Json(json!({"done": true}))).into_response())
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ping", get(ping))
        .route(
            "/api/keys",
            put(create_key)
                .get(list_keys)
                .delete(delete_key)
                .fallback(method_not_allowed),
        )
        .route("/v1/models", get(models).fallback(method_not_allowed))
        .route(
            "/v1/chat/completions",
            post(chat_completions).fallback(method_not_allowed),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
