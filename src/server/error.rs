use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

use crate::relay::RelayError;
use crate::store::{KeyError, RateLimitError, StoreError};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Error reply in the upstream API's shape: `{"error":{"message","type","code"}}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub kind: &'static str,
    pub code: Option<&'static str>,
    pub headers: HeaderMap,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>, kind: &'static str) -> Self {
        Self {
            status,
            message: message.into(),
            kind,
            code: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, "invalid_request_error")
            .with_code("invalid_api_key")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "invalid_request_error")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            "invalid_request_error",
        )
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, "server_error")
    }

    pub fn body(&self) -> Value {
        let mut error = json!({"message": self.message, "type": self.kind});
        if let Some(code) = self.code {
            error["code"] = json!(code);
        }
        json!({ "error": error })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body();
        (self.status, self.headers, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "Key store unavailable");
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Key store unavailable",
            "server_error",
        )
    }
}

impl From<KeyError> for ApiError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Missing => Self::bad_request("Invalid request"),
            KeyError::InvalidFormat => Self::bad_request("Invalid API key format"),
            KeyError::InvalidUser(_) => Self::bad_request("Invalid user id"),
            KeyError::Store(e) => e.into(),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::Limited {
                limit, retry_after, ..
            } => {
                let mut err = Self::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    e.to_string(),
                    "rate_limit_error",
                )
                .with_code("rate_limit_exceeded");
                err.headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
                err.headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
                err.headers
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
                err
            }
            RateLimitError::Store(e) => e.into(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        error!(error = %e, "Relay failed");
        Self::server_error("An error occurred while processing your request")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unauthorized_body() {
        let body = ApiError::unauthorized("Missing API key").body();
        assert_eq!(
            body,
            json!({"error": {
                "message": "Missing API key",
                "type": "invalid_request_error",
                "code": "invalid_api_key"
            }})
        );
    }

    #[test]
    fn test_code_is_omitted_when_absent() {
        let body = ApiError::method_not_allowed().body();
        assert!(body["error"].get("code").is_none());
    }

    #[test]
    fn test_rate_limited_carries_headers() {
        let err: ApiError = RateLimitError::Limited {
            limit: 5,
            window: Duration::from_secs(10),
            retry_after: Duration::from_secs(4),
        }
        .into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(err.headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(err.headers[RETRY_AFTER], "4");
        assert_eq!(err.body()["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn test_store_errors_are_unavailable() {
        let err: ApiError = KeyError::Store(StoreError::Connection("down".into())).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
