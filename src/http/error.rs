//! Normalized API error shape.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    /// No response reached us.
    Network,
    /// Non-success HTTP status other than 401.
    Http,
    /// 401, or a failed token refresh.
    Unauthorized,
    /// Response body did not match the expected shape.
    Decode,
    /// Request could not be built.
    InvalidRequest,
    Unknown,
}

impl ApiErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Http => "HTTP_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Decode => "DECODE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure of the API client, in one shape.
///
/// `status` is 0 when no HTTP response was involved.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code} ({status}): {message}")]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub status: u16,
    /// Original payload, for diagnostics.
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: 0,
            details: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Network, message)
    }

    pub fn decode(message: impl Into<String>, body: &str) -> Self {
        Self {
            details: Some(Value::String(body.to_string())),
            ..Self::new(ApiErrorCode::Decode, message)
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: 401,
            ..Self::new(ApiErrorCode::Unauthorized, message)
        }
    }

    /// Build from a non-success HTTP response.
    #[must_use]
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let message = parsed
            .as_ref()
            .and_then(extract_error_message)
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    format!("HTTP {status}")
                } else {
                    body.trim().to_string()
                }
            });
        let code = if status == 401 {
            ApiErrorCode::Unauthorized
        } else {
            ApiErrorCode::Http
        };

        Self {
            code,
            message,
            status,
            details: parsed.or_else(|| (!body.is_empty()).then(|| Value::String(body.to_string()))),
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.code == ApiErrorCode::Unauthorized
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::from_response(status.as_u16(), &e.to_string()),
            None if e.is_decode() => Self::new(ApiErrorCode::Decode, e.to_string()),
            None if e.is_builder() => Self::new(ApiErrorCode::InvalidRequest, e.to_string()),
            None => Self::network(e.to_string()),
        }
    }
}

/// Extract a user-friendly message from a JSON error body.
fn extract_error_message(json: &Value) -> Option<String> {
    // Common patterns:
    // {"error": {"message": "...", "code": "..."}}
    // {"error": "..."}
    // {"message": "..."}
    // {"detail": "..."}
    if let Some(error_obj) = json.get("error") {
        if let Some(msg) = error_obj.get("message").and_then(Value::as_str) {
            if let Some(code) = error_obj.get("code").and_then(Value::as_str) {
                return Some(format!("{msg} (code: {code})"));
            }
            return Some(msg.to_string());
        }

        if let Some(msg) = error_obj.as_str() {
            return Some(msg.to_string());
        }
    }

    json.get("message")
        .or_else(|| json.get("detail"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_error_message() {
        let body = r#"{"error":{"message":"Issue not found","code":"not_found"}}"#;
        let err = ApiError::from_response(404, body);
        assert_eq!(err.code, ApiErrorCode::Http);
        assert_eq!(err.status, 404);
        assert_eq!(err.message, "Issue not found (code: not_found)");
        assert!(err.details.unwrap().get("error").is_some());
    }

    #[test]
    fn test_flat_error_shapes() {
        assert_eq!(
            ApiError::from_response(400, r#"{"error":"Bad input"}"#).message,
            "Bad input"
        );
        assert_eq!(
            ApiError::from_response(500, r#"{"message":"Boom"}"#).message,
            "Boom"
        );
        assert_eq!(
            ApiError::from_response(422, r#"{"detail":"Missing field"}"#).message,
            "Missing field"
        );
    }

    #[test]
    fn test_plain_text_and_empty_bodies() {
        let err = ApiError::from_response(502, "Bad Gateway");
        assert_eq!(err.message, "Bad Gateway");
        assert_eq!(err.details, Some(Value::String("Bad Gateway".into())));

        let err = ApiError::from_response(503, "");
        assert_eq!(err.message, "HTTP 503");
        assert!(err.details.is_none());
    }

    #[test]
    fn test_unauthorized_code() {
        let err = ApiError::from_response(401, r#"{"message":"Token expired"}"#);
        assert!(err.is_unauthorized());
        assert_eq!(err.to_string(), "UNAUTHORIZED (401): Token expired");
    }

    #[test]
    fn test_network_status_is_zero() {
        let err = ApiError::network("connection refused");
        assert_eq!(err.status, 0);
        assert_eq!(err.code, ApiErrorCode::Network);
    }
}
