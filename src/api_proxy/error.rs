//! Error Normalization
//!
//! Every failure the gateway reports, whether raised locally or received from an
//! upstream, is folded into [`ApiError`] and rendered in the Anthropic error shape:
//!
//! ```json
//! {"type": "error", "error": {"type": "rate_limit_error", "message": "..."}}
//! ```
//!
//! Upstream vocabulary never leaks through: unrecognised upstream error types
//! collapse to `api_error`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Anthropic `error` object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Top-level error document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub body_type: String,
    pub error: ErrorDetail,
}

/// Gateway error taxonomy
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Malformed inbound request, rejected before any upstream call
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authentication(String),
    /// No provider maps the requested model
    #[error("Model {0} is not configured")]
    NotFound(String),
    #[error("{message}")]
    RateLimit {
        message: String,
        upstream_status: Option<u16>,
    },
    /// Upstream unavailable: 5xx, refused connection, timeout
    #[error("{message}")]
    Overloaded {
        message: String,
        upstream_status: Option<u16>,
    },
    /// Any other upstream rejection, already mapped to a client-facing tag
    #[error("{message}")]
    Upstream {
        error_type: &'static str,
        message: String,
        upstream_status: u16,
    },
    /// Failure after the event stream started
    #[error("Stream interrupted: {0}")]
    StreamFault(Box<ApiError>),
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        ApiError::ConfigValidation(message.into())
    }

    /// Client-facing type tag
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Validation(_) | ApiError::NotFound(_) | ApiError::ConfigValidation(_) => {
                "invalid_request_error"
            }
            ApiError::Authentication(_) => "authentication_error",
            ApiError::RateLimit { .. } => "rate_limit_error",
            ApiError::Overloaded { .. } => "overloaded_error",
            ApiError::Upstream { error_type, .. } => *error_type,
            ApiError::StreamFault(inner) => inner.error_type(),
            ApiError::Internal(_) => "api_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::ConfigValidation(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Overloaded { .. } => {
                StatusCode::from_u16(529).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
            }
            ApiError::Upstream {
                upstream_status, ..
            } => StatusCode::from_u16(*upstream_status)
                .ok()
                .filter(|s| s.is_client_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ApiError::StreamFault(inner) => inner.status(),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Status code reported by the upstream, when the error came from one
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimit {
                upstream_status, ..
            }
            | ApiError::Overloaded {
                upstream_status, ..
            } => *upstream_status,
            ApiError::Upstream {
                upstream_status, ..
            } => Some(*upstream_status),
            ApiError::StreamFault(inner) => inner.upstream_status(),
            _ => None,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            error_type: self.error_type().to_string(),
            message: self.to_string(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            body_type: "error".to_string(),
            error: self.detail(),
        }
    }

    /// Wrap an error raised after streaming began
    pub fn into_stream_fault(self) -> Self {
        match self {
            fault @ ApiError::StreamFault(_) => fault,
            other => ApiError::StreamFault(Box::new(other)),
        }
    }

    /// Normalize a non-success upstream HTTP response
    pub fn from_upstream(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let error_obj = parsed.as_ref().and_then(|v| v.get("error"));
        let message = error_obj
            .and_then(upstream_message)
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty() && parsed.is_none()).then(|| trimmed.to_string())
            })
            .unwrap_or_else(|| format!("Upstream error (status {})", status));
        let vocabulary = error_obj.map(upstream_vocabulary).unwrap_or_default();

        classify(Some(status), &vocabulary, message)
    }

    /// Normalize an in-band `{"error": {...}}` payload seen inside a stream
    pub fn from_stream_payload(error: &Value) -> Self {
        let message =
            upstream_message(error).unwrap_or_else(|| "Upstream stream error".to_string());
        let status = error
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok());
        classify(status, &upstream_vocabulary(error), message).into_stream_fault()
    }

    /// Normalize a transport level failure (connect, reset, timeout, body read)
    pub fn from_transport(error: &reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            "Upstream request timed out".to_string()
        } else if error.is_connect() {
            "Could not connect to upstream".to_string()
        } else {
            format!("Upstream transport failure: {}", error)
        };
        ApiError::Overloaded {
            message,
            upstream_status: error.status().map(|s| s.as_u16()),
        }
    }
}

fn upstream_message(error: &Value) -> Option<String> {
    match error {
        Value::String(message) => Some(message.clone()),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// `type` and string `code` of an OpenAI-style error object
fn upstream_vocabulary(error: &Value) -> Vec<String> {
    ["type", "code"]
        .iter()
        .filter_map(|key| error.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn classify(status: Option<u16>, vocabulary: &[String], message: String) -> ApiError {
    if status == Some(429)
        || has_any(
            vocabulary,
            &["rate_limit_exceeded", "insufficient_quota", "rate_limit_error"],
        )
    {
        return ApiError::RateLimit {
            message,
            upstream_status: status,
        };
    }
    if status.is_some_and(|s| s >= 500)
        || has_any(vocabulary, &["server_error", "overloaded_error"])
    {
        return ApiError::Overloaded {
            message,
            upstream_status: status,
        };
    }

    let error_type = if has_any(vocabulary, &["invalid_api_key", "authentication_error"]) {
        "authentication_error"
    } else if has_any(
        vocabulary,
        &["model_not_found", "invalid_request_error", "context_length_exceeded"],
    ) {
        "invalid_request_error"
    } else {
        match status {
            Some(400 | 404 | 413 | 422) => "invalid_request_error",
            Some(401) => "authentication_error",
            Some(403) => "permission_error",
            _ => "api_error",
        }
    };

    ApiError::Upstream {
        error_type,
        message,
        upstream_status: status.unwrap_or(502),
    }
}

fn has_any(vocabulary: &[String], names: &[&str]) -> bool {
    vocabulary.iter().any(|v| names.contains(&v.as_str()))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
