//! Credential Translation
//!
//! Clients authenticate to the gateway with either an `x-api-key` header or an
//! `Authorization: Bearer` header. Whatever they present never travels upstream:
//! upstream calls always carry the provider's own stored key.

use axum::http::{header, HeaderMap};

use super::config::ProviderConfig;
use super::error::{ApiError, ApiResult};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Credential presented by the client, `x-api-key` first, then a bearer token
pub fn extract(headers: &HeaderMap) -> Option<String> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(key) = api_key {
        return Some(key.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Credential attached to the upstream call for this provider
pub fn resolve_upstream(provider: &ProviderConfig) -> &str {
    &provider.api_key
}

/// Gateway-level client authentication
#[derive(Debug, Clone, Default)]
pub struct GatewayAuth {
    expected: Option<String>,
}

impl GatewayAuth {
    pub fn new(expected: Option<String>) -> Self {
        Self { expected }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Check the request's credential. With auth disabled every request passes and
    /// the credential, if any, is only used for identification.
    pub fn authenticate(&self, headers: &HeaderMap) -> ApiResult<Option<String>> {
        let presented = extract(headers);
        let Some(expected) = &self.expected else {
            return Ok(presented);
        };

        match presented {
            None => Err(ApiError::Authentication(
                "Missing API key: provide x-api-key or Authorization: Bearer".to_string(),
            )),
            Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => Ok(Some(key)),
            Some(_) => Err(ApiError::Authentication("Invalid API key".to_string())),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
