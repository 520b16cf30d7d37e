//! HTTP Client for upstream API requests
//!
//! This module performs the chat completion calls against OpenAI-style providers
//! and decodes their server-sent event streams.

use super::config::ProviderConfig;
use super::credentials;
use super::error::{ApiError, ApiResult};
use super::types::*;
use reqwest::{header, Client, RequestBuilder};
use std::error::Error as _;
use std::time::Duration;

/// API client for making requests to upstream providers
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    retry_backoff: Duration,
}

impl ApiClient {
    /// Create a new API client with the timeouts from the given configuration
    pub fn new(config: &ProxyConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            retry_backoff: config.retry_backoff,
        })
    }

    fn post(&self, provider: &ProviderConfig, request: &OpenAIRequest) -> RequestBuilder {
        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        self.client
            .post(provider.chat_completions_url())
            .bearer_auth(credentials::resolve_upstream(provider))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, accept)
            .json(request)
    }

    /// Send a non-streaming request.
    ///
    /// A refused or reset connection is retried once after the configured backoff;
    /// every other failure, including any HTTP status, is returned as is.
    pub async fn chat_completions(
        &self,
        provider: &ProviderConfig,
        request: &OpenAIRequest,
    ) -> ApiResult<OpenAIResponse> {
        let mut retried = false;
        let response = loop {
            match self.post(provider, request).send().await {
                Ok(response) => break response,
                Err(e) if !retried && is_transient(&e) => {
                    log::warn!(
                        "Transient failure calling provider {}: {}; retrying in {:?}",
                        provider.name,
                        e,
                        self.retry_backoff
                    );
                    retried = true;
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(ApiError::from_transport(&e)),
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_upstream(status.as_u16(), &body));
        }

        response.json().await.map_err(|e| {
            if e.is_decode() {
                ApiError::Upstream {
                    error_type: "api_error",
                    message: format!("Invalid upstream response: {}", e),
                    upstream_status: 502,
                }
            } else {
                ApiError::from_transport(&e)
            }
        })
    }

    /// Open a streaming request. Returns once the upstream answered with a
    /// success status; the body is left for the caller to consume.
    pub async fn stream_chat_completions(
        &self,
        provider: &ProviderConfig,
        request: &OpenAIRequest,
    ) -> ApiResult<reqwest::Response> {
        let response = self
            .post(provider, request)
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_upstream(status.as_u16(), &body));
        }

        Ok(response)
    }
}

/// Connection refused or reset before any response arrived.
/// DNS, TLS and timeout failures are not retried.
fn is_transient(error: &reqwest::Error) -> bool {
    if error.is_timeout() {
        return false;
    }
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Incremental decoder for the `data:` lines of an SSE body.
///
/// Splits on raw newline bytes so multi-byte characters cut across network
/// chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes, returning the payload of every completed `data:` line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Payload of a trailing line that never got its newline
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    line.strip_prefix("data:")
        .map(|data| data.strip_prefix(' ').unwrap_or(data).to_string())
}

/// One decoded upstream SSE payload
#[derive(Debug)]
pub enum UpstreamEvent {
    Chunk(OpenAIStreamChunk),
    Done,
}

pub fn parse_stream_data(data: &str) -> Result<UpstreamEvent, serde_json::Error> {
    if data.trim() == "[DONE]" {
        return Ok(UpstreamEvent::Done);
    }
    serde_json::from_str(data).map(UpstreamEvent::Chunk)
}
