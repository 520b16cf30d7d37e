//! API Proxy Module
//!
//! Serves the Anthropic Messages API and forwards each call to an OpenAI-style
//! chat completions backend chosen by model name.
//!
//! # Features
//!
//! - **Model Routing**: every proxy-facing model name maps to exactly one
//!   provider and upstream model, as listed in the persisted configuration.
//!
//! - **Request/Response Conversion**: converts between the Messages API format
//!   and the Chat Completions format, including emulated extended thinking.
//!
//! - **Streaming Support**: upstream SSE chunks are turned into the Anthropic
//!   event sequence as they arrive; client disconnects cancel the upstream call.
//!
//! - **Staged Configuration**: provider changes are validated and persisted by
//!   `PUT /admin/config` and only take effect on `POST /admin/restart`.
//!
//! # Usage
//!
//! ```no_run
//! use oai2ant_lib::api_proxy::server;
//!
//! #[tokio::main]
//! async fn main() {
//!     server::run_server_from_env().await.unwrap();
//! }
//! ```
//!
//! # Configuration
//!
//! - `PROXY_HOST` / `PROXY_PORT`: listen address (default `0.0.0.0:8082`)
//! - `CONFIG_PATH`: persisted provider list (default `config/settings.json`)
//! - `GATEWAY_API_KEY`: when set, clients must present it
//! - `UPSTREAM_CONNECT_TIMEOUT_SECS`, `UPSTREAM_TIMEOUT_SECS`: upstream timeouts
//! - `UPSTREAM_RETRY_BACKOFF_MS`: delay before the single connection retry

pub mod client;
pub mod config;
pub mod convert;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod server;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use client::ApiClient;
pub use config::{ConfigStore, ProviderConfig, ProviderKind};
pub use error::{ApiError, ApiResult};
pub use gateway::Gateway;
pub use server::{create_router, run_server, run_server_from_env, AppState};
pub use types::{
    ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse, ProxyConfig,
    ResponseContentBlock, StopReason, StreamEvent, Usage,
};
