//! HTTP Server for the gateway
//!
//! Serves the Anthropic Messages API on top of the configured OpenAI-style
//! providers, plus the admin endpoints that stage and apply provider changes.

use super::client::ApiClient;
use super::config::{ConfigStore, ConfigView, StageRequest};
use super::credentials::GatewayAuth;
use super::error::{ApiError, ApiResult};
use super::gateway::Gateway;
use super::types::*;
use axum::{
    body::Bytes,
    extract::{Json, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// Server state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Open the configuration store and build the gateway around it
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ApiError> {
        let store = Arc::new(ConfigStore::open(&config.config_path)?);
        let client = ApiClient::new(config)?;
        let auth = GatewayAuth::new(config.gateway_api_key.clone());
        Ok(Self {
            gateway: Arc::new(Gateway::new(store, client, auth)),
        })
    }
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/messages", post(create_message))
        .route("/v1/models", get(list_models))
        .route("/admin/config", get(read_config).put(stage_config))
        .route("/admin/config/staged", get(read_staged_config))
        .route("/admin/restart", post(apply_config))
        .route("/admin/test-chat", post(test_chat))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(Arc::new(state))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Create message endpoint - handles both streaming and non-streaming
async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req_id = new_request_id();

    if let Err(e) = state.gateway.authenticate(&headers) {
        log::warn!("[{}] POST /v1/messages rejected: {}", req_id, e);
        return e.into_response();
    }

    let request = match Gateway::parse_request(&body) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("[{}] POST /v1/messages invalid: {}", req_id, e);
            return e.into_response();
        }
    };

    log::info!(
        "[{}] POST /v1/messages - model: {}, stream: {}, messages: {}, max_tokens: {}",
        req_id,
        request.model,
        request.stream,
        request.messages.len(),
        request.max_tokens
    );

    dispatch(&state.gateway, &request, &req_id).await
}

async fn dispatch(gateway: &Gateway, request: &MessagesRequest, req_id: &str) -> Response {
    if request.stream {
        match gateway.stream_message(request, req_id).await {
            Ok(rx) => sse_response(rx),
            Err(e) => {
                log::error!("[{}] Failed to start streaming: {}", req_id, e);
                e.into_response()
            }
        }
    } else {
        match gateway.send_message(request, req_id).await {
            Ok(response) => {
                log::info!(
                    "[{}] Response: model={}, tokens={}/{}",
                    req_id,
                    response.model,
                    response.usage.input_tokens,
                    response.usage.output_tokens
                );
                Json(response).into_response()
            }
            Err(e) => {
                log::error!("[{}] Request failed: {}", req_id, e);
                e.into_response()
            }
        }
    }
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Response {
    let stream = ReceiverStream::new(rx)
        .map(|event| Event::default().event(event.event_type()).json_data(&event));

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = state.gateway.authenticate(&headers) {
        return e.into_response();
    }
    Json(state.gateway.list_models()).into_response()
}

async fn read_config(State(state): State<Arc<AppState>>) -> Response {
    Json(state.gateway.store().active_view()).into_response()
}

async fn read_staged_config(State(state): State<Arc<AppState>>) -> Response {
    Json(state.gateway.store().staged_view()).into_response()
}

/// Replace the staged provider list; routing is unchanged until restart
async fn stage_config(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: StageRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return ApiError::config(format!("invalid body: {}", e)).into_response(),
    };

    let store = Arc::clone(state.gateway.store());
    match with_store(move || store.stage(request)).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => {
            log::warn!("Rejected configuration: {}", e);
            e.into_response()
        }
    }
}

/// Promote the staged configuration to active
async fn apply_config(State(state): State<Arc<AppState>>) -> Response {
    let store = Arc::clone(state.gateway.store());
    match with_store(move || store.commit()).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => {
            log::error!("Failed to apply configuration: {}", e);
            e.into_response()
        }
    }
}

/// Store writes touch the filesystem; keep them off the async workers
async fn with_store<F>(op: F) -> ApiResult<ConfigView>
where
    F: FnOnce() -> ApiResult<ConfigView> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| ApiError::Internal(format!("configuration task failed: {}", e)))?
}

/// Admin smoke test: a non-streaming messages call that skips gateway authentication
async fn test_chat(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req_id = new_request_id();
    let mut request = match Gateway::parse_request(&body) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    request.stream = false;
    log::info!("[{}] POST /admin/test-chat - model: {}", req_id, request.model);
    dispatch(&state.gateway, &request, &req_id).await
}

/// Run the server on the specified address
pub async fn run_server(
    config: ProxyConfig,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(&config)?;
    if config.gateway_api_key.is_none() {
        log::warn!("GATEWAY_API_KEY is not set, client requests are not authenticated");
    }
    let app = create_router(state);

    log::info!("Starting gateway on {}", addr);
    log::info!("Configuration file: {}", config.config_path.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Gateway stopped");
    Ok(())
}

/// Run the server with configuration from environment
pub async fn run_server_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::from_env();
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    run_server(config, addr).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
