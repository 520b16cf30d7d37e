//! Request orchestration
//!
//! Drives one `/v1/messages` call: authenticate, validate, resolve the model
//! against the active snapshot, translate, call upstream, translate back.
//! Streaming calls hand the upstream body to a spawned task which feeds a
//! [`StreamSession`] and forwards its events over a bounded channel.

use std::sync::Arc;

use axum::http::HeaderMap;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::client::{parse_stream_data, ApiClient, SseDecoder, UpstreamEvent};
use super::config::ConfigStore;
use super::convert::{convert_anthropic_to_openai, convert_openai_to_anthropic, validate_request};
use super::credentials::GatewayAuth;
use super::error::{ApiError, ApiResult};
use super::stream::StreamSession;
use super::types::*;

const STREAM_CHANNEL_CAPACITY: usize = 100;

pub struct Gateway {
    store: Arc<ConfigStore>,
    client: ApiClient,
    auth: GatewayAuth,
}

impl Gateway {
    pub fn new(store: Arc<ConfigStore>, client: ApiClient, auth: GatewayAuth) -> Self {
        Self {
            store,
            client,
            auth,
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> ApiResult<()> {
        self.auth.authenticate(headers).map(|_| ())
    }

    /// Decode and validate a raw request body
    pub fn parse_request(body: &[u8]) -> ApiResult<MessagesRequest> {
        let request: MessagesRequest = serde_json::from_slice(body)
            .map_err(|e| ApiError::validation(format!("Invalid request body: {}", e)))?;
        validate_request(&request)?;
        Ok(request)
    }

    /// Non-streaming call
    pub async fn send_message(
        &self,
        request: &MessagesRequest,
        req_id: &str,
    ) -> ApiResult<MessagesResponse> {
        let route = self.store.resolve(&request.model)?;
        let openai_request =
            convert_anthropic_to_openai(request, &route.upstream_model, route.provider.kind);

        log::debug!(
            "[{}] {} -> {} via {} ({})",
            req_id,
            request.model,
            route.upstream_model,
            route.provider.name,
            route.provider.kind
        );

        let response = self
            .client
            .chat_completions(&route.provider, &openai_request)
            .await?;

        convert_openai_to_anthropic(&response, &request.model, request.thinking_budget().is_some())
    }

    /// Streaming call. Errors before the upstream accepted the request are
    /// returned directly; afterwards they arrive as an `error` event.
    pub async fn stream_message(
        &self,
        request: &MessagesRequest,
        req_id: &str,
    ) -> ApiResult<mpsc::Receiver<StreamEvent>> {
        let route = self.store.resolve(&request.model)?;
        let openai_request =
            convert_anthropic_to_openai(request, &route.upstream_model, route.provider.kind);

        log::debug!(
            "[{}] streaming {} -> {} via {}",
            req_id,
            request.model,
            route.upstream_model,
            route.provider.name
        );

        let response = self
            .client
            .stream_chat_completions(&route.provider, &openai_request)
            .await?;

        let session = StreamSession::new(&request.model, request.thinking_budget().is_some());
        let upstream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ApiError::from_transport(&e)));

        Ok(spawn_session(session, upstream, req_id.to_string()))
    }

    /// Models routable through the active snapshot
    pub fn list_models(&self) -> ModelList {
        let active = self.store.active();
        ModelList {
            data: active
                .registry
                .model_names()
                .iter()
                .map(|name| ModelInfo {
                    id: name.clone(),
                    model_type: "model".to_string(),
                    display_name: name.clone(),
                })
                .collect(),
            has_more: false,
        }
    }
}

/// Pump an upstream SSE body through `session` on a background task.
///
/// The task stops as soon as the receiver is dropped, dropping `upstream` with it.
pub fn spawn_session<S, B>(
    mut session: StreamSession,
    upstream: S,
    req_id: String,
) -> mpsc::Receiver<StreamEvent>
where
    S: Stream<Item = ApiResult<B>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        let mut decoder = SseDecoder::default();

        if !forward(&tx, session.start()).await {
            return;
        }

        while !session.is_terminal() {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => {
                    log::info!("[{}] client disconnected, cancelling upstream", req_id);
                    return;
                }
                next = upstream.next() => next,
            };

            let events = match next {
                Some(Ok(bytes)) => {
                    let mut events = Vec::new();
                    for data in decoder.push(bytes.as_ref()) {
                        events.extend(handle_payload(&mut session, &data, &req_id));
                    }
                    events
                }
                Some(Err(e)) => {
                    log::error!("[{}] upstream stream failed: {}", req_id, e);
                    session.fail(e)
                }
                None => {
                    let mut events = Vec::new();
                    if let Some(data) = decoder.finish() {
                        events.extend(handle_payload(&mut session, &data, &req_id));
                    }
                    events.extend(session.finish());
                    events
                }
            };

            if !forward(&tx, events).await {
                log::info!("[{}] client disconnected, cancelling upstream", req_id);
                return;
            }
        }

        log::debug!("[{}] stream closed in state {:?}", req_id, session.state());
    });

    rx
}

fn handle_payload(session: &mut StreamSession, data: &str, req_id: &str) -> Vec<StreamEvent> {
    match parse_stream_data(data) {
        Ok(UpstreamEvent::Done) => session.finish(),
        Ok(UpstreamEvent::Chunk(chunk)) => session.on_chunk(&chunk),
        Err(e) => {
            log::warn!("[{}] skipping malformed upstream chunk: {}", req_id, e);
            Vec::new()
        }
    }
}

/// Returns false once the receiver is gone
async fn forward(tx: &mpsc::Sender<StreamEvent>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}
