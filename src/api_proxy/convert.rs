//! Request/Response Conversion
//!
//! This module handles conversion between Anthropic API format and OpenAI API format.
//!
//! Extended thinking has no upstream counterpart. It is emulated by asking the
//! model to reason first and then start its reply with [`THINKING_ANSWER_MARKER`];
//! the text before the marker is presented as a thinking block. This split is a
//! best-effort heuristic: a model that ignores the instruction, or that writes the
//! marker inside its reasoning, produces a misplaced boundary.

use super::config::{ProviderKind, TokenLimitField};
use super::error::{ApiError, ApiResult};
use super::types::*;
use uuid::Uuid;

/// Upper bound accepted for `max_tokens`
pub const MAX_TOKENS_LIMIT: u32 = 200_000;

/// Neutral sampling temperature used when the client does not send one
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Separates emulated reasoning from the final answer in upstream text
pub const THINKING_ANSWER_MARKER: &str = "Answer:";

/// Reject malformed requests before anything is sent upstream
pub fn validate_request(request: &MessagesRequest) -> ApiResult<()> {
    if request.model.trim().is_empty() {
        return Err(ApiError::validation("model: field required"));
    }
    if request.messages.is_empty() {
        return Err(ApiError::validation("messages: at least one message is required"));
    }
    if request.max_tokens == 0 || request.max_tokens > MAX_TOKENS_LIMIT {
        return Err(ApiError::validation(format!(
            "max_tokens: must be between 1 and {}, got {}",
            MAX_TOKENS_LIMIT, request.max_tokens
        )));
    }
    for (i, message) in request.messages.iter().enumerate() {
        if message.role != "user" && message.role != "assistant" {
            return Err(ApiError::validation(format!(
                "messages.{}.role: expected 'user' or 'assistant', got '{}'",
                i, message.role
            )));
        }
    }
    if let Some(t) = request.temperature {
        if !(0.0..=1.0).contains(&t) {
            return Err(ApiError::validation("temperature: must be between 0 and 1"));
        }
    }
    if let Some(p) = request.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(ApiError::validation("top_p: must be between 0 and 1"));
        }
    }
    if let Some(thinking) = request.thinking.as_ref().filter(|t| t.is_enabled()) {
        match thinking.budget_tokens {
            Some(budget) if budget > 0 && budget <= MAX_TOKENS_LIMIT => {}
            _ => {
                return Err(ApiError::validation(
                    "thinking.budget_tokens: a positive token budget is required",
                ))
            }
        }
    }
    Ok(())
}

/// Extract text from system content
fn extract_system_text(system: &SystemContent) -> String {
    match system {
        SystemContent::Text(text) => text.clone(),
        SystemContent::Blocks(blocks) => blocks
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Collapse message content to plain text, dropping non-text blocks
fn collapse_message_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => {
            let mut text = String::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: part } => text.push_str(part),
                    ContentBlock::Unsupported => {
                        log::debug!("Dropping non-text content block");
                    }
                }
            }
            text
        }
    }
}

/// System-prompt addendum that asks the upstream to reason before answering
pub fn thinking_instruction(budget_tokens: u32) -> String {
    format!(
        "Before answering, reason through the problem step by step. \
         Keep this reasoning within about {} tokens. \
         When you are done reasoning, write a new paragraph that begins with \"{}\" \
         followed by your final response.",
        budget_tokens, THINKING_ANSWER_MARKER
    )
}

/// Convert Anthropic request to OpenAI format
pub fn convert_anthropic_to_openai(
    request: &MessagesRequest,
    upstream_model: &str,
    kind: ProviderKind,
) -> OpenAIRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    let mut system_text = request
        .system
        .as_ref()
        .map(extract_system_text)
        .unwrap_or_default();
    if let Some(budget) = request.thinking_budget() {
        if !system_text.is_empty() {
            system_text.push_str("\n\n");
        }
        system_text.push_str(&thinking_instruction(budget));
    }
    if !system_text.is_empty() {
        messages.push(OpenAIMessage {
            role: "system".to_string(),
            content: system_text,
        });
    }

    for msg in &request.messages {
        messages.push(OpenAIMessage {
            role: msg.role.clone(),
            content: collapse_message_content(&msg.content),
        });
    }

    let (max_completion_tokens, max_tokens) = match kind.token_limit_field() {
        Some(TokenLimitField::MaxCompletionTokens) => (Some(request.max_tokens), None),
        Some(TokenLimitField::MaxTokens) => (None, Some(request.max_tokens)),
        None => (None, None),
    };

    let user = request
        .metadata
        .as_ref()
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let stream_options = (request.stream && kind.reports_stream_usage())
        .then_some(StreamOptions { include_usage: true });

    OpenAIRequest {
        model: upstream_model.to_string(),
        messages,
        max_completion_tokens,
        max_tokens,
        temperature: Some(request.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        user,
        stream: request.stream,
        stream_options,
        response_format: request.schema.clone().map(|schema| ResponseFormat {
            format_type: "json_schema".to_string(),
            schema,
        }),
    }
}

/// Map an OpenAI finish reason to an Anthropic stop reason
pub fn map_stop_reason(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("content_filter") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

/// Split `reasoning ... Answer: reply` into its two halves
pub fn split_thinking(text: &str) -> Option<(&str, &str)> {
    let pos = text.find(THINKING_ANSWER_MARKER)?;
    let thinking = text[..pos].trim_end();
    let answer = text[pos + THINKING_ANSWER_MARKER.len()..].trim_start();
    Some((thinking, answer))
}

/// Convert OpenAI response to Anthropic format
pub fn convert_openai_to_anthropic(
    response: &OpenAIResponse,
    original_model: &str,
    thinking_requested: bool,
) -> ApiResult<MessagesResponse> {
    let choice = response.choices.first().ok_or_else(|| ApiError::Upstream {
        error_type: "api_error",
        message: "Upstream response missing choices".to_string(),
        upstream_status: 502,
    })?;

    let text = choice.message.content.as_deref().unwrap_or_default();

    let content = match split_thinking(text).filter(|_| thinking_requested) {
        Some((thinking, answer)) => vec![
            ResponseContentBlock::Thinking {
                thinking: thinking.to_string(),
            },
            ResponseContentBlock::Text {
                text: answer.to_string(),
            },
        ],
        None => vec![ResponseContentBlock::Text {
            text: text.to_string(),
        }],
    };

    let usage = response.usage.clone().unwrap_or_default();

    Ok(MessagesResponse {
        id: response
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_message_id),
        model: original_model.to_string(),
        role: "assistant".to_string(),
        content,
        response_type: "message".to_string(),
        stop_reason: Some(map_stop_reason(choice.finish_reason.as_deref())),
        stop_sequence: None,
        usage: Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        },
    })
}

/// Generate a unique message ID
pub fn generate_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn basic_request() -> MessagesRequest {
        request(json!({
            "model": "m1",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 100
        }))
    }

    fn upstream_response(content: &str, finish_reason: Option<&str>) -> OpenAIResponse {
        serde_json::from_value(json!({
            "id": "chatcmpl-123",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": finish_reason
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        }))
        .unwrap()
    }

    #[test]
    fn test_request_basic() {
        let req = request(json!({
            "model": "claude-sonnet",
            "system": "You are helpful",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "Hello"}]}],
            "max_tokens": 64,
            "temperature": 0.2,
            "stop_sequences": ["END"],
            "metadata": {"user_id": "u-1"}
        }));

        let translated = convert_anthropic_to_openai(&req, "gpt-4.1", ProviderKind::OpenAI);
        assert_eq!(translated.model, "gpt-4.1");
        assert_eq!(translated.messages[0].role, "system");
        assert_eq!(translated.messages[0].content, "You are helpful");
        assert_eq!(translated.messages[1].content, "Hello");
        assert_eq!(translated.max_completion_tokens, Some(64));
        assert_eq!(translated.max_tokens, None);
        assert_eq!(translated.temperature, Some(0.2));
        assert_eq!(translated.stop, Some(vec!["END".to_string()]));
        assert_eq!(translated.user.as_deref(), Some("u-1"));
        assert!(!translated.stream);
        assert_eq!(translated.stream_options, None);
        assert_eq!(translated.response_format, None);
    }

    #[test]
    fn test_schema_becomes_response_format() {
        let schema = json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"]
        });
        let mut req = basic_request();
        req.schema = Some(schema.clone());

        let translated = convert_anthropic_to_openai(&req, "gpt-4.1", ProviderKind::OpenAI);
        let body = serde_json::to_value(&translated).unwrap();
        assert_eq!(
            body["response_format"],
            json!({"type": "json_schema", "schema": schema})
        );
    }

    #[test]
    fn test_token_limit_field_follows_provider_kind() {
        let translated =
            convert_anthropic_to_openai(&basic_request(), "llama", ProviderKind::OpenAICompatible);
        assert_eq!(translated.max_tokens, Some(100));
        assert_eq!(translated.max_completion_tokens, None);

        let body = serde_json::to_value(&translated).unwrap();
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn test_defaults_and_stream_flag() {
        let mut req = basic_request();
        req.stream = true;

        let openai = convert_anthropic_to_openai(&req, "gpt-4.1", ProviderKind::OpenAI);
        assert_eq!(openai.temperature, Some(DEFAULT_TEMPERATURE));
        assert!(openai.stream);
        assert_eq!(openai.stream_options, Some(StreamOptions { include_usage: true }));
        assert_eq!(openai.messages.len(), 1);

        let compatible = convert_anthropic_to_openai(&req, "x", ProviderKind::OpenAICompatible);
        assert!(compatible.stream);
        assert_eq!(compatible.stream_options, None);
    }

    #[test]
    fn test_thinking_becomes_system_instruction() {
        let mut req = basic_request();
        req.thinking = Some(ThinkingConfig::enabled(500));

        let translated = convert_anthropic_to_openai(&req, "gpt-4.1", ProviderKind::OpenAI);
        assert_eq!(translated.messages[0].role, "system");
        assert!(translated.messages[0].content.contains("500 tokens"));
        assert!(translated.messages[0].content.contains(THINKING_ANSWER_MARKER));

        req.system = Some(SystemContent::Text("Be brief".into()));
        let translated = convert_anthropic_to_openai(&req, "gpt-4.1", ProviderKind::OpenAI);
        assert!(translated.messages[0].content.starts_with("Be brief\n\n"));
    }

    #[test]
    fn test_validation_rejects_malformed_requests() {
        let mut zero = basic_request();
        zero.max_tokens = 0;
        let mut too_many = basic_request();
        too_many.max_tokens = MAX_TOKENS_LIMIT + 1;
        let mut no_messages = basic_request();
        no_messages.messages.clear();
        let mut bad_role = basic_request();
        bad_role.messages[0].role = "system".into();
        let mut no_budget = basic_request();
        no_budget.thinking = Some(ThinkingConfig::enabled(0));
        let mut hot = basic_request();
        hot.temperature = Some(1.5);

        for req in [zero, too_many, no_messages, bad_role, no_budget, hot] {
            let err = validate_request(&req).unwrap_err();
            assert_eq!(err.error_type(), "invalid_request_error");
        }
        assert!(validate_request(&basic_request()).is_ok());
    }

    #[test]
    fn test_stop_reason_table() {
        let table = [
            (Some("stop"), StopReason::EndTurn),
            (Some("length"), StopReason::MaxTokens),
            (Some("content_filter"), StopReason::StopSequence),
            (Some("tool_calls"), StopReason::EndTurn),
            (Some("function_call"), StopReason::EndTurn),
            (Some("something_new"), StopReason::EndTurn),
            (None, StopReason::EndTurn),
        ];
        for (reason, expected) in table {
            assert_eq!(map_stop_reason(reason), expected, "{:?}", reason);
        }
    }

    #[test]
    fn test_response_length_maps_to_max_tokens() {
        let response = upstream_response("partial", Some("length"));
        let converted = convert_openai_to_anthropic(&response, "m1", false).unwrap();

        assert_eq!(converted.stop_reason, Some(StopReason::MaxTokens));
        assert_eq!(
            converted.content,
            vec![ResponseContentBlock::Text { text: "partial".into() }]
        );
        assert_eq!(converted.usage.input_tokens, 10);
        assert_eq!(converted.usage.output_tokens, 20);
    }

    #[test]
    fn test_response_thinking_split_only_when_requested() {
        let response = upstream_response("Let me think.\n\nAnswer: 42", Some("stop"));

        let plain = convert_openai_to_anthropic(&response, "m1", false).unwrap();
        assert_eq!(plain.content.len(), 1);

        let split = convert_openai_to_anthropic(&response, "m1", true).unwrap();
        assert_eq!(
            split.content,
            vec![
                ResponseContentBlock::Thinking { thinking: "Let me think.".into() },
                ResponseContentBlock::Text { text: "42".into() },
            ]
        );

        let no_marker = upstream_response("just text", Some("stop"));
        let converted = convert_openai_to_anthropic(&no_marker, "m1", true).unwrap();
        assert_eq!(
            converted.content,
            vec![ResponseContentBlock::Text { text: "just text".into() }]
        );
    }

    #[test]
    fn test_missing_choices_is_upstream_error() {
        let response: OpenAIResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        let err = convert_openai_to_anthropic(&response, "m1", false).unwrap_err();
        assert_eq!(err.error_type(), "api_error");
    }

    #[test]
    fn test_round_trip_preserves_client_model() {
        let req = basic_request();
        let upstream = convert_anthropic_to_openai(&req, "gpt-4.1", ProviderKind::OpenAI);
        assert_eq!(upstream.model, "gpt-4.1");

        let response = upstream_response("hello", Some("stop"));
        let converted = convert_openai_to_anthropic(&response, &req.model, false).unwrap();
        assert_eq!(converted.model, "m1");
        assert!(converted.id.starts_with("chatcmpl-") || converted.id.starts_with("msg_"));
    }
}
