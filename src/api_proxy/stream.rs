//! Streaming Session
//!
//! Converts the OpenAI chunk sequence of one request into the Anthropic event
//! sequence. The session is a plain state machine with no I/O so the ordering
//! rules can be exercised directly:
//!
//! ```text
//! START -> (THINKING)? -> TEXT -> STOPPING -> DONE
//!            \____________\________\_______-> ERROR
//! ```
//!
//! - content block indices start at 0, increase by one and are never reused;
//! - a block is closed before the next one opens;
//! - nothing is emitted after `message_stop` or `error`.

use super::convert::{generate_message_id, map_stop_reason, THINKING_ANSWER_MARKER};
use super::error::ApiError;
use super::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Thinking,
    Text,
    Stopping,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    index: u32,
    kind: BlockKind,
}

/// Event builder for one streamed reply.
///
/// With thinking requested, text is held as reasoning until the `Answer:`
/// marker shows up. A reply that never emits the marker ends with a single
/// thinking block and no text block. The non-streaming path differs here: it
/// cannot look ahead either way, so it returns the whole reply as text.
pub struct StreamSession {
    message_id: String,
    model: String,
    state: SessionState,
    next_index: u32,
    open_block: Option<OpenBlock>,
    thinking_requested: bool,
    splitter: MarkerSplitter,
    answer_started: bool,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl StreamSession {
    pub fn new(model: impl Into<String>, thinking_requested: bool) -> Self {
        Self {
            message_id: generate_message_id(),
            model: model.into(),
            state: SessionState::Start,
            next_index: 0,
            open_block: None,
            thinking_requested,
            splitter: MarkerSplitter::default(),
            answer_started: !thinking_requested,
            stop_reason: None,
            usage: Usage::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Done | SessionState::Error)
    }

    /// Emit `message_start`. Later calls are no-ops.
    pub fn start(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        events
    }

    /// Feed one decoded upstream chunk
    pub fn on_chunk(&mut self, chunk: &OpenAIStreamChunk) -> Vec<StreamEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        if let Some(error) = &chunk.error {
            return self.fail(ApiError::from_stream_payload(error));
        }

        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if let Some(usage) = &chunk.usage {
            self.usage.input_tokens = usage.prompt_tokens;
            self.usage.output_tokens = usage.completion_tokens;
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = choice.delta.content.as_deref() {
                events.extend(self.push_text(text));
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.stop_reason = Some(map_stop_reason(Some(reason)));
                self.state = SessionState::Stopping;
            }
        }

        events
    }

    /// Feed a text fragment from the upstream
    pub fn push_text(&mut self, fragment: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.state {
            SessionState::Done | SessionState::Error => return events,
            SessionState::Stopping => {
                log::debug!("Ignoring text received after finish reason");
                return events;
            }
            SessionState::Start => self.ensure_started(&mut events),
            SessionState::Thinking | SessionState::Text => {}
        }

        if self.state == SessionState::Thinking {
            let (thinking, answer) = self.splitter.push(fragment);
            self.emit(BlockKind::Thinking, &thinking, &mut events);
            if let Some(answer) = answer {
                self.close_block(&mut events);
                self.state = SessionState::Text;
                self.emit_answer(&answer, &mut events);
            }
        } else {
            self.emit_answer(fragment, &mut events);
        }

        events
    }

    /// Upstream finished: close the open block, then `message_delta` and `message_stop`
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }
        self.ensure_started(&mut events);

        // no marker seen: whatever is still held back is reasoning
        let rest = self.splitter.flush();
        self.emit(BlockKind::Thinking, &rest, &mut events);
        self.close_block(&mut events);

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        events.push(StreamEvent::MessageStop);
        self.state = SessionState::Done;
        events
    }

    /// Abort with an `error` event; the stream ends here
    pub fn fail(&mut self, error: ApiError) -> Vec<StreamEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.state = SessionState::Error;
        self.open_block = None;
        vec![StreamEvent::Error {
            error: error.into_stream_fault().detail(),
        }]
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.state != SessionState::Start {
            return;
        }
        events.push(StreamEvent::MessageStart {
            message: StreamMessage {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: vec![],
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        });
        self.state = if self.thinking_requested {
            SessionState::Thinking
        } else {
            SessionState::Text
        };
    }

    fn emit_answer(&mut self, fragment: &str, events: &mut Vec<StreamEvent>) {
        // whitespace between the marker and the answer is dropped
        let text = if self.answer_started {
            fragment
        } else {
            fragment.trim_start()
        };
        if text.is_empty() {
            return;
        }
        self.answer_started = true;
        self.emit(BlockKind::Text, text, events);
    }

    fn emit(&mut self, kind: BlockKind, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        let index = match self.open_block {
            Some(block) if block.kind == kind => block.index,
            _ => {
                self.close_block(events);
                self.open(kind, events)
            }
        };
        let delta = match kind {
            BlockKind::Thinking => StreamDelta::ThinkingDelta {
                thinking: text.to_string(),
            },
            BlockKind::Text => StreamDelta::TextDelta {
                text: text.to_string(),
            },
        };
        events.push(StreamEvent::ContentBlockDelta { index, delta });
    }

    fn open(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        let content_block = match kind {
            BlockKind::Thinking => StreamContentBlock::Thinking {
                thinking: String::new(),
            },
            BlockKind::Text => StreamContentBlock::Text {
                text: String::new(),
            },
        };
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        self.open_block = Some(OpenBlock { index, kind });
        index
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(block) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop { index: block.index });
        }
    }
}

/// Finds [`THINKING_ANSWER_MARKER`] in text that arrives in arbitrary fragments.
///
/// Text that might be the start of the marker, and whitespace that might precede
/// it, is held back until the next fragment decides.
#[derive(Debug, Default)]
struct MarkerSplitter {
    pending: String,
}

impl MarkerSplitter {
    /// Returns thinking text safe to emit and, once the marker is seen, the
    /// answer text that followed it in the same fragment.
    fn push(&mut self, fragment: &str) -> (String, Option<String>) {
        self.pending.push_str(fragment);

        if let Some(pos) = self.pending.find(THINKING_ANSWER_MARKER) {
            let thinking = self.pending[..pos].trim_end().to_string();
            let answer = self.pending[pos + THINKING_ANSWER_MARKER.len()..].to_string();
            self.pending.clear();
            return (thinking, Some(answer));
        }

        let hold = marker_prefix_suffix_len(&self.pending);
        let emit_end = self.pending[..self.pending.len() - hold].trim_end().len();
        let ready = self.pending[..emit_end].to_string();
        self.pending.drain(..emit_end);
        (ready, None)
    }

    fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the marker
fn marker_prefix_suffix_len(text: &str) -> usize {
    let max = text.len().min(THINKING_ANSWER_MARKER.len() - 1);
    (1..=max)
        .rev()
        .find(|&k| {
            let start = text.len() - k;
            text.is_char_boundary(start) && THINKING_ANSWER_MARKER.starts_with(&text[start..])
        })
        .unwrap_or(0)
}
