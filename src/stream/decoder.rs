//! Server-sent-event decoding of chat-completion streams
//!
//! The decoder line-buffers the raw response body, extracts `data:` frames,
//! parses each frame against the provider's chunk schema and turns it into
//! [`StreamEvent`]s. Decoding is one-shot: one decoder per response body.
//!
//! Frame handling:
//!
//! - Lines without a `data:` prefix (comments, `event:`, keep-alives) are
//!   ignored.
//! - `data: [DONE]` ends decoding; pending tool calls are flushed, then
//!   [`StreamEvent::Done`] is emitted.
//! - A frame that fails to parse is logged and skipped.
//! - A transport error emits one [`StreamEvent::Error`] and ends decoding
//!   without `Done`.
//! - End of body processes the leftover partial line, then behaves like
//!   `[DONE]`.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt::Display;

use super::accumulator::ToolCallAccumulator;
use crate::conversation::{ToolCall, Usage};
use crate::media::data_uri;

/// Longest line accepted before the stream is abandoned
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Typed event decoded from the response stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Answer text delta
    Text(String),
    /// Reasoning text delta
    Thinking(String),
    /// Inline generated media
    Media {
        /// Raw payload
        bytes: Bytes,
        /// MIME type of the payload
        mime_type: String,
    },
    /// Complete tool calls; emitted once the tool-call phase is over
    ToolCalls(Vec<ToolCall>),
    /// Token usage reported for this response
    Usage(Usage),
    /// Error reported by the provider or the transport
    Error(String),
    /// The response is complete
    Done,
}

// ---------------------------------------------------------------------------
// Provider chunk schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Option<Vec<ChunkChoice>>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(default)]
    images: Option<Vec<ImageDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageDelta {
    image_url: ImageUrl,
}

#[derive(Debug, Deserialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

fn error_message(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decodes an SSE byte stream into [`StreamEvent`]s
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use forkchat::stream::{StreamDecoder, StreamEvent};
///
/// # #[tokio::main]
/// # async fn main() {
/// let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";
/// let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);
/// let mut decoder = StreamDecoder::new(chunks);
///
/// assert_eq!(decoder.next_event().await, Some(StreamEvent::Text("Hi".into())));
/// assert_eq!(decoder.next_event().await, Some(StreamEvent::Done));
/// assert_eq!(decoder.next_event().await, None);
/// # }
/// ```
pub struct StreamDecoder<S> {
    body: S,
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    tool_calls: ToolCallAccumulator,
    finished: bool,
}

impl<S, E> StreamDecoder<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Display,
{
    /// Wraps a response body
    pub fn new(body: S) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            tool_calls: ToolCallAccumulator::new(),
            finished: false,
        }
    }

    /// Returns the next event, or `None` once decoding has ended
    ///
    /// Pulls more bytes from the body only when no decoded event is queued;
    /// every call is a suspension point that honours transport backpressure.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.feed(&chunk),
                Some(Err(e)) => {
                    tracing::warn!("Stream transport failed: {}", e);
                    self.pending
                        .push_back(StreamEvent::Error(format!("stream interrupted: {}", e)));
                    self.finished = true;
                }
                None => self.finish_body(),
            }
        }
    }

    /// Converts the decoder into a [`Stream`] of events
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures::stream::unfold(self, |mut decoder| async move {
            decoder.next_event().await.map(|event| (event, decoder))
        })
    }

    fn feed(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while !self.finished {
            match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.buffer.extend_from_slice(&rest[..pos]);
                    rest = &rest[pos + 1..];
                    let line = std::mem::take(&mut self.buffer);
                    self.process_line(&line);
                }
                None => {
                    self.buffer.extend_from_slice(rest);
                    break;
                }
            }
        }

        if !self.finished && self.buffer.len() > MAX_LINE_BYTES {
            tracing::error!(bytes = self.buffer.len(), "SSE line exceeded size limit");
            self.buffer.clear();
            self.pending.push_back(StreamEvent::Error(format!(
                "stream line exceeded {} bytes",
                MAX_LINE_BYTES
            )));
            self.finished = true;
        }
    }

    fn finish_body(&mut self) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line);
        }
        if !self.finished {
            self.complete();
        }
    }

    fn complete(&mut self) {
        self.flush_tool_calls();
        self.pending.push_back(StreamEvent::Done);
        self.finished = true;
    }

    fn flush_tool_calls(&mut self) {
        if !self.tool_calls.is_empty() {
            let calls = self.tool_calls.take();
            if !calls.is_empty() {
                self.pending.push_back(StreamEvent::ToolCalls(calls));
            }
        }
    }

    fn process_line(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let Ok(line) = std::str::from_utf8(raw) else {
            tracing::warn!("Skipping SSE line with invalid UTF-8");
            return;
        };
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            self.complete();
            return;
        }
        if payload.is_empty() {
            return;
        }

        match serde_json::from_str::<ChatChunk>(payload) {
            Ok(chunk) => self.apply_chunk(chunk),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable stream frame");
            }
        }
    }

    fn apply_chunk(&mut self, chunk: ChatChunk) {
        if let Some(error) = &chunk.error {
            self.pending
                .push_back(StreamEvent::Error(error_message(error)));
        }

        if let Some(usage) = chunk.usage {
            let cached = usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0);
            self.pending.push_back(StreamEvent::Usage(Usage::new(
                usage.prompt_tokens,
                usage.completion_tokens,
                cached,
            )));
        }

        let Some(choice) = chunk.choices.and_then(|c| c.into_iter().next()) else {
            return;
        };

        if let Some(delta) = choice.delta {
            if let Some(thinking) = delta.reasoning.or(delta.reasoning_content) {
                if !thinking.is_empty() {
                    self.pending.push_back(StreamEvent::Thinking(thinking));
                }
            }
            if let Some(text) = delta.content {
                if !text.is_empty() {
                    self.pending.push_back(StreamEvent::Text(text));
                }
            }
            for image in delta.images.unwrap_or_default() {
                match data_uri::decode(&image.image_url.url) {
                    Ok((bytes, mime_type)) => self.pending.push_back(StreamEvent::Media {
                        bytes: Bytes::from(bytes),
                        mime_type,
                    }),
                    Err(e) => tracing::warn!(error = %e, "Skipping non-inline image delta"),
                }
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match &call.function {
                    Some(f) => (f.name.as_deref(), f.arguments.as_deref()),
                    None => (None, None),
                };
                self.tool_calls
                    .update(call.index, call.id.as_deref(), name, arguments);
            }
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            self.flush_tool_calls();
        }
    }
}
