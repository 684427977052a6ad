//! Base provider trait and chat-completions wire types
//!
//! This module defines the outgoing request body, the message shapes it
//! carries, and the [`Provider`] trait every upstream implementation
//! satisfies. Providers only open the response stream; decoding it is the
//! job of [`crate::stream::StreamDecoder`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;

use crate::conversation::ToolCall;
use crate::error::Result;

/// Raw response body as a stream of byte chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Message content: plain text or a list of typed parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content
    Text(String),
    /// Multi-part content (text plus images)
    Parts(Vec<ContentPart>),
}

/// One part of a multi-part message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text part
    Text {
        /// The text
        text: String,
    },
    /// Image part; `url` is usually a `data:` URI
    ImageUrl {
        /// Image location
        image_url: ImageUrl,
    },
}

/// Image location inside a [`ContentPart::ImageUrl`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// URL or `data:` URI
    pub url: String,
}

/// Function call information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function/tool to call
    pub name: String,
    /// Arguments for the function (as JSON string)
    pub arguments: String,
}

/// Tool call as it appears in an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    /// Unique identifier for this tool call
    pub id: String,
    /// Always `"function"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Function call details
    pub function: FunctionCall,
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// Message structure for the request body
///
/// `content` is always serialized; an assistant message carrying
/// `tool_calls` encodes it as an explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Role of the message sender (user, assistant, system, tool)
    pub role: String,
    /// Content of the message
    pub content: Option<MessageContent>,
    /// Tool calls issued by an assistant message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    /// Originating call id (for tool result messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl RequestMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Creates a new user message
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::providers::RequestMessage;
    ///
    /// let msg = RequestMessage::user("Hello, assistant!");
    /// assert_eq!(msg.role, "user");
    /// assert!(!msg.has_media());
    /// ```
    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    /// Creates a user message with an attached image
    pub fn user_with_image(content: impl Into<String>, image_url: impl Into<String>) -> Self {
        let text: String = content.into();
        let mut parts = Vec::with_capacity(2);
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image_url.into(),
            },
        });
        Self {
            role: "user".to_string(),
            content: Some(MessageContent::Parts(parts)),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Creates a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    /// Creates a new tool result message
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::providers::RequestMessage;
    ///
    /// let msg = RequestMessage::tool_result("call_123", "42");
    /// assert_eq!(msg.role, "tool");
    /// assert_eq!(msg.tool_call_id, Some("call_123".to_string()));
    /// ```
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::text("tool", content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Creates an assistant message carrying a tool-call batch
    pub fn assistant_with_tools(tool_calls: &[ToolCall]) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(tool_calls.iter().map(WireToolCall::from).collect()),
            tool_call_id: None,
        }
    }

    /// Whether the message carries an image part
    pub fn has_media(&self) -> bool {
        matches!(
            &self.content,
            Some(MessageContent::Parts(parts))
                if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. }))
        )
    }
}

/// Function definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Tool name
    pub name: String,
    /// What the tool does
    pub description: String,
    /// JSON schema for the parameters
    pub parameters: serde_json::Value,
}

/// Tool definition in the request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Always `"function"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Function details
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Creates a function tool definition
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Reasoning budget for thinking-capable models
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Maximum reasoning tokens
    pub max_tokens: u32,
}

/// Streaming options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Ask the provider to send a final usage chunk
    pub include_usage: bool,
}

/// Outgoing chat-completions request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier
    pub model: String,
    /// Ordered conversation context
    pub messages: Vec<RequestMessage>,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling mass
    pub top_p: f32,
    /// Upper bound on generated tokens
    pub max_tokens: u32,
    /// Top-k sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Reasoning budget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Whether to stream the response
    pub stream: bool,
    /// Streaming options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    /// Advertised tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool selection policy, `"auto"` when tools are present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// Upstream chat provider
///
/// Implementations open a streaming chat-completions request and hand back
/// the raw response body. Non-2xx statuses and network failures are
/// returned as errors before any byte is streamed.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Sends `request` and returns the response body stream
    ///
    /// # Errors
    ///
    /// - `ForkchatError::Authentication` for 401/403 responses or a missing token
    /// - `ForkchatError::Transport` for network failures and other non-2xx statuses
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ByteStream>;

    /// Human-readable provider name used in logs
    fn name(&self) -> &str {
        "provider"
    }
}

/// Drops tool messages that do not answer a preceding tool call
///
/// Tool results without a matching assistant `tool_calls` entry are
/// rejected by providers, so they are filtered out before sending.
pub fn validate_message_sequence(messages: &[RequestMessage]) -> Vec<RequestMessage> {
    let mut valid_tool_ids: HashSet<&str> = HashSet::new();
    for message in messages {
        if message.role == "assistant" {
            if let Some(tool_calls) = &message.tool_calls {
                valid_tool_ids.extend(tool_calls.iter().map(|c| c.id.as_str()));
            }
        }
    }

    messages
        .iter()
        .filter(|message| {
            if message.role != "tool" {
                return true;
            }
            match message.tool_call_id.as_deref() {
                Some(id) if valid_tool_ids.contains(id) => true,
                Some(id) => {
                    tracing::warn!("Dropping orphan tool message with tool_call_id: {}", id);
                    false
                }
                None => {
                    tracing::warn!("Dropping tool message without tool_call_id");
                    false
                }
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "current_time".to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[test]
    fn test_assistant_with_tools_encodes_null_content() {
        let msg = RequestMessage::assistant_with_tools(&[call("call_1")]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["content"], serde_json::Value::Null);
        assert!(value.as_object().unwrap().contains_key("content"));
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "current_time");
    }

    #[test]
    fn test_tool_result_serialization() {
        let msg = RequestMessage::tool_result("call_1", "noon");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"role": "tool", "content": "noon", "tool_call_id": "call_1"})
        );
    }

    #[test]
    fn test_user_with_image_parts() {
        let msg = RequestMessage::user_with_image("what is this?", "data:image/png;base64,AA==");
        assert!(msg.has_media());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["content"][0], json!({"type": "text", "text": "what is this?"}));
        assert_eq!(
            value["content"][1],
            json!({"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}})
        );
    }

    #[test]
    fn test_chat_request_omits_unset_fields() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![RequestMessage::user("hi")],
            temperature: 1.0,
            top_p: 0.9,
            max_tokens: 100,
            top_k: None,
            reasoning: None,
            stream: true,
            stream_options: None,
            tools: None,
            tool_choice: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("tools"));
        assert!(!obj.contains_key("tool_choice"));
        assert!(!obj.contains_key("top_k"));
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn test_validate_message_sequence_drops_orphans() {
        let messages = vec![
            RequestMessage::user("hi"),
            RequestMessage::tool_result("orphan", "x"),
            RequestMessage::assistant_with_tools(&[call("call_1")]),
            RequestMessage::tool_result("call_1", "ok"),
        ];
        let validated = validate_message_sequence(&messages);
        assert_eq!(validated.len(), 3);
        assert_eq!(validated[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_tool_definition_shape() {
        let def = ToolDefinition::function("f", "does f", json!({"type": "object"}));
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "f");
    }
}
