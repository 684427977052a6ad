//! Request construction from the active branch

use crate::conversation::{GenerationParams, Message, Role};
use crate::media::{data_uri, MediaLimits, MediaStore};
use crate::providers::{
    validate_message_sequence, ChatRequest, ReasoningConfig, RequestMessage, StreamOptions,
    ToolDefinition,
};

/// Request messages built from a branch, plus non-fatal problems found
#[derive(Debug, Default)]
pub struct BuiltMessages {
    /// Ordered request context
    pub messages: Vec<RequestMessage>,
    /// Attachments that could not be included
    pub warnings: Vec<String>,
}

/// Converts a branch into request messages
///
/// Only user turns carry media upstream; media attached to model or tool
/// messages is never re-sent. Images are embedded as `data:` URIs after
/// being read through `store` under the per-mime ceiling. Attachments that
/// fail to load are left out and reported in [`BuiltMessages::warnings`].
pub async fn build_messages(
    branch: &[Message],
    store: Option<&dyn MediaStore>,
    limits: &MediaLimits,
) -> BuiltMessages {
    let mut built = BuiltMessages::default();

    for message in branch {
        let request_message = match message.role {
            Role::User => match &message.media {
                Some(media) if media.mime_type.starts_with("image/") => {
                    match load_media(&media.url, &media.mime_type, store, limits).await {
                        Ok(uri) => RequestMessage::user_with_image(&message.text, uri),
                        Err(reason) => {
                            tracing::warn!(message_id = %message.id, "Dropping attachment: {}", reason);
                            built.warnings.push(reason);
                            RequestMessage::user(&message.text)
                        }
                    }
                }
                Some(media) => {
                    let reason = format!("unsupported attachment type {}", media.mime_type);
                    tracing::warn!(message_id = %message.id, "Dropping attachment: {}", reason);
                    built.warnings.push(reason);
                    RequestMessage::user(&message.text)
                }
                None => RequestMessage::user(&message.text),
            },
            Role::Model => RequestMessage::assistant(&message.text),
            Role::Tool => RequestMessage::tool_result(
                message.tool_call_id.clone().unwrap_or_default(),
                &message.text,
            ),
        };
        built.messages.push(request_message);
    }

    built.messages = validate_message_sequence(&built.messages);
    built
}

async fn load_media(
    location: &str,
    mime_type: &str,
    store: Option<&dyn MediaStore>,
    limits: &MediaLimits,
) -> std::result::Result<String, String> {
    let limit = limits.for_mime(mime_type);
    let bytes = match store {
        Some(store) => store
            .download(location, limit)
            .await
            .map_err(|e| format!("{}: {}", location_label(location), e))?,
        None if location.starts_with("data:") => {
            let (bytes, _) = data_uri::decode(location).map_err(|e| e.to_string())?;
            if bytes.len() > limit {
                return Err(format!(
                    "inline attachment exceeds {} bytes ({} bytes)",
                    limit,
                    bytes.len()
                ));
            }
            bytes
        }
        None => return Err(format!("no media store to read {}", location_label(location))),
    };
    Ok(data_uri::encode(&bytes, mime_type))
}

fn location_label(location: &str) -> &str {
    if location.starts_with("data:") {
        "inline attachment"
    } else {
        location
    }
}

/// Picks the model for a request
///
/// Any user message carrying media switches to the vision model.
pub fn select_model<'a>(
    messages: &[RequestMessage],
    default_model: &'a str,
    vision_model: &'a str,
) -> &'a str {
    if messages
        .iter()
        .any(|m| m.role == "user" && m.has_media())
    {
        vision_model
    } else {
        default_model
    }
}

/// Assembles the streaming request body
pub fn build_request(
    model: &str,
    messages: Vec<RequestMessage>,
    params: &GenerationParams,
    tools: &[ToolDefinition],
) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages,
        temperature: params.temperature,
        top_p: params.top_p,
        max_tokens: params.max_output_tokens,
        top_k: params.top_k,
        reasoning: params
            .thinking_budget
            .map(|max_tokens| ReasoningConfig { max_tokens }),
        stream: true,
        stream_options: Some(StreamOptions {
            include_usage: true,
        }),
        tools: if tools.is_empty() {
            None
        } else {
            Some(tools.to_vec())
        },
        tool_choice: if tools.is_empty() {
            None
        } else {
            Some("auto".to_string())
        },
    }
}
