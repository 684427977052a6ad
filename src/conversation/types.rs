//! Conversation and message data model
//!
//! Messages form a tree through `parent_id`. A message with no parent is a
//! root. Siblings share a parent *and* a role; they are the alternative
//! (regenerated or forked) turns at one point of the conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ForkchatError, Result};

/// Title given to conversations before one is generated
pub const DEFAULT_TITLE: &str = "New chat";

/// Maximum length (in characters) of an auto-generated title
const MAX_TITLE_CHARS: usize = 48;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Typed by the person using the app
    User,
    /// Produced by the language model
    Model,
    /// Result of a tool invocation
    Tool,
}

impl Role {
    /// Storage name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        }
    }

    /// Role name used on the chat-completions wire
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::conversation::Role;
    ///
    /// assert_eq!(Role::Model.wire_name(), "assistant");
    /// assert_eq!(Role::User.wire_name(), "user");
    /// ```
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ForkchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "model" | "assistant" => Ok(Self::Model),
            "tool" => Ok(Self::Tool),
            other => Err(ForkchatError::Storage(format!("unknown role: {}", other))),
        }
    }
}

/// Reference to media attached to a message
///
/// `url` is an `http(s)://` or `file://` URL, a filesystem path, or a
/// self-contained `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Location of the media payload
    pub url: String,
    /// MIME type, e.g. `image/png`
    pub mime_type: String,
}

impl MediaRef {
    /// Creates a new media reference
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Whether the payload is embedded in the reference itself
    pub fn is_data_uri(&self) -> bool {
        self.url.starts_with("data:")
    }
}

/// Token usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub input: u64,
    /// Completion tokens
    pub output: u64,
    /// Prompt tokens served from the provider's cache
    pub cached: u64,
}

impl Usage {
    /// Creates a new usage record
    pub fn new(input: u64, output: u64, cached: u64) -> Self {
        Self {
            input,
            output,
            cached,
        }
    }

    /// Adds another usage record onto this one
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::conversation::Usage;
    ///
    /// let mut total = Usage::new(10, 5, 0);
    /// total.add(&Usage::new(3, 2, 1));
    /// assert_eq!(total, Usage::new(13, 7, 1));
    /// ```
    pub fn add(&mut self, other: &Usage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.cached = self.cached.saturating_add(other.cached);
    }
}

/// A complete tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call identifier
    pub id: String,
    /// Name of the tool to run
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

/// A single node of the conversation tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Author of the message
    pub role: Role,
    /// Text content; append-only while streaming
    pub text: String,
    /// Parent message; `None` marks a root
    pub parent_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set by an explicit branch switch; wins over `created_at` when choosing
    /// the active child
    pub selected_at: Option<DateTime<Utc>>,
    /// Attached or generated media
    pub media: Option<MediaRef>,
    /// Reasoning ("thinking") text
    pub thinking: Option<String>,
    /// Token accounting
    pub usage: Option<Usage>,
    /// Tool calls issued while producing this message
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Originating call id for tool-role messages
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(
        conversation_id: impl Into<String>,
        role: Role,
        parent_id: Option<String>,
        text: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            text,
            parent_id,
            created_at: Utc::now(),
            selected_at: None,
            media: None,
            thinking: None,
            usage: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Creates a user message
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::conversation::{Message, Role};
    ///
    /// let msg = Message::user("conv-1", None, "Hello");
    /// assert_eq!(msg.role, Role::User);
    /// assert!(msg.parent_id.is_none());
    /// ```
    pub fn user(
        conversation_id: impl Into<String>,
        parent_id: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(conversation_id, Role::User, parent_id, text.into())
    }

    /// Creates an empty model message, ready to receive streamed content
    pub fn model(conversation_id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::new(conversation_id, Role::Model, parent_id, String::new())
    }

    /// Creates a tool-result message
    pub fn tool_result(
        conversation_id: impl Into<String>,
        parent_id: Option<String>,
        tool_call_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(conversation_id, Role::Tool, parent_id, text.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Attaches media to the message
    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    /// The key used to pick the active child: `selected_at ?? created_at`
    pub fn branch_key(&self) -> DateTime<Utc> {
        self.selected_at.unwrap_or(self.created_at)
    }

    /// Appends a text delta
    pub fn append_text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Appends a reasoning delta
    pub fn append_thinking(&mut self, delta: &str) {
        self.thinking
            .get_or_insert_with(String::new)
            .push_str(delta);
    }

    /// Adds usage counters onto the message
    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.get_or_insert_with(Usage::default).add(usage);
    }

    /// Whether the message is worth persisting
    ///
    /// True for non-empty trimmed text, attached media, or non-empty
    /// reasoning text.
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::conversation::Message;
    ///
    /// let mut msg = Message::model("conv-1", None);
    /// assert!(!msg.has_persistable_content());
    /// msg.append_text("  \n");
    /// assert!(!msg.has_persistable_content());
    /// msg.append_text("partial");
    /// assert!(msg.has_persistable_content());
    /// ```
    pub fn has_persistable_content(&self) -> bool {
        !self.text.trim().is_empty()
            || self.media.is_some()
            || self
                .thinking
                .as_deref()
                .map(|t| !t.trim().is_empty())
                .unwrap_or(false)
    }
}

/// Sampling parameters sent with every request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus sampling mass
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Top-k sampling; omitted from requests when unset
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Upper bound on generated tokens
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Token budget for reasoning models
    #[serde(default)]
    pub thinking_budget: Option<u32>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    0.95
}

fn default_max_output_tokens() -> u32 {
    8192
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            max_output_tokens: default_max_output_tokens(),
            thinking_budget: None,
        }
    }
}

/// Optional model-side capabilities enabled for a conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggles {
    /// Allow web search tools
    #[serde(default)]
    pub web_search: bool,
    /// Allow code execution tools
    #[serde(default)]
    pub code_execution: bool,
    /// Allow fetching URL contents
    #[serde(default)]
    pub url_context: bool,
}

/// A feature that gates whether a tool is advertised to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Web search
    WebSearch,
    /// Code execution
    CodeExecution,
    /// URL context fetching
    UrlContext,
}

impl FeatureToggles {
    /// Whether a feature is switched on
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::WebSearch => self.web_search,
            Feature::CodeExecution => self.code_execution,
            Feature::UrlContext => self.url_context,
        }
    }
}

/// Conversation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation identifier
    pub id: String,
    /// Display title
    pub title: String,
    /// Model identifier used for text-only turns
    pub model: String,
    /// Sampling parameters
    #[serde(default)]
    pub params: GenerationParams,
    /// Feature toggles
    #[serde(default)]
    pub features: FeatureToggles,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates a conversation with default parameters and title
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            model: model.into(),
            params: GenerationParams::default(),
            features: FeatureToggles::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the title still has to be generated
    pub fn needs_title(&self) -> bool {
        let title = self.title.trim();
        title.is_empty() || title == DEFAULT_TITLE
    }

    /// Derives a title from the first user message
    ///
    /// Uses the first non-empty line, collapses whitespace and cuts at a
    /// word boundary.
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::conversation::Conversation;
    ///
    /// assert_eq!(
    ///     Conversation::suggest_title("  How do   lifetimes work?\nMore text"),
    ///     Some("How do lifetimes work?".to_string())
    /// );
    /// assert_eq!(Conversation::suggest_title("   "), None);
    /// ```
    pub fn suggest_title(first_user_text: &str) -> Option<String> {
        let line = first_user_text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())?;
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

        if collapsed.chars().count() <= MAX_TITLE_CHARS {
            return Some(collapsed);
        }

        let cut: String = collapsed.chars().take(MAX_TITLE_CHARS).collect();
        let head = match cut.rfind(' ') {
            Some(pos) if pos > 0 => &cut[..pos],
            _ => cut.as_str(),
        };
        Some(format!("{}…", head.trim_end()))
    }

    /// Applies an auto-generated title if none has been set yet
    ///
    /// Returns `true` when the title changed.
    pub fn apply_auto_title(&mut self, first_user_text: &str) -> bool {
        if !self.needs_title() {
            return false;
        }
        match Self::suggest_title(first_user_text) {
            Some(title) => {
                self.title = title;
                self.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Validates parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(ForkchatError::Config("conversation model is empty".into()).into());
        }
        if !(0.0..=2.0).contains(&self.params.temperature) {
            return Err(ForkchatError::Config(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.params.temperature
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&self.params.top_p) {
            return Err(ForkchatError::Config(format!(
                "top_p must be within 0.0..=1.0, got {}",
                self.params.top_p
            ))
            .into());
        }
        if self.params.max_output_tokens == 0 {
            return Err(
                ForkchatError::Config("max_output_tokens must be greater than 0".into()).into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::User, Role::Model, Role::Tool] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Model);
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Model).unwrap(), "\"model\"");
    }

    #[test]
    fn test_branch_key_prefers_selected_at() {
        let mut msg = Message::model("c", None);
        assert_eq!(msg.branch_key(), msg.created_at);
        let later = msg.created_at + chrono::Duration::seconds(5);
        msg.selected_at = Some(later);
        assert_eq!(msg.branch_key(), later);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut msg = Message::model("c", None);
        msg.add_usage(&Usage::new(100, 20, 10));
        msg.add_usage(&Usage::new(50, 5, 0));
        assert_eq!(msg.usage, Some(Usage::new(150, 25, 10)));
    }

    #[test]
    fn test_usage_add_saturates() {
        let mut usage = Usage::new(u64::MAX, 0, 0);
        usage.add(&Usage::new(1, 1, 1));
        assert_eq!(usage.input, u64::MAX);
    }

    #[test]
    fn test_persistable_content_media_only() {
        let msg = Message::model("c", None).with_media(MediaRef::new("file:///a.png", "image/png"));
        assert!(msg.has_persistable_content());
    }

    #[test]
    fn test_persistable_content_thinking_only() {
        let mut msg = Message::model("c", None);
        msg.append_thinking("considering");
        assert!(msg.has_persistable_content());
    }

    #[test]
    fn test_tool_result_sets_call_id() {
        let msg = Message::tool_result("c", Some("p".into()), "call_1", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_suggest_title_truncates_on_word_boundary() {
        let text = "Please explain the difference between borrowing and moving values in detail";
        let title = Conversation::suggest_title(text).unwrap();
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= MAX_TITLE_CHARS + 1);
        assert!(!title.contains("  "));
        assert!(text.starts_with(title.trim_end_matches('…')));
    }

    #[test]
    fn test_apply_auto_title_only_once() {
        let mut conv = Conversation::new("gpt-4o-mini");
        assert!(conv.needs_title());
        assert!(conv.apply_auto_title("First question"));
        assert_eq!(conv.title, "First question");
        assert!(!conv.apply_auto_title("Second question"));
        assert_eq!(conv.title, "First question");
    }

    #[test]
    fn test_conversation_validate_rejects_bad_temperature() {
        let mut conv = Conversation::new("m");
        conv.params.temperature = 3.5;
        assert!(conv.validate().is_err());
        conv.params.temperature = 0.7;
        assert!(conv.validate().is_ok());
    }

    #[test]
    fn test_feature_toggles() {
        let toggles = FeatureToggles {
            url_context: true,
            ..Default::default()
        };
        assert!(toggles.is_enabled(Feature::UrlContext));
        assert!(!toggles.is_enabled(Feature::WebSearch));
    }
}
