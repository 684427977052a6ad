//! Provider module for Forkchat
//!
//! This module contains the outgoing wire format, the [`Provider`]
//! abstraction and the OpenAI-compatible streaming implementation.

pub mod base;
pub mod openai;

pub use base::{
    validate_message_sequence, ByteStream, ChatRequest, ContentPart, FunctionCall, ImageUrl,
    MessageContent, Provider, ReasoningConfig, RequestMessage, StreamOptions, ToolDefinition,
    WireToolCall,
};
pub use openai::OpenAiProvider;

use std::sync::Arc;

use crate::auth::{ChainedTokenProvider, TokenProvider};
use crate::config::ProviderConfig;
use crate::error::Result;

/// Create the configured provider
///
/// The bearer token is read from `config.token_env`, falling back to the
/// `config.keyring_service` keyring entry.
///
/// # Errors
///
/// Returns error if provider initialization fails
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    let tokens: Arc<dyn TokenProvider> = Arc::new(ChainedTokenProvider::env_then_keyring(
        &config.token_env,
        &config.keyring_service,
    ));
    Ok(Arc::new(OpenAiProvider::new(config, tokens)?))
}
