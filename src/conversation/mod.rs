//! Conversation data model and branch navigation
//!
//! - `types`: conversations, messages, roles, media references, usage
//! - `tree`: active-branch derivation, sibling queries, branch switching and
//!   subtree collection over a flat message set

pub mod tree;
pub mod types;

pub use tree::Direction;
pub use types::{
    Conversation, Feature, FeatureToggles, GenerationParams, MediaRef, Message, Role, ToolCall,
    Usage, DEFAULT_TITLE,
};
