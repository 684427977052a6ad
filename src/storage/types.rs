use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::Message;

/// Summary row for a stored conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Unique identifier for the conversation
    pub id: String,
    /// User-friendly title
    pub title: String,
    /// The model used for text-only turns
    pub model: String,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// When the conversation was last updated
    pub updated_at: DateTime<Utc>,
    /// Number of stored messages across all branches
    pub message_count: usize,
}

/// Change notification emitted by a [`super::Persistence`] implementation
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// A message was inserted
    Added(Message),
    /// A message was overwritten
    Updated(Message),
    /// Messages were removed
    Deleted(Vec<String>),
}

impl StoreChange {
    /// Conversation the change belongs to, when known
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            StoreChange::Added(m) | StoreChange::Updated(m) => Some(&m.conversation_id),
            StoreChange::Deleted(_) => None,
        }
    }
}
