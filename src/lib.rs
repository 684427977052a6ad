//! Forkchat - streaming chat engine with branching history
//!
//! This library streams model replies from an OpenAI-compatible endpoint
//! into a conversation tree where regenerated and edited turns live side by
//! side as sibling branches.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `conversation`: Messages, conversations and branch navigation
//! - `stream`: Server-sent-event decoding and tool-call reassembly
//! - `session`: The streaming turn state machine
//! - `providers`: Outgoing wire format and the streaming HTTP client
//! - `media`: Generated media persistence and generation-job polling
//! - `storage`: Persistence collaborator (SQLite and in-memory)
//! - `tools`: Tool registry and built-in tools
//! - `auth`: Bearer token providers
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use forkchat::{Config, Conversation, StreamingSession};
//! use forkchat::providers::create_provider;
//! use forkchat::storage::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let provider = create_provider(&config.provider)?;
//!     let session = StreamingSession::new(
//!         Conversation::new(&config.provider.model),
//!         provider,
//!         Arc::new(MemoryStore::new()),
//!     );
//!     session.start(&[], Some("Hello!".to_string())).await?;
//!     if let Some(outcome) = session.wait().await {
//!         println!("{}", outcome.message.map(|m| m.text).unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod error;
pub mod media;
pub mod providers;
pub mod session;
pub mod storage;
pub mod stream;
pub mod tools;

// Re-export commonly used types
pub use config::Config;
pub use conversation::{Conversation, Message, Role};
pub use error::{ForkchatError, Result};
pub use session::{SessionSnapshot, SessionState, StreamingSession, TurnOutcome};
pub use storage::{MemoryStore, Persistence, SqliteStorage};

#[cfg(test)]
pub mod test_utils;
