/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `history`: create, list, show, switch and delete
- `turn`: send, regenerate and edit, streaming replies to stdout

Handlers own no state of their own; they open the configured storage and
drive the library components.
*/

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::conversation::Conversation;
use crate::error::{ForkchatError, Result};
use crate::storage::SqliteStorage;
use std::sync::Arc;

pub mod history;
pub mod turn;

/// Runs the parsed command against the loaded configuration
pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let storage = Arc::new(open_storage(&config)?);
    tracing::debug!(db = %storage.path().display(), "Storage opened");

    match cli.command {
        Commands::New {
            title,
            model,
            url_context,
        } => {
            history::create_conversation(&storage, &config, title, model, url_context)?;
        }
        Commands::List => history::list_conversations(&storage)?,
        Commands::Show { conversation } => {
            history::show_conversation(&storage, &conversation).await?
        }
        Commands::Switch { message, direction } => {
            history::switch_message(&storage, &message, direction.into()).await?
        }
        Commands::Delete { message } => history::delete_message(&storage, &message).await?,
        Commands::Send {
            conversation,
            text,
            image,
        } => {
            turn::send(&config, storage, &conversation, text, image.as_deref()).await?;
        }
        Commands::Regenerate { conversation } => {
            turn::regenerate(&config, storage, &conversation).await?;
        }
        Commands::Edit { message, text } => {
            turn::edit(&config, storage, &message, text).await?;
        }
    }

    Ok(())
}

/// Opens the configured database, or the default one
pub fn open_storage(config: &Config) -> Result<SqliteStorage> {
    match &config.storage.db_path {
        Some(path) => SqliteStorage::new_with_path(path),
        None => SqliteStorage::new(),
    }
}

/// Loads a conversation by id or unique prefix
pub(crate) fn require_conversation(storage: &SqliteStorage, id: &str) -> Result<Conversation> {
    storage
        .load_conversation(id)?
        .ok_or_else(|| ForkchatError::NotFound(format!("conversation {}", id)).into())
}

/// First eight characters of an id, for display
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_open_storage_uses_configured_path() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.db_path = Some(dir.path().join("nested").join("chat.db"));
        let storage = open_storage(&config).unwrap();
        assert_eq!(storage.path(), dir.path().join("nested").join("chat.db"));
    }

    #[test]
    fn test_require_conversation_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::new_with_path(dir.path().join("chat.db")).unwrap();
        let err = require_conversation(&storage, "missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::NotFound(_))
        ));
    }
}
