use crate::commands::{require_conversation, short_id};
use crate::config::Config;
use crate::conversation::{tree, Conversation, Direction, MediaRef, Message, Role};
use crate::error::{ForkchatError, Result};
use crate::storage::{Persistence, SqliteStorage};
use colored::Colorize;
use prettytable::{format, Table};

/// Creates a conversation and prints its id
pub fn create_conversation(
    storage: &SqliteStorage,
    config: &Config,
    title: Option<String>,
    model: Option<String>,
    url_context: bool,
) -> Result<Conversation> {
    let mut conversation = Conversation::new(model.unwrap_or_else(|| config.provider.model.clone()));
    if let Some(title) = title {
        conversation.title = title;
    }
    conversation.features.url_context = url_context;
    conversation.validate()?;

    storage.save_conversation(&conversation)?;
    tracing::info!(conversation_id = %conversation.id, "Conversation created");
    println!("{}", conversation.id);
    Ok(conversation)
}

/// Prints a table of stored conversations
pub fn list_conversations(storage: &SqliteStorage) -> Result<()> {
    let conversations = storage.list_conversations()?;

    if conversations.is_empty() {
        println!("{}", "No conversations found.".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

    table.add_row(prettytable::row![
        "ID".bold(),
        "Title".bold(),
        "Model".bold(),
        "Messages".bold(),
        "Last Updated".bold()
    ]);

    for conversation in conversations {
        let title = if conversation.title.chars().count() > 40 {
            format!("{}...", conversation.title.chars().take(37).collect::<String>())
        } else {
            conversation.title
        };
        let updated = conversation.updated_at.format("%Y-%m-%d %H:%M").to_string();

        table.add_row(prettytable::row![
            short_id(&conversation.id).cyan(),
            title,
            conversation.model,
            conversation.message_count,
            updated
        ]);
    }

    table.printstd();
    Ok(())
}

/// Prints the active branch of a conversation
pub async fn show_conversation(storage: &SqliteStorage, id: &str) -> Result<()> {
    let conversation = require_conversation(storage, id)?;
    let messages = storage.list_messages(&conversation.id).await?;

    println!(
        "{} {}",
        conversation.title.bold(),
        format!("({}, {})", short_id(&conversation.id), conversation.model).dimmed()
    );

    let branch = tree::active_branch(&messages);
    if branch.is_empty() {
        println!("{}", "No messages yet.".yellow());
        return Ok(());
    }

    for message in branch {
        print_message(message, &messages);
    }
    Ok(())
}

fn print_message(message: &Message, all: &[Message]) {
    let role = match message.role {
        Role::User => "you".green().bold(),
        Role::Model => "model".cyan().bold(),
        Role::Tool => "tool".magenta().bold(),
    };
    let (index, count) = tree::branch_info(message, all);
    let mut header = format!("{} {}", role, short_id(&message.id).dimmed());
    if count > 1 {
        header.push_str(&format!("  {}", branch_indicator(index, count).yellow()));
    }

    println!();
    println!("{}", header);
    if let Some(thinking) = message.thinking.as_deref().filter(|t| !t.trim().is_empty()) {
        println!("{}", thinking.trim().dimmed().italic());
    }
    if !message.text.is_empty() {
        println!("{}", message.text);
    }
    if let Some(media) = &message.media {
        println!("{} {}", "media:".dimmed(), media_label(media));
    }
    if let Some(usage) = message.usage {
        println!(
            "{}",
            format!(
                "tokens: {} in / {} out ({} cached)",
                usage.input, usage.output, usage.cached
            )
            .dimmed()
        );
    }
}

/// "n / m" indicator for a message with siblings
pub(crate) fn branch_indicator(index: usize, count: usize) -> String {
    format!("< {} / {} >", index, count)
}

fn media_label(media: &MediaRef) -> String {
    if media.is_data_uri() {
        format!("{} (inline, {} bytes encoded)", media.mime_type, media.url.len())
    } else {
        format!("{} {}", media.mime_type, media.url)
    }
}

/// Moves a message's branch to its previous or next sibling
pub async fn switch_message(storage: &SqliteStorage, id: &str, direction: Direction) -> Result<()> {
    let message = find_message(storage, id)?;
    if message.parent_id.is_none() {
        println!(
            "{}",
            "Root messages cannot be switched; the newest root is always active.".yellow()
        );
        return Ok(());
    }
    let mut messages = storage.list_messages(&message.conversation_id).await?;

    let Some(selected_id) = tree::switch_branch(&mut messages, &message.id, direction) else {
        println!("{}", "No sibling in that direction.".yellow());
        return Ok(());
    };

    let selected = messages
        .iter()
        .find(|m| m.id == selected_id)
        .ok_or_else(|| ForkchatError::NotFound(format!("message {}", selected_id)))?;
    storage.update_message(selected).await?;

    let (index, count) = tree::branch_info(selected, &messages);
    println!(
        "Switched to {} {}",
        short_id(&selected.id).cyan(),
        branch_indicator(index, count)
    );
    Ok(())
}

/// Deletes a message and everything below it
pub async fn delete_message(storage: &SqliteStorage, id: &str) -> Result<()> {
    let message = find_message(storage, id)?;
    let messages = storage.list_messages(&message.conversation_id).await?;
    let ids = tree::subtree_ids(&message.id, &messages);

    storage.delete_messages(&ids).await?;
    tracing::info!(message_id = %message.id, count = ids.len(), "Deleted subtree");
    println!("{}", format!("Deleted {} message(s)", ids.len()).green());
    Ok(())
}

pub(crate) fn find_message(storage: &SqliteStorage, id: &str) -> Result<Message> {
    storage
        .find_message(id)?
        .ok_or_else(|| ForkchatError::NotFound(format!("message {}", id)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn storage() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::new_with_path(dir.path().join("chat.db")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_create_conversation_applies_options() {
        let (_dir, storage) = storage();
        let config = Config::default();
        let created = create_conversation(
            &storage,
            &config,
            Some("Rust questions".into()),
            Some("local-model".into()),
            true,
        )
        .unwrap();

        let loaded = storage.load_conversation(&created.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Rust questions");
        assert_eq!(loaded.model, "local-model");
        assert!(loaded.features.url_context);
    }

    #[test]
    fn test_create_conversation_defaults_to_configured_model() {
        let (_dir, storage) = storage();
        let config = Config::default();
        let created = create_conversation(&storage, &config, None, None, false).unwrap();
        assert_eq!(created.model, config.provider.model);
        assert!(created.needs_title());
    }

    #[tokio::test]
    async fn test_switch_message_persists_selection() {
        let (_dir, storage) = storage();
        let conversation = Conversation::new("m");
        storage.save_conversation(&conversation).unwrap();

        let now = Utc::now();
        let user = Message::user(&conversation.id, None, "hi");
        let mut older = Message::model(&conversation.id, Some(user.id.clone()));
        older.created_at = now - Duration::seconds(10);
        older.append_text("first");
        let mut newer = Message::model(&conversation.id, Some(user.id.clone()));
        newer.created_at = now - Duration::seconds(5);
        newer.append_text("second");
        for m in [&user, &older, &newer] {
            storage.add_message(m).await.unwrap();
        }

        switch_message(&storage, &newer.id, Direction::Previous)
            .await
            .unwrap();

        let messages = storage.list_messages(&conversation.id).await.unwrap();
        let branch = tree::active_branch(&messages);
        assert_eq!(branch.last().unwrap().id, older.id);
    }

    #[tokio::test]
    async fn test_switch_past_last_sibling_is_noop() {
        let (_dir, storage) = storage();
        let conversation = Conversation::new("m");
        storage.save_conversation(&conversation).unwrap();
        let user = Message::user(&conversation.id, None, "hi");
        storage.add_message(&user).await.unwrap();

        switch_message(&storage, &user.id, Direction::Next)
            .await
            .unwrap();
        let stored = storage.find_message(&user.id).unwrap().unwrap();
        assert!(stored.selected_at.is_none());
    }

    #[tokio::test]
    async fn test_delete_message_removes_subtree() {
        let (_dir, storage) = storage();
        let conversation = Conversation::new("m");
        storage.save_conversation(&conversation).unwrap();

        let root = Message::user(&conversation.id, None, "hi");
        let reply = Message::model(&conversation.id, Some(root.id.clone()));
        let follow_up = Message::user(&conversation.id, Some(reply.id.clone()), "more");
        let other = Message::user(&conversation.id, None, "separate root");
        for m in [&root, &reply, &follow_up, &other] {
            storage.add_message(m).await.unwrap();
        }

        delete_message(&storage, &reply.id).await.unwrap();

        let remaining: Vec<String> = storage
            .list_messages(&conversation.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&root.id));
        assert!(remaining.contains(&other.id));
    }

    #[tokio::test]
    async fn test_unknown_message_is_not_found() {
        let (_dir, storage) = storage();
        let err = delete_message(&storage, "nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::NotFound(_))
        ));
    }

    #[test]
    fn test_branch_indicator() {
        assert_eq!(branch_indicator(2, 3), "< 2 / 3 >");
    }
}
