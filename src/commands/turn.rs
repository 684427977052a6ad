//! Streamed turns from the command line
//!
//! Reply text is written to stdout as it arrives; everything else goes to
//! stderr. Ctrl-C stops the turn and keeps whatever was received.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use colored::Colorize;

use crate::commands::history::{branch_indicator, find_message};
use crate::commands::require_conversation;
use crate::config::Config;
use crate::conversation::{tree, Conversation, MediaRef, Message, Role};
use crate::error::{ForkchatError, Result};
use crate::media::store::mime_from_path;
use crate::media::{FsMediaStore, MediaSideChannel, MediaStore};
use crate::providers::create_provider;
use crate::session::{SessionSettings, SessionState, StreamingSession, TurnOutcome};
use crate::storage::{Persistence, SqliteStorage};
use crate::tools::ToolRegistry;

/// Sends a user message and streams the reply
pub async fn send(
    config: &Config,
    storage: Arc<SqliteStorage>,
    conversation_id: &str,
    text: String,
    image: Option<&Path>,
) -> Result<()> {
    let conversation = require_conversation(&storage, conversation_id)?;
    let messages = storage.list_messages(&conversation.id).await?;
    let branch: Vec<Message> = tree::active_branch(&messages).into_iter().cloned().collect();

    let session = build_session(config, conversation, Arc::clone(&storage))?;
    match image {
        Some(path) => {
            let media = import_attachment(config, path).await?;
            session.start_with_attachment(&branch, text, media).await?;
        }
        None => {
            session.start(&branch, Some(text)).await?;
        }
    }

    let outcome = stream_reply(&session).await?;
    finish_turn(&storage, session.conversation(), &outcome).await
}

/// Streams a new sibling reply to the last user message
pub async fn regenerate(
    config: &Config,
    storage: Arc<SqliteStorage>,
    conversation_id: &str,
) -> Result<()> {
    let conversation = require_conversation(&storage, conversation_id)?;
    let messages = storage.list_messages(&conversation.id).await?;
    let branch: Vec<Message> = tree::active_branch(&messages).into_iter().cloned().collect();
    let context = tree::regenerate_context(&branch).ok_or_else(|| {
        ForkchatError::NotFound(format!("user message in conversation {}", conversation.id))
    })?;

    let session = build_session(config, conversation, Arc::clone(&storage))?;
    session.start(context, None).await?;

    let outcome = stream_reply(&session).await?;
    finish_turn(&storage, session.conversation(), &outcome).await
}

/// Forks a user message with new text and streams a reply to the fork
pub async fn edit(
    config: &Config,
    storage: Arc<SqliteStorage>,
    message_id: &str,
    text: String,
) -> Result<()> {
    let original = find_message(&storage, message_id)?;
    if original.role != Role::User {
        return Err(ForkchatError::Config(format!(
            "only user messages can be edited, {} is a {} message",
            message_id, original.role
        ))
        .into());
    }

    let conversation = require_conversation(&storage, &original.conversation_id)?;
    let messages = storage.list_messages(&conversation.id).await?;
    let mut context = match &original.parent_id {
        Some(parent_id) => path_to(parent_id, &messages),
        None => Vec::new(),
    };

    let fork = tree::fork_user_message(&original, text);
    storage.add_message(&fork).await?;
    eprintln!("{} {}", "Edited as".dimmed(), crate::commands::short_id(&fork.id).cyan());
    context.push(fork);

    let session = build_session(config, conversation, Arc::clone(&storage))?;
    session.start(&context, None).await?;

    let outcome = stream_reply(&session).await?;
    finish_turn(&storage, session.conversation(), &outcome).await
}

/// Root-to-`message_id` path, following parent links
fn path_to(message_id: &str, messages: &[Message]) -> Vec<Message> {
    let mut path = Vec::new();
    let mut current = Some(message_id.to_string());
    while let Some(id) = current {
        let Some(message) = messages.iter().find(|m| m.id == id) else {
            break;
        };
        if path.iter().any(|m: &Message| m.id == message.id) {
            break;
        }
        current = message.parent_id.clone();
        path.push(message.clone());
    }
    path.reverse();
    path
}

/// Wires a session from configuration
pub fn build_session(
    config: &Config,
    conversation: Conversation,
    storage: Arc<SqliteStorage>,
) -> Result<StreamingSession> {
    let provider = create_provider(&config.provider)?;
    let local: Arc<dyn MediaStore> =
        Arc::new(FsMediaStore::new(config.media.resolve_local_dir()?));
    let media = MediaSideChannel::new()
        .with_local(local)
        .with_job_policy(config.media.job_policy());

    Ok(StreamingSession::new(conversation, provider, storage)
        .with_tools(ToolRegistry::builtin(&config.tools))
        .with_media(media)
        .with_settings(SessionSettings::from_config(config)))
}

/// Copies an attachment into the local media store
async fn import_attachment(config: &Config, path: &Path) -> Result<MediaRef> {
    let location = path.to_string_lossy().to_string();
    let mime_type = mime_from_path(&location);
    if !mime_type.starts_with("image/") {
        return Err(ForkchatError::Media(format!(
            "unsupported attachment type {} for {}",
            mime_type, location
        ))
        .into());
    }

    let store = FsMediaStore::new(config.media.resolve_local_dir()?);
    let bytes = store
        .download(&location, config.media.limits().for_mime(mime_type))
        .await?;
    let stored = store.upload(&bytes, mime_type).await?;
    tracing::debug!(source = %location, stored = %stored, "Attachment imported");
    Ok(MediaRef::new(stored, mime_type))
}

/// Prints reply text as it streams; Ctrl-C stops the turn
pub async fn stream_reply(session: &StreamingSession) -> Result<TurnOutcome> {
    let mut snapshots = session.subscribe();
    let mut printed = 0usize;
    let mut stdout = std::io::stdout();

    let wait = session.wait();
    tokio::pin!(wait);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ctrl_c_armed = true;

    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            signal = &mut ctrl_c, if ctrl_c_armed => {
                if let Err(e) = signal {
                    tracing::warn!("Ctrl-C handler unavailable: {}", e);
                    ctrl_c_armed = false;
                    continue;
                }
                eprintln!("\n{}", "Stopping...".yellow());
                break session.stop().await;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break (&mut wait).await;
                }
                let text = snapshots
                    .borrow_and_update()
                    .in_flight
                    .as_ref()
                    .map(|m| m.text.clone());
                if let Some(text) = text {
                    print_suffix(&mut stdout, &text, &mut printed)?;
                }
            }
        }
    };

    let outcome = outcome
        .ok_or_else(|| ForkchatError::Provider("turn ended without an outcome".into()))?;
    if let Some(message) = &outcome.message {
        print_suffix(&mut stdout, &message.text, &mut printed)?;
        if let Some(media) = &message.media {
            println!();
            println!("{} {} {}", "media:".dimmed(), media.mime_type, media.url);
        }
    }
    println!();
    Ok(outcome)
}

fn print_suffix(stdout: &mut std::io::Stdout, text: &str, printed: &mut usize) -> Result<()> {
    if let Some(rest) = text.get(*printed..) {
        if !rest.is_empty() {
            stdout.write_all(rest.as_bytes())?;
            stdout.flush()?;
            *printed = text.len();
        }
    }
    Ok(())
}

/// Reports the outcome and auto-titles the conversation after its first
/// completed turn
async fn finish_turn(
    storage: &SqliteStorage,
    conversation: &Conversation,
    outcome: &TurnOutcome,
) -> Result<()> {
    if let Some(error) = &outcome.error {
        eprintln!("{} {}", "warning:".yellow().bold(), error);
    }

    match outcome.state {
        SessionState::Cancelled => {
            let note = if outcome.persisted {
                "Stopped; partial reply saved."
            } else {
                "Stopped; nothing to save."
            };
            eprintln!("{}", note.yellow());
        }
        SessionState::Failed => {
            return Err(ForkchatError::Provider(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "turn failed".to_string()),
            )
            .into());
        }
        _ => {}
    }

    let messages = storage.list_messages(&conversation.id).await?;
    if let Some(message) = &outcome.message {
        if outcome.persisted {
            let (index, count) = tree::branch_info(message, &messages);
            if count > 1 {
                eprintln!("{}", branch_indicator(index, count).dimmed());
            }
        }
    }

    if outcome.state == SessionState::Idle && conversation.needs_title() {
        let first_user_text = tree::active_branch(&messages)
            .into_iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.clone());
        if let Some(text) = first_user_text {
            let mut conversation = conversation.clone();
            if conversation.apply_auto_title(&text) {
                storage.save_conversation(&conversation)?;
                tracing::info!(title = %conversation.title, "Conversation titled");
            }
        }
    }

    Ok(())
}
