//! Conversation and message persistence
//!
//! [`Persistence`] is the collaborator the streaming session writes
//! through. [`SqliteStorage`] is the on-disk implementation used by the CLI;
//! [`MemoryStore`] keeps everything in memory.

use crate::conversation::{Conversation, Message};
use crate::error::{ForkchatError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

pub mod memory;
pub mod types;
pub use memory::MemoryStore;
pub use types::{ConversationSummary, StoreChange};

/// Buffered change notifications per subscriber
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Persistence collaborator
///
/// All operations may fail; callers treat failures as non-fatal to their
/// in-memory state.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Inserts a new message
    async fn add_message(&self, message: &Message) -> Result<()>;

    /// Overwrites an existing message
    async fn update_message(&self, message: &Message) -> Result<()>;

    /// Removes messages by id; unknown ids are ignored
    async fn delete_messages(&self, ids: &[String]) -> Result<()>;

    /// All messages of a conversation, every branch, oldest first
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Subscribes to change notifications
    fn listen(&self) -> broadcast::Receiver<StoreChange>;
}

/// Default application data directory
pub fn data_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("dev", "forkchat", "forkchat")
        .ok_or_else(|| ForkchatError::Storage("Could not determine data directory".into()))?;
    Ok(proj_dirs.data_dir().to_path_buf())
}

fn storage_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> ForkchatError {
    move |e| ForkchatError::Storage(format!("{}: {}", context, e))
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Full ids are matched exactly, anything shorter as a prefix
fn id_pattern(id: &str) -> (&'static str, String) {
    if id.len() == 36 {
        ("=", id.to_string())
    } else {
        ("LIKE", format!("{}%", id))
    }
}

/// SQLite-backed storage
pub struct SqliteStorage {
    db_path: PathBuf,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStorage {
    /// Opens the database in the user's data directory
    ///
    /// `FORKCHAT_DB` overrides the location.
    pub fn new() -> Result<Self> {
        if let Ok(override_path) = std::env::var("FORKCHAT_DB") {
            return Self::new_with_path(override_path);
        }
        Self::new_with_path(data_dir()?.join("forkchat.db"))
    }

    /// Opens (and initializes) the database at `db_path`
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::storage::SqliteStorage;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let storage = SqliteStorage::new_with_path(dir.path().join("chat.db")).unwrap();
    /// assert!(storage.list_conversations().unwrap().is_empty());
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ForkchatError::Storage(format!(
                        "Failed to create parent directory for database: {}",
                        e
                    ))
                })?;
            }
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let storage = Self { db_path, changes };
        storage.init()?;
        Ok(storage)
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(path: &Path) -> Result<Connection> {
        Ok(Connection::open(path).map_err(storage_err("Failed to open database"))?)
    }

    fn init(&self) -> Result<()> {
        let conn = Self::open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                model TEXT NOT NULL,
                params JSON NOT NULL,
                features JSON NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                parent_id TEXT,
                created_at TEXT NOT NULL,
                body JSON NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id);",
        )
        .map_err(storage_err("Failed to create tables"))?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ForkchatError::Storage(format!("storage task failed: {}", e)))?
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    /// Saves or updates a conversation record
    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = Self::open(&self.db_path)?;
        let params_json = serde_json::to_string(&conversation.params)?;
        let features_json = serde_json::to_string(&conversation.features)?;
        conn.execute(
            "INSERT INTO conversations (id, title, model, params, features, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                model = excluded.model,
                params = excluded.params,
                features = excluded.features,
                updated_at = excluded.updated_at",
            params![
                conversation.id,
                conversation.title,
                conversation.model,
                params_json,
                features_json,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )
        .map_err(storage_err("Failed to save conversation"))?;
        Ok(())
    }

    /// Loads a conversation by full id or unique prefix
    pub fn load_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = Self::open(&self.db_path)?;
        let (op, param) = id_pattern(id);
        let query = format!(
            "SELECT id, title, model, params, features, created_at, updated_at
             FROM conversations WHERE id {} ?1 LIMIT 2",
            op
        );

        let mut stmt = conn
            .prepare(&query)
            .map_err(storage_err("Failed to prepare statement"))?;
        let rows = stmt
            .query_map(params![param], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(storage_err("Failed to query conversation"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err("Failed to read conversation"))?;

        if rows.len() > 1 {
            return Err(ForkchatError::Storage(format!("ambiguous conversation id {}", id)).into());
        }
        let Some((id, title, model, params_json, features_json, created, updated)) =
            rows.into_iter().next()
        else {
            return Ok(None);
        };

        Ok(Some(Conversation {
            id,
            title,
            model,
            params: serde_json::from_str(&params_json)?,
            features: serde_json::from_str(&features_json)?,
            created_at: parse_time(&created),
            updated_at: parse_time(&updated),
        }))
    }

    /// Lists all conversations, most recently updated first
    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conn = Self::open(&self.db_path)?;
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.title, c.model, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
                 FROM conversations c
                 ORDER BY c.updated_at DESC",
            )
            .map_err(storage_err("Failed to prepare statement"))?;

        let summaries = stmt
            .query_map([], |row| {
                let created: String = row.get(3)?;
                let updated: String = row.get(4)?;
                let count: i64 = row.get(5)?;
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    model: row.get(2)?,
                    created_at: parse_time(&created),
                    updated_at: parse_time(&updated),
                    message_count: count.max(0) as usize,
                })
            })
            .map_err(storage_err("Failed to query conversations"))?
            .filter_map(|row| match row {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::warn!("Skipping unreadable conversation row: {}", e);
                    None
                }
            })
            .collect();
        Ok(summaries)
    }

    /// Deletes a conversation and all of its messages
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let mut conn = Self::open(&self.db_path)?;
        let tx = conn
            .transaction()
            .map_err(storage_err("Failed to start transaction"))?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])
            .map_err(storage_err("Failed to delete messages"))?;
        tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(storage_err("Failed to delete conversation"))?;
        tx.commit()
            .map_err(storage_err("Failed to commit transaction"))?;
        Ok(())
    }

    /// Finds a message by full id or unique prefix
    pub fn find_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = Self::open(&self.db_path)?;
        let (op, param) = id_pattern(id);
        let query = format!("SELECT body FROM messages WHERE id {} ?1 LIMIT 2", op);
        let mut stmt = conn
            .prepare(&query)
            .map_err(storage_err("Failed to prepare statement"))?;
        let bodies = stmt
            .query_map(params![param], |row| row.get::<_, String>(0))
            .map_err(storage_err("Failed to query message"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err("Failed to read message"))?;

        match bodies.as_slice() {
            [] => Ok(None),
            [body] => Ok(Some(serde_json::from_str(body)?)),
            _ => Err(ForkchatError::Storage(format!("ambiguous message id {}", id)).into()),
        }
    }
}

fn touch_conversation(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), conversation_id],
    )
    .map_err(storage_err("Failed to touch conversation"))?;
    Ok(())
}

#[async_trait]
impl Persistence for SqliteStorage {
    async fn add_message(&self, message: &Message) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let msg = message.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, parent_id, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.parent_id,
                    msg.created_at.to_rfc3339(),
                    body
                ],
            )
            .map_err(storage_err("Failed to insert message"))?;
            touch_conversation(conn, &msg.conversation_id)
        })
        .await?;

        tracing::debug!(message_id = %message.id, "Stored message");
        self.notify(StoreChange::Added(message.clone()));
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let id = message.id.clone();
        let conversation_id = message.conversation_id.clone();
        let changed = self
            .blocking(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE messages SET body = ?1 WHERE id = ?2",
                        params![body, id],
                    )
                    .map_err(storage_err("Failed to update message"))?;
                touch_conversation(conn, &conversation_id)?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(ForkchatError::NotFound(format!("message {}", message.id)).into());
        }
        self.notify(StoreChange::Updated(message.clone()));
        Ok(())
    }

    async fn delete_messages(&self, ids: &[String]) -> Result<()> {
        let owned = ids.to_vec();
        self.blocking(move |conn| {
            let tx = conn
                .transaction()
                .map_err(storage_err("Failed to start transaction"))?;
            for id in &owned {
                tx.execute("DELETE FROM messages WHERE id = ?1", params![id])
                    .map_err(storage_err("Failed to delete message"))?;
            }
            tx.commit()
                .map_err(storage_err("Failed to commit transaction"))?;
            Ok(())
        })
        .await?;

        tracing::debug!(count = ids.len(), "Deleted messages");
        self.notify(StoreChange::Deleted(ids.to_vec()));
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT body FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(storage_err("Failed to prepare statement"))?;
            let bodies = stmt
                .query_map(params![conversation_id], |row| row.get::<_, String>(0))
                .map_err(storage_err("Failed to query messages"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(storage_err("Failed to read messages"))?;

            let mut messages = Vec::with_capacity(bodies.len());
            for body in bodies {
                match serde_json::from_str::<Message>(&body) {
                    Ok(m) => messages.push(m),
                    Err(e) => tracing::warn!("Skipping unreadable message row: {}", e),
                }
            }
            Ok(messages)
        })
        .await
    }

    fn listen(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{tree, Direction};
    use rusqlite::OptionalExtension;
    use serial_test::serial;
    use tempfile::tempdir;

    fn create_test_storage() -> (SqliteStorage, tempfile::TempDir) {
        let dir = tempdir().expect("failed to create tempdir");
        let storage =
            SqliteStorage::new_with_path(dir.path().join("forkchat.db")).expect("create storage");
        (storage, dir)
    }

    fn exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1",
            params![table],
            |_| Ok(true),
        )
        .optional()
        .unwrap()
        .unwrap_or(false)
    }

    #[test]
    fn test_init_creates_tables() {
        let (storage, _dir) = create_test_storage();
        let conn = Connection::open(storage.path()).unwrap();
        assert!(exists(&conn, "conversations"));
        assert!(exists(&conn, "messages"));
    }

    #[test]
    fn test_conversation_roundtrip_and_prefix_lookup() {
        let (storage, _dir) = create_test_storage();
        let mut conv = Conversation::new("gpt-4o-mini");
        conv.params.top_k = Some(40);
        conv.features.url_context = true;
        storage.save_conversation(&conv).unwrap();

        let loaded = storage.load_conversation(&conv.id[..8]).unwrap().unwrap();
        assert_eq!(loaded.id, conv.id);
        assert_eq!(loaded.params.top_k, Some(40));
        assert!(loaded.features.url_context);

        conv.title = "Renamed".into();
        storage.save_conversation(&conv).unwrap();
        let listed = storage.list_conversations().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Renamed");
        assert!(storage.load_conversation("zzzzzzzz").unwrap().is_none());
    }

    #[test]
    fn test_list_conversations_skips_unreadable_rows() {
        let (storage, _dir) = create_test_storage();
        let conv = Conversation::new("m");
        storage.save_conversation(&conv).unwrap();

        let conn = Connection::open(storage.path()).unwrap();
        conn.execute(
            "INSERT INTO conversations (id, title, model, params, features, created_at, updated_at)
             VALUES ('broken', X'00FF', 'm', '{}', '{}', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let listed = storage.list_conversations().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, conv.id);
    }

    #[tokio::test]
    async fn test_messages_persist_branches() {
        let (storage, _dir) = create_test_storage();
        let conv = Conversation::new("m");
        storage.save_conversation(&conv).unwrap();

        let root = Message::user(&conv.id, None, "hi");
        let mut a = Message::model(&conv.id, Some(root.id.clone()));
        a.append_text("first");
        let mut b = Message::model(&conv.id, Some(root.id.clone()));
        b.append_text("second");
        a.created_at = Utc::now() - chrono::Duration::seconds(10);
        b.created_at = Utc::now() - chrono::Duration::seconds(5);

        for m in [&root, &a, &b] {
            storage.add_message(m).await.unwrap();
        }

        let mut messages = storage.list_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 3);
        let active: Vec<String> = tree::active_branch(&messages)
            .iter()
            .map(|m| m.text.clone())
            .collect();
        assert_eq!(active, vec!["hi", "second"]);

        let switched = tree::switch_branch(&mut messages, &b.id, Direction::Previous).unwrap();
        let updated = messages.iter().find(|m| m.id == switched).unwrap().clone();
        storage.update_message(&updated).await.unwrap();

        let reloaded = storage.list_messages(&conv.id).await.unwrap();
        let active: Vec<&str> = tree::active_branch(&reloaded)
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(active, vec!["hi", "first"]);
        assert_eq!(storage.list_conversations().unwrap()[0].message_count, 3);
    }

    #[tokio::test]
    async fn test_delete_and_listen() {
        let (storage, _dir) = create_test_storage();
        let mut rx = storage.listen();
        let msg = Message::user("c", None, "x");
        storage.add_message(&msg).await.unwrap();
        storage.delete_messages(&[msg.id.clone()]).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), StoreChange::Added(_)));
        assert!(matches!(rx.recv().await.unwrap(), StoreChange::Deleted(_)));
        assert!(storage.list_messages("c").await.unwrap().is_empty());
        assert!(storage.find_message(&msg.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_message_is_not_found() {
        let (storage, _dir) = create_test_storage();
        let err = storage
            .update_message(&Message::user("c", None, "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_conversation_removes_messages() {
        let (storage, _dir) = create_test_storage();
        let conv = Conversation::new("m");
        storage.save_conversation(&conv).unwrap();
        let msg = Message::user(&conv.id, None, "x");
        storage.add_message(&msg).await.unwrap();

        storage.delete_conversation(&conv.id).unwrap();
        assert!(storage.load_conversation(&conv.id).unwrap().is_none());
        assert!(storage.list_messages(&conv.id).await.unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_env_override_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.db");
        std::env::set_var("FORKCHAT_DB", &path);
        let storage = SqliteStorage::new().unwrap();
        std::env::remove_var("FORKCHAT_DB");
        assert_eq!(storage.path(), path.as_path());
    }
}
