//! In-memory persistence, for tests and embedding

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex};

use crate::conversation::Message;
use crate::error::{ForkchatError, Result};
use crate::storage::{Persistence, StoreChange, CHANGE_CHANNEL_CAPACITY};

/// Message store backed by a `Vec`
///
/// Writes can be made to fail on demand to exercise error paths.
pub struct MemoryStore {
    messages: Mutex<Vec<Message>>,
    changes: broadcast::Sender<StoreChange>,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            messages: Mutex::new(Vec::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every stored message
    pub async fn all(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ForkchatError::Storage("memory store is read-only".into()).into());
        }
        Ok(())
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn add_message(&self, message: &Message) -> Result<()> {
        self.check_writable()?;
        {
            let mut messages = self.messages.lock().await;
            if messages.iter().any(|m| m.id == message.id) {
                return Err(
                    ForkchatError::Storage(format!("duplicate message id {}", message.id)).into(),
                );
            }
            messages.push(message.clone());
        }
        self.notify(StoreChange::Added(message.clone()));
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        self.check_writable()?;
        {
            let mut messages = self.messages.lock().await;
            let slot = messages
                .iter_mut()
                .find(|m| m.id == message.id)
                .ok_or_else(|| ForkchatError::NotFound(format!("message {}", message.id)))?;
            *slot = message.clone();
        }
        self.notify(StoreChange::Updated(message.clone()));
        Ok(())
    }

    async fn delete_messages(&self, ids: &[String]) -> Result<()> {
        self.check_writable()?;
        self.messages
            .lock()
            .await
            .retain(|m| !ids.contains(&m.id));
        self.notify(StoreChange::Deleted(ids.to_vec()));
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut out: Vec<Message> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn listen(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_update_delete_notify() {
        let store = MemoryStore::new();
        let mut rx = store.listen();

        let mut msg = Message::user("c1", None, "hi");
        store.add_message(&msg).await.unwrap();
        msg.append_text(" there");
        store.update_message(&msg).await.unwrap();
        store.delete_messages(&[msg.id.clone()]).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), StoreChange::Added(_)));
        match rx.recv().await.unwrap() {
            StoreChange::Updated(m) => assert_eq!(m.text, "hi there"),
            other => panic!("unexpected change: {:?}", other),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreChange::Deleted(vec![msg.id.clone()])
        );
        assert!(store.list_messages("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_by_conversation() {
        let store = MemoryStore::new();
        store.add_message(&Message::user("a", None, "1")).await.unwrap();
        store.add_message(&Message::user("b", None, "2")).await.unwrap();
        let listed = store.list_messages("a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].text, "1");
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .add_message(&Message::user("a", None, "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::Storage(_))
        ));
        store.set_fail_writes(false);
        assert!(store.add_message(&Message::user("a", None, "x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_ids() {
        let store = MemoryStore::new();
        let msg = Message::user("a", None, "x");
        store.add_message(&msg).await.unwrap();
        assert!(store.add_message(&msg).await.is_err());
        assert!(store
            .update_message(&Message::user("a", None, "ghost"))
            .await
            .is_err());
    }
}
