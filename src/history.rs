//! Conversation history with a process-wide read-through cache.
//!
//! [`HistoryManager`] sits in front of a durable [`ChatLog`]. The log is
//! authoritative; the cache is populated from it on first access per user
//! and only updated after a durable write succeeds. Appends for one user are
//! serialized by that user's slot mutex, so the cached sequence always
//! matches the order the log assigned.
//!
//! The cache can be dropped at any time ([`HistoryManager::drop_cache`],
//! [`HistoryManager::reset_cache`]); the next read reloads from the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kbchat_core::history::ChatLog;
use kbchat_core::{ChatMessage, Error, Result, Sender, Turn, UserId};

type Slot = Arc<tokio::sync::Mutex<Option<Vec<ChatMessage>>>>;

pub struct HistoryManager {
    log: Arc<dyn ChatLog>,
    greeting: String,
    slots: Mutex<HashMap<UserId, Slot>>,
}

impl HistoryManager {
    pub fn new(log: Arc<dyn ChatLog>, greeting: impl Into<String>) -> Self {
        Self {
            log,
            greeting: greeting.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, user: &UserId) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| Error::Persistence("history cache lock poisoned".to_string()))?;
        Ok(slots.entry(user.clone()).or_default().clone())
    }

    /// The user's full conversation, ascending by order.
    pub async fn get_history(&self, user: &UserId) -> Result<Vec<ChatMessage>> {
        let slot = self.slot(user)?;
        let mut cached = slot.lock().await;
        if let Some(messages) = cached.as_ref() {
            return Ok(messages.clone());
        }
        let messages = self.log.load(user).await?;
        tracing::debug!(user = %user, messages = messages.len(), "history loaded from log");
        *cached = Some(messages.clone());
        Ok(messages)
    }

    /// The newest `limit` turns, ascending, as handed to the model.
    pub async fn prompt_turns(&self, user: &UserId, limit: usize) -> Result<Vec<Turn>> {
        let history = self.get_history(user).await?;
        let skip = history.len().saturating_sub(limit);
        Ok(history[skip..].iter().map(ChatMessage::turn).collect())
    }

    /// Persist one turn, then append it to the cache.
    pub async fn append_turn(
        &self,
        user: &UserId,
        sender: Sender,
        text: &str,
    ) -> Result<ChatMessage> {
        let stored = self
            .append_turns(user, &[Turn { sender, text: text.to_string() }])
            .await?;
        stored
            .into_iter()
            .next()
            .ok_or_else(|| Error::Persistence("append returned no message".to_string()))
    }

    /// Persist a question and its answer in one transaction.
    pub async fn append_exchange(
        &self,
        user: &UserId,
        question: &str,
        answer: &str,
    ) -> Result<Vec<ChatMessage>> {
        self.append_turns(user, &[Turn::user(question), Turn::bot(answer)])
            .await
    }

    async fn append_turns(&self, user: &UserId, turns: &[Turn]) -> Result<Vec<ChatMessage>> {
        let slot = self.slot(user)?;
        let mut cached = slot.lock().await;
        let stored = match self.log.append_batch(user, turns).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "failed to persist chat turn");
                return Err(e);
            }
        };
        if let Some(messages) = cached.as_mut() {
            // Another process may have written since the cache was filled.
            let contiguous = stored
                .first()
                .map_or(true, |m| m.order == messages.last().map_or(0, |l| l.order) + 1);
            if contiguous {
                messages.extend(stored.iter().cloned());
            } else {
                *cached = None;
            }
        }
        Ok(stored)
    }

    /// Replace the user's conversation with the greeting turn.
    ///
    /// The delete and the greeting commit together, so a failure leaves the
    /// previous conversation in place.
    pub async fn clear(&self, user: &UserId) -> Result<Vec<ChatMessage>> {
        let slot = self.slot(user)?;
        let mut cached = slot.lock().await;
        *cached = None;
        let (deleted, greeting) = self
            .log
            .replace_all(user, &[Turn::bot(self.greeting.clone())])
            .await?;
        tracing::info!(user = %user, deleted, "history cleared");
        *cached = Some(greeting.clone());
        Ok(greeting)
    }

    pub async fn recent(&self, user: &UserId, limit: usize) -> Result<Vec<ChatMessage>> {
        self.log.recent(user, limit).await
    }

    pub async fn count(&self, user: &UserId) -> Result<i64> {
        self.log.count(user).await
    }

    /// Delete all but the newest `keep` turns and drop the user's cache.
    pub async fn prune(&self, user: &UserId, keep: usize) -> Result<u64> {
        let slot = self.slot(user)?;
        let mut cached = slot.lock().await;
        let deleted = self.log.prune(user, keep).await?;
        *cached = None;
        Ok(deleted)
    }

    pub async fn drop_cache(&self, user: &UserId) -> Result<()> {
        let slot = self.slot(user)?;
        *slot.lock().await = None;
        Ok(())
    }

    /// Forget every cached conversation.
    pub fn reset_cache(&self) -> Result<()> {
        self.slots
            .lock()
            .map_err(|_| Error::Persistence("history cache lock poisoned".to_string()))?
            .clear();
        Ok(())
    }

    /// Whether the user's history is currently cached.
    pub async fn is_cached(&self, user: &UserId) -> Result<bool> {
        let slot = self.slot(user)?;
        let cached = slot.lock().await;
        Ok(cached.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbchat_core::history::memory::InMemoryChatLog;

    fn manager() -> (Arc<InMemoryChatLog>, HistoryManager) {
        let log = Arc::new(InMemoryChatLog::new());
        let manager = HistoryManager::new(log.clone(), "Hello again");
        (log, manager)
    }

    #[tokio::test]
    async fn test_read_through_then_write_through() {
        let (log, manager) = manager();
        let user = UserId::parse("u1").unwrap();
        log.append(&user, Sender::User, "before").await.unwrap();

        let history = manager.get_history(&user).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(manager.is_cached(&user).await.unwrap());

        manager.append_exchange(&user, "q", "a").await.unwrap();
        let cached = manager.get_history(&user).await.unwrap();
        assert_eq!(cached, log.load(&user).await.unwrap());
        assert_eq!(cached.iter().map(|m| m.order).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cache_reloads_after_outside_write() {
        let (log, manager) = manager();
        let user = UserId::parse("u2").unwrap();
        manager.get_history(&user).await.unwrap();
        // Written behind the manager's back, as another process would.
        log.append(&user, Sender::User, "elsewhere").await.unwrap();
        manager.append_turn(&user, Sender::User, "here").await.unwrap();

        assert!(!manager.is_cached(&user).await.unwrap());
        let texts: Vec<String> = manager
            .get_history(&user)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["elsewhere", "here"]);
    }

    #[tokio::test]
    async fn test_clear_seeds_greeting() {
        let (_log, manager) = manager();
        let user = UserId::parse("u3").unwrap();
        manager.append_exchange(&user, "q", "a").await.unwrap();
        let after = manager.clear(&user).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].sender, Sender::Bot);
        assert_eq!(after[0].text, "Hello again");
        assert_eq!(after[0].order, 1);
        assert_eq!(manager.get_history(&user).await.unwrap(), after);
    }

    #[tokio::test]
    async fn test_prompt_turns_keeps_newest() {
        let (_log, manager) = manager();
        let user = UserId::parse("u4").unwrap();
        for i in 0..5 {
            manager
                .append_turn(&user, Sender::User, &format!("t{}", i))
                .await
                .unwrap();
        }
        let turns = manager.prompt_turns(&user, 2).await.unwrap();
        assert_eq!(turns, vec![Turn::user("t3"), Turn::user("t4")]);
        assert_eq!(manager.prompt_turns(&user, 50).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_prune_and_drop_cache() {
        let (_log, manager) = manager();
        let user = UserId::parse("u5").unwrap();
        for i in 0..4 {
            manager
                .append_turn(&user, Sender::Bot, &format!("t{}", i))
                .await
                .unwrap();
        }
        assert_eq!(manager.prune(&user, 1).await.unwrap(), 3);
        assert!(!manager.is_cached(&user).await.unwrap());
        assert_eq!(manager.count(&user).await.unwrap(), 1);

        manager.get_history(&user).await.unwrap();
        manager.drop_cache(&user).await.unwrap();
        assert!(!manager.is_cached(&user).await.unwrap());

        manager.get_history(&user).await.unwrap();
        manager.reset_cache().unwrap();
        assert!(!manager.is_cached(&user).await.unwrap());
    }
}
