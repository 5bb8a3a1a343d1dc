//! In-memory [`ChatLog`] for tests and ephemeral deployments.
//!
//! A single mutex guards all users, so order assignment is trivially
//! atomic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::models::{ChatMessage, Turn, UserId};

use super::ChatLog;

#[derive(Default)]
struct LogState {
    next_id: i64,
    by_user: HashMap<UserId, Vec<ChatMessage>>,
}

impl LogState {
    fn push_turns(&mut self, user: &UserId, turns: &[Turn]) -> Vec<ChatMessage> {
        let mut next_order = self
            .by_user
            .get(user)
            .and_then(|msgs| msgs.last())
            .map(|m| m.order)
            .unwrap_or(0);
        let mut stored = Vec::with_capacity(turns.len());
        for turn in turns {
            self.next_id += 1;
            next_order += 1;
            stored.push(ChatMessage {
                id: self.next_id,
                user_id: user.clone(),
                sender: turn.sender,
                text: turn.text.clone(),
                order: next_order,
                created_at: Utc::now(),
            });
        }
        self.by_user
            .entry(user.clone())
            .or_default()
            .extend(stored.iter().cloned());
        stored
    }
}

#[derive(Default)]
pub struct InMemoryChatLog {
    state: Mutex<LogState>,
}

impl InMemoryChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LogState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Persistence("in-memory chat log lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl ChatLog for InMemoryChatLog {
    async fn append_batch(&self, user: &UserId, turns: &[Turn]) -> Result<Vec<ChatMessage>> {
        self.with_state(|state| state.push_turns(user, turns))
    }

    async fn load(&self, user: &UserId) -> Result<Vec<ChatMessage>> {
        self.with_state(|state| state.by_user.get(user).cloned().unwrap_or_default())
    }

    async fn recent(&self, user: &UserId, limit: usize) -> Result<Vec<ChatMessage>> {
        self.with_state(|state| {
            let msgs = state.by_user.get(user).map(Vec::as_slice).unwrap_or(&[]);
            msgs[msgs.len().saturating_sub(limit)..].to_vec()
        })
    }

    async fn count(&self, user: &UserId) -> Result<i64> {
        self.with_state(|state| state.by_user.get(user).map(|m| m.len()).unwrap_or(0) as i64)
    }

    async fn last_order(&self, user: &UserId) -> Result<i64> {
        self.with_state(|state| {
            state
                .by_user
                .get(user)
                .and_then(|m| m.last())
                .map(|m| m.order)
                .unwrap_or(0)
        })
    }

    async fn replace_all(&self, user: &UserId, turns: &[Turn]) -> Result<(u64, Vec<ChatMessage>)> {
        self.with_state(|state| {
            let deleted = state
                .by_user
                .remove(user)
                .map(|m| m.len() as u64)
                .unwrap_or(0);
            (deleted, state.push_turns(user, turns))
        })
    }

    async fn prune(&self, user: &UserId, keep: usize) -> Result<u64> {
        self.with_state(|state| match state.by_user.get_mut(user) {
            Some(msgs) => {
                let excess = msgs.len().saturating_sub(keep);
                msgs.drain(..excess);
                excess as u64
            }
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use std::sync::Arc;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_orders_are_sequential_per_user() {
        let log = InMemoryChatLog::new();
        let a = uid("a");
        let b = uid("b");
        log.append(&a, Sender::User, "hi").await.unwrap();
        log.append(&b, Sender::User, "hello").await.unwrap();
        log.append(&a, Sender::Bot, "hey").await.unwrap();

        let orders: Vec<i64> = log.load(&a).await.unwrap().iter().map(|m| m.order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(log.last_order(&b).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_have_no_gaps() {
        let log = Arc::new(InMemoryChatLog::new());
        let user = uid("busy");
        let mut handles = Vec::new();
        for i in 0..40 {
            let log = log.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                log.append(&user, Sender::User, &format!("msg {}", i)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let orders: Vec<i64> = log.load(&user).await.unwrap().iter().map(|m| m.order).collect();
        assert_eq!(orders, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_batch_recent_prune_clear() {
        let log = InMemoryChatLog::new();
        let u = uid("u");
        let stored = log
            .append_batch(&u, &[Turn::user("q1"), Turn::bot("a1"), Turn::user("q2"), Turn::bot("a2")])
            .await
            .unwrap();
        assert_eq!(stored.iter().map(|m| m.order).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let recent = log.recent(&u, 2).await.unwrap();
        assert_eq!(recent.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), vec!["q2", "a2"]);

        assert_eq!(log.prune(&u, 3).await.unwrap(), 1);
        assert_eq!(log.count(&u).await.unwrap(), 3);
        let next = log.append(&u, Sender::User, "q3").await.unwrap();
        assert_eq!(next.order, 5);

        let (deleted, stored) = log.replace_all(&u, &[]).await.unwrap();
        assert_eq!(deleted, 4);
        assert!(stored.is_empty());
        assert!(log.load(&u).await.unwrap().is_empty());
        assert_eq!(log.last_order(&u).await.unwrap(), 0);

        log.append(&u, Sender::User, "old").await.unwrap();
        let (deleted, stored) = log.replace_all(&u, &[Turn::bot("fresh")]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(stored[0].order, 1);
        assert_eq!(log.load(&u).await.unwrap(), stored);
    }
}
