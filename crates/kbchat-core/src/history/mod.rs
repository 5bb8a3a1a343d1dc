//! Durable chat-log abstraction.
//!
//! A [`ChatLog`] is the authoritative record of every user's conversation.
//! Each message gets a per-user `order` value; implementations must assign
//! it atomically so concurrent appends for one user never collide or leave
//! gaps. The in-process cache in the app crate sits on top of this trait and
//! is never authoritative.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ChatMessage, Sender, Turn, UserId};

#[async_trait]
pub trait ChatLog: Send + Sync {
    /// Persist several turns atomically, with consecutive order values
    /// following the user's current maximum. Returns the stored messages.
    async fn append_batch(&self, user: &UserId, turns: &[Turn]) -> Result<Vec<ChatMessage>>;

    /// Persist one turn with the next order value.
    async fn append(&self, user: &UserId, sender: Sender, text: &str) -> Result<ChatMessage> {
        let turn = Turn {
            sender,
            text: text.to_string(),
        };
        let mut stored = self.append_batch(user, std::slice::from_ref(&turn)).await?;
        stored.pop().ok_or_else(|| {
            crate::Error::Persistence("append returned no message".to_string())
        })
    }

    /// The full log for a user, ascending by order.
    async fn load(&self, user: &UserId) -> Result<Vec<ChatMessage>>;

    /// The newest `limit` messages, ascending by order.
    async fn recent(&self, user: &UserId, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Number of stored messages for a user.
    async fn count(&self, user: &UserId) -> Result<i64>;

    /// Highest order value for a user, `0` when the log is empty.
    async fn last_order(&self, user: &UserId) -> Result<i64>;

    /// Delete every message of a user and store `turns` in their place,
    /// starting again at order 1. Both happen in one transaction. Returns
    /// the number deleted and the stored messages.
    async fn replace_all(&self, user: &UserId, turns: &[Turn]) -> Result<(u64, Vec<ChatMessage>)>;

    /// Delete all but the newest `keep` messages. Returns the number deleted.
    async fn prune(&self, user: &UserId, keep: usize) -> Result<u64>;
}
