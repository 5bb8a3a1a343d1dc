//! SQLite-backed [`ChatLog`].
//!
//! Order values are assigned inside the insert statement itself
//! (`COALESCE(MAX(message_order), 0) + 1` for the user), and the
//! `UNIQUE(user_id, message_order)` key rejects any duplicate that could
//! slip past it. A batch is written in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use kbchat_core::history::ChatLog;
use kbchat_core::{ChatMessage, Error, Result, Sender, Turn, UserId};

fn db_err(err: sqlx::Error) -> Error {
    Error::persistence(err)
}

pub struct SqliteChatLog {
    pool: SqlitePool,
}

impl SqliteChatLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn insert_turns(
    tx: &mut Transaction<'_, Sqlite>,
    user: &UserId,
    turns: &[Turn],
) -> Result<Vec<ChatMessage>> {
    let mut stored = Vec::with_capacity(turns.len());
    for turn in turns {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO chats (user_id, message_text, sender, message_order, created_at)
            SELECT ?, ?, ?, COALESCE(MAX(message_order), 0) + 1, ?
            FROM chats WHERE user_id = ?
            RETURNING id, message_order
            "#,
        )
        .bind(user.as_str())
        .bind(&turn.text)
        .bind(turn.sender.as_str())
        .bind(now.timestamp_millis())
        .bind(user.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        stored.push(ChatMessage {
            id: row.get("id"),
            user_id: user.clone(),
            sender: turn.sender,
            text: turn.text.clone(),
            order: row.get("message_order"),
            created_at: now,
        });
    }
    Ok(stored)
}

fn row_to_message(row: &SqliteRow) -> Result<ChatMessage> {
    let user_id: String = row.get("user_id");
    let sender: String = row.get("sender");
    let created_at: i64 = row.get("created_at");
    Ok(ChatMessage {
        id: row.get("id"),
        user_id: UserId::parse(&user_id).map_err(Error::persistence)?,
        sender: sender.parse().map_err(Error::persistence)?,
        text: row.get("message_text"),
        order: row.get("message_order"),
        created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
    })
}

#[async_trait]
impl ChatLog for SqliteChatLog {
    async fn append_batch(&self, user: &UserId, turns: &[Turn]) -> Result<Vec<ChatMessage>> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let stored = insert_turns(&mut tx, user, turns).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    async fn load(&self, user: &UserId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, user_id, message_text, sender, message_order, created_at \
             FROM chats WHERE user_id = ? ORDER BY message_order ASC",
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_message).collect()
    }

    async fn recent(&self, user: &UserId, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, user_id, message_text, sender, message_order, created_at \
             FROM chats WHERE user_id = ? ORDER BY message_order DESC LIMIT ?",
        )
        .bind(user.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn count(&self, user: &UserId) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE user_id = ?")
            .bind(user.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn last_order(&self, user: &UserId) -> Result<i64> {
        sqlx::query_scalar("SELECT COALESCE(MAX(message_order), 0) FROM chats WHERE user_id = ?")
            .bind(user.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn replace_all(&self, user: &UserId, turns: &[Turn]) -> Result<(u64, Vec<ChatMessage>)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let deleted = sqlx::query("DELETE FROM chats WHERE user_id = ?")
            .bind(user.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        let stored = insert_turns(&mut tx, user, turns).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((deleted, stored))
    }

    async fn prune(&self, user: &UserId, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM chats
            WHERE user_id = ?
              AND message_order NOT IN (
                  SELECT message_order FROM chats
                  WHERE user_id = ?
                  ORDER BY message_order DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
