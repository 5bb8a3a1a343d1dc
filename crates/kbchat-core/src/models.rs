//! Core data models used throughout kbchat.
//!
//! These types represent the tenancy key, the chunks that flow through the
//! ingestion pipeline, and the chat turns recorded by the history log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum accepted length of a user id.
const MAX_USER_ID_LEN: usize = 64;

/// Opaque user identifier, the tenancy key for every per-user resource.
///
/// Restricted to ASCII alphanumerics, `-` and `_` so it can be used
/// verbatim as part of a file name and a log field. Integer ids from an
/// external auth collaborator are accepted as their decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Validation("user id must not be empty".to_string()));
        }
        if raw.len() > MAX_USER_ID_LEN {
            return Err(Error::Validation(format!(
                "user id longer than {} characters",
                MAX_USER_ID_LEN
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!(
                "user id '{}' contains characters outside [A-Za-z0-9_-]",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> String {
        id.0
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }
}

impl FromStr for Sender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Sender::User),
            "bot" => Ok(Sender::Bot),
            other => Err(Error::Validation(format!("unknown sender '{}'", other))),
        }
    }
}

/// A persisted chat message.
///
/// `order` is the per-user position in the conversation and defines the
/// total order of a user's history; `created_at` is informational only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub user_id: UserId,
    pub sender: Sender,
    pub text: String,
    pub order: i64,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn turn(&self) -> Turn {
        Turn {
            sender: self.sender,
            text: self.text.clone(),
        }
    }
}

/// A conversation turn as handed to the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub sender: Sender,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Bot,
            text: text.into(),
        }
    }
}

/// A passage of an ingested document.
///
/// `offset` is the character offset of `text` within the normalized
/// document; `hash` is the SHA-256 of `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub source: String,
    pub sequence_hint: Option<i64>,
    pub offset: usize,
    pub text: String,
    pub hash: String,
}

/// A chunk returned from a similarity query, with its cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}
