//! # kbchat Core
//!
//! Shared logic for kbchat: data models, the recursive chunker, the
//! knowledge-index and chat-log abstractions with in-memory backends,
//! collaborator traits (embedding, chat completion), prompts, and the
//! typed pipeline error.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. Durable
//! backends and network providers live in the `kbchat` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod store;

pub use error::{Error, Provider, Result};
pub use models::{ChatMessage, DocumentChunk, ScoredChunk, Sender, Turn, UserId};
