//! Language-model collaborator trait.
//!
//! The pipeline treats chat completion as a black box: one system
//! instruction, the conversation so far, and the new user input go in; one
//! text comes out. Concrete HTTP providers live in the `kbchat` app crate.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::Turn;

/// A single chat-completion request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub history: Vec<Turn>,
    pub input: String,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, history: Vec<Turn>, input: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history,
            input: input.into(),
        }
    }
}

/// Trait for chat-completion providers.
///
/// Implementations must not assume determinism and must report transport,
/// rate-limit and malformed-response failures as
/// [`Error::ProviderUnavailable`](crate::Error::ProviderUnavailable).
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Returns the model or deployment identifier.
    fn model_name(&self) -> &str;
    /// Produce the assistant reply for `request`.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}
