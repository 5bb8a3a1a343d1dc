//! Retrieval-augmented responder.
//!
//! One chat turn runs four steps, each in its own tracing span:
//!
//! 1. **reformulate** — rewrite the question so it stands alone, given the
//!    recent history. Always invoked, also on the first turn.
//! 2. **retrieve** — the `top_k` nearest chunks of the user's index.
//! 3. **generate** — answer from the retrieved context, the history and
//!    the original question.
//! 4. **persist** — the question and answer are appended in one transaction.
//!
//! A failure in steps 1–3 persists nothing, so the request is safe to retry.

use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use kbchat_core::llm::{ChatModel, CompletionRequest};
use kbchat_core::prompt::{answer_system_prompt, normalize_answer, CONTEXTUALIZE_SYSTEM_PROMPT};
use kbchat_core::{Error, Result, ScoredChunk, Turn, UserId};

use crate::history::HistoryManager;
use crate::knowledge::KnowledgeStores;

/// Whether an answer had any retrieved context behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "sources", rename_all = "lowercase")]
pub enum Grounding {
    /// Distinct source names of the retrieved chunks, best match first.
    Grounded(Vec<String>),
    Ungrounded,
}

impl Grounding {
    fn from_context(context: &[ScoredChunk]) -> Self {
        let mut sources: Vec<String> = Vec::new();
        for hit in context {
            if !sources.contains(&hit.chunk.source) {
                sources.push(hit.chunk.source.clone());
            }
        }
        if sources.is_empty() {
            Grounding::Ungrounded
        } else {
            Grounding::Grounded(sources)
        }
    }

    pub fn is_grounded(&self) -> bool {
        matches!(self, Grounding::Grounded(_))
    }

    pub fn sources(&self) -> &[String] {
        match self {
            Grounding::Grounded(sources) => sources,
            Grounding::Ungrounded => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub standalone_question: String,
    pub grounding: Grounding,
}

pub struct Responder {
    stores: Arc<KnowledgeStores>,
    history: Arc<HistoryManager>,
    model: Arc<dyn ChatModel>,
    prompt_turns: usize,
}

impl Responder {
    pub fn new(
        stores: Arc<KnowledgeStores>,
        history: Arc<HistoryManager>,
        model: Arc<dyn ChatModel>,
        prompt_turns: usize,
    ) -> Self {
        Self {
            stores,
            history,
            model,
            prompt_turns,
        }
    }

    pub async fn respond(&self, user: &UserId, query: &str) -> Result<Answer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::Validation("message must not be empty".to_string()));
        }

        let history = self.history.prompt_turns(user, self.prompt_turns).await?;

        let standalone = self
            .reformulate(&history, query)
            .instrument(tracing::info_span!("reformulate", user = %user, turns = history.len()))
            .await?;

        let context = self
            .retrieve(user, &standalone)
            .instrument(tracing::info_span!("retrieve", user = %user))
            .await?;

        let text = self
            .generate(&history, &context, query)
            .instrument(tracing::info_span!("generate", user = %user, context = context.len()))
            .await?;

        self.history
            .append_exchange(user, query, &text)
            .instrument(tracing::info_span!("persist", user = %user))
            .await?;

        Ok(Answer {
            text,
            standalone_question: standalone,
            grounding: Grounding::from_context(&context),
        })
    }

    async fn reformulate(&self, history: &[Turn], query: &str) -> Result<String> {
        let request =
            CompletionRequest::new(CONTEXTUALIZE_SYSTEM_PROMPT, history.to_vec(), query);
        let rewritten = self
            .model
            .complete(&request)
            .await
            .map_err(|e| Error::GenerationFailed(format!("reformulation: {}", e)))?;
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            tracing::debug!("empty reformulation, using the raw question");
            return Ok(query.to_string());
        }
        tracing::debug!(standalone = rewritten, "question reformulated");
        Ok(rewritten.to_string())
    }

    async fn retrieve(&self, user: &UserId, question: &str) -> Result<Vec<ScoredChunk>> {
        let index = self.stores.open_or_create(user).await.map_err(|e| match e {
            Error::ProviderUnavailable { .. } => Error::RetrievalUnavailable(e.to_string()),
            other => other,
        })?;
        let hits = self.stores.query(&index, question).await?;
        tracing::debug!(hits = hits.len(), "context retrieved");
        Ok(hits)
    }

    async fn generate(
        &self,
        history: &[Turn],
        context: &[ScoredChunk],
        query: &str,
    ) -> Result<String> {
        let request = CompletionRequest::new(answer_system_prompt(context), history.to_vec(), query);
        let answer = self
            .model
            .complete(&request)
            .await
            .map_err(|e| Error::GenerationFailed(e.to_string()))?;
        let answer = normalize_answer(answer.trim());
        if answer.is_empty() {
            return Err(Error::GenerationFailed(
                "language model returned an empty answer".to_string(),
            ));
        }
        Ok(answer)
    }
}
