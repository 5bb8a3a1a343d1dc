//! The caller-facing façade shared by the CLI and the HTTP server.
//!
//! [`ChatService`] wires the knowledge stores, history manager, responder
//! and ingestor together and exposes the four user operations: ingest,
//! respond, get history, clear.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use kbchat_core::chunk::Chunker;
use kbchat_core::embedding::Embedder;
use kbchat_core::history::ChatLog;
use kbchat_core::llm::ChatModel;
use kbchat_core::store::{IndexBackend, SourceSummary};
use kbchat_core::{ChatMessage, Result, UserId};

use crate::config::Config;
use crate::extract::{self, PageExtractor};
use crate::history::HistoryManager;
use crate::ingest::{IngestOutcome, IngestSource, Ingestor};
use crate::knowledge::KnowledgeStores;
use crate::responder::{Answer, Responder};
use crate::seed::SeedCorpus;
use crate::sqlite_history::SqliteChatLog;
use crate::sqlite_index::SqliteIndexBackend;
use crate::{db, embedding, llm, migrate};

/// Everything a [`ChatService`] is assembled from.
///
/// [`Components::new`] fills in the configuration defaults; tests swap in
/// in-memory backends and scripted models.
pub struct Components {
    pub log: Arc<dyn ChatLog>,
    pub backend: Arc<dyn IndexBackend>,
    pub embedder: Arc<dyn Embedder>,
    pub model: Arc<dyn ChatModel>,
    pub extractor: Arc<dyn PageExtractor>,
    pub chunker: Chunker,
    pub seed: Option<SeedCorpus>,
    pub top_k: usize,
    pub embed_batch_size: usize,
    pub greeting: String,
    pub prompt_turns: usize,
    pub artifacts_dir: Option<PathBuf>,
}

impl Components {
    pub fn new(
        log: Arc<dyn ChatLog>,
        backend: Arc<dyn IndexBackend>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let defaults = crate::config::HistoryConfig::default();
        Self {
            log,
            backend,
            embedder,
            model,
            extractor: Arc::new(extract::DisabledExtractor),
            chunker: Chunker::markdown(1000, 200).expect("default chunking parameters are valid"),
            seed: None,
            top_k: 3,
            embed_batch_size: 64,
            greeting: defaults.greeting,
            prompt_turns: defaults.prompt_turns,
            artifacts_dir: None,
        }
    }
}

pub struct ChatService {
    stores: Arc<KnowledgeStores>,
    history: Arc<HistoryManager>,
    responder: Responder,
    ingestor: Ingestor,
}

impl ChatService {
    pub fn new(components: Components) -> Self {
        let mut stores = KnowledgeStores::new(
            components.backend,
            components.embedder,
            components.chunker,
            components.top_k,
        )
        .with_batch_size(components.embed_batch_size);
        if let Some(seed) = components.seed {
            stores = stores.with_seed(seed);
        }
        let stores = Arc::new(stores);
        let history = Arc::new(HistoryManager::new(components.log, components.greeting));
        let responder = Responder::new(
            stores.clone(),
            history.clone(),
            components.model,
            components.prompt_turns,
        );
        let ingestor = Ingestor::new(stores.clone(), components.extractor)
            .with_artifacts_dir(components.artifacts_dir);

        Self {
            stores,
            history,
            responder,
            ingestor,
        }
    }

    /// Build the service described by `config`: SQLite chat log and
    /// per-user index files, plus the configured providers.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_chat_log(&pool).await?;
        std::fs::create_dir_all(&config.knowledge.root).with_context(|| {
            format!(
                "Failed to create knowledge root: {}",
                config.knowledge.root.display()
            )
        })?;

        let seed = match &config.knowledge.seed_dir {
            Some(dir) if dir.is_dir() => Some(SeedCorpus::new(dir, &config.knowledge.seed_globs)?),
            Some(dir) => {
                tracing::warn!(dir = %dir.display(), "seed directory not found, starting without a seed corpus");
                None
            }
            None => None,
        };

        let components = Components {
            log: Arc::new(SqliteChatLog::new(pool)),
            backend: Arc::new(SqliteIndexBackend::new(&config.knowledge.root)),
            embedder: embedding::create_embedder(&config.embedding)?,
            model: llm::create_chat_model(&config.llm)?,
            extractor: extract::create_extractor(&config.extraction)?,
            chunker: config.chunking.build()?,
            seed,
            top_k: config.knowledge.top_k,
            embed_batch_size: config.embedding.batch_size,
            greeting: config.history.greeting.clone(),
            prompt_turns: config.history.prompt_turns,
            artifacts_dir: config.artifacts.dir.clone(),
        };
        Ok(Self::new(components))
    }

    pub async fn ingest(&self, user: &UserId, source: IngestSource) -> Result<IngestOutcome> {
        self.ingestor.ingest(user, source).await
    }

    pub async fn respond(&self, user: &UserId, query: &str) -> Result<Answer> {
        self.responder.respond(user, query).await
    }

    pub async fn get_history(&self, user: &UserId) -> Result<Vec<ChatMessage>> {
        self.history.get_history(user).await
    }

    pub async fn clear(&self, user: &UserId) -> Result<Vec<ChatMessage>> {
        self.history.clear(user).await
    }

    /// Sources in the user's knowledge base with their chunk counts.
    pub async fn sources(&self, user: &UserId) -> Result<Vec<SourceSummary>> {
        let index = self.stores.open_or_create(user).await?;
        index.sources().await
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn knowledge(&self) -> &KnowledgeStores {
        &self.stores
    }
}
