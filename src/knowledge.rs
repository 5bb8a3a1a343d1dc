//! Per-user knowledge-store lifecycle: lazy open, one-time seed bootstrap,
//! batched embedding on upsert, and similarity queries.
//!
//! Each user id gets its own [`OnceCell`], so concurrent first accesses for
//! one user wait on a single open-and-bootstrap instead of racing, while
//! different users never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use kbchat_core::chunk::Chunker;
use kbchat_core::embedding::Embedder;
use kbchat_core::store::{IndexBackend, IndexEntry, KnowledgeIndex};
use kbchat_core::{DocumentChunk, Error, Provider, Result, ScoredChunk, UserId};

use crate::seed::SeedCorpus;

type Handle = Arc<dyn KnowledgeIndex>;

pub struct KnowledgeStores {
    backend: Arc<dyn IndexBackend>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    seed: Option<SeedCorpus>,
    top_k: usize,
    batch_size: usize,
    handles: Mutex<HashMap<UserId, Arc<OnceCell<Handle>>>>,
}

impl KnowledgeStores {
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        top_k: usize,
    ) -> Self {
        Self {
            backend,
            embedder,
            chunker,
            seed: None,
            top_k,
            batch_size: 64,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_seed(mut self, seed: SeedCorpus) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    fn cell(&self, user: &UserId) -> Result<Arc<OnceCell<Handle>>> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| Error::Persistence("knowledge handle lock poisoned".to_string()))?;
        Ok(handles.entry(user.clone()).or_default().clone())
    }

    /// Open the user's index, creating and bootstrapping it on first use.
    pub async fn open_or_create(&self, user: &UserId) -> Result<Handle> {
        let cell = self.cell(user)?;
        let handle = cell
            .get_or_try_init(|| async {
                let index = self.backend.open(user).await?;
                self.bootstrap(&index).await?;
                Ok::<_, Error>(index)
            })
            .await?;
        Ok(handle.clone())
    }

    async fn bootstrap(&self, index: &Handle) -> Result<()> {
        let Some(seed) = &self.seed else {
            return Ok(());
        };
        if index.is_bootstrapped().await? {
            return Ok(());
        }

        let documents = seed
            .load()
            .map_err(|e| Error::Persistence(format!("seed corpus: {:#}", e)))?;

        let chunks: Vec<DocumentChunk> = documents
            .iter()
            .flat_map(|doc| self.chunker.split(&doc.text, &doc.name))
            .collect();
        let entries = self.embed_entries(&chunks).await?;
        index.insert_bootstrap(&entries).await?;
        tracing::info!(
            user = %index.owner(),
            seed = %seed.root().display(),
            documents = documents.len(),
            chunks = entries.len(),
            "seed corpus bootstrapped"
        );
        Ok(())
    }

    /// Embed `chunks` in batches and append them to the index.
    ///
    /// Returns the number of entries written. Nothing is written if any
    /// batch fails to embed.
    pub async fn upsert(&self, index: &Handle, chunks: &[DocumentChunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let entries = self.embed_entries(chunks).await?;
        index.insert(&entries).await?;
        Ok(entries.len())
    }

    async fn embed_entries(&self, chunks: &[DocumentChunk]) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(Error::provider(
                    Provider::Embedding,
                    format!(
                        "expected {} embeddings, provider returned {}",
                        batch.len(),
                        vectors.len()
                    ),
                ));
            }
            entries.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(chunk, vector)| IndexEntry { chunk, vector }),
            );
        }
        Ok(entries)
    }

    /// The `top_k` chunks nearest to `text`, best first.
    ///
    /// An embedding failure is reported as [`Error::RetrievalUnavailable`],
    /// never as an empty result.
    pub async fn query(&self, index: &Handle, text: &str) -> Result<Vec<ScoredChunk>> {
        let vectors = self
            .embedder
            .embed(&[text.to_string()])
            .await
            .map_err(|e| Error::RetrievalUnavailable(e.to_string()))?;
        let query = vectors.into_iter().next().ok_or_else(|| {
            Error::RetrievalUnavailable("embedding provider returned no vector".to_string())
        })?;
        index.nearest(&query, self.top_k).await
    }
}
