//! In-memory [`KnowledgeIndex`] and [`IndexBackend`] for tests and
//! ephemeral deployments.
//!
//! Vector search is brute-force cosine similarity over all stored vectors.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{ScoredChunk, UserId};

use super::{top_k, IndexBackend, IndexEntry, KnowledgeIndex, SourceSummary};

fn poisoned<T>(_: T) -> Error {
    Error::Persistence("in-memory index lock poisoned".to_string())
}

#[derive(Default)]
struct Contents {
    entries: Vec<IndexEntry>,
    bootstrapped: bool,
}

pub struct InMemoryIndex {
    owner: UserId,
    contents: RwLock<Contents>,
}

impl InMemoryIndex {
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            contents: RwLock::new(Contents::default()),
        }
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryIndex {
    fn owner(&self) -> &UserId {
        &self.owner
    }

    async fn insert(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut contents = self.contents.write().map_err(poisoned)?;
        contents.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let contents = self.contents.read().map_err(poisoned)?;
        let scored = contents
            .entries
            .iter()
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                score: cosine_similarity(query, &e.vector),
            })
            .collect();
        Ok(top_k(scored, k))
    }

    async fn entry_count(&self) -> Result<usize> {
        Ok(self.contents.read().map_err(poisoned)?.entries.len())
    }

    async fn sources(&self) -> Result<Vec<SourceSummary>> {
        let contents = self.contents.read().map_err(poisoned)?;
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for e in contents.entries.iter() {
            *counts.entry(e.chunk.source.as_str()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(source, chunks)| SourceSummary {
                source: source.to_string(),
                chunks,
            })
            .collect())
    }

    async fn is_bootstrapped(&self) -> Result<bool> {
        Ok(self.contents.read().map_err(poisoned)?.bootstrapped)
    }

    async fn insert_bootstrap(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut contents = self.contents.write().map_err(poisoned)?;
        contents.entries.extend_from_slice(entries);
        contents.bootstrapped = true;
        Ok(())
    }
}

/// Keeps one [`InMemoryIndex`] per user for the lifetime of the backend.
#[derive(Default)]
pub struct InMemoryBackend {
    indexes: Mutex<HashMap<UserId, Arc<InMemoryIndex>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    async fn open(&self, user: &UserId) -> Result<Arc<dyn KnowledgeIndex>> {
        let mut indexes = self.indexes.lock().map_err(poisoned)?;
        let index: Arc<dyn KnowledgeIndex> = indexes
            .entry(user.clone())
            .or_insert_with(|| Arc::new(InMemoryIndex::new(user.clone())))
            .clone();
        Ok(index)
    }
}
