//! Per-user knowledge index abstraction.
//!
//! A [`KnowledgeIndex`] is one user's vector index: it stores chunks with
//! their embedding vectors and answers nearest-neighbour queries. An
//! [`IndexBackend`] opens (or creates) the index for a user id. Indexes are
//! never shared between users.
//!
//! Embedding is not done here: callers pass vectors in and query with a
//! vector, so the index stays a pure storage primitive.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{DocumentChunk, ScoredChunk, UserId};

/// A chunk together with its embedding vector.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: DocumentChunk,
    pub vector: Vec<f32>,
}

/// Number of chunks stored per ingested source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub chunks: usize,
}

/// One user's vector index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert`](KnowledgeIndex::insert) | Append entries; never rewrites existing ones |
/// | [`nearest`](KnowledgeIndex::nearest) | Top-`k` entries by cosine similarity, best first |
/// | [`entry_count`](KnowledgeIndex::entry_count) | Number of stored entries |
/// | [`sources`](KnowledgeIndex::sources) | Per-source chunk counts |
/// | [`is_bootstrapped`](KnowledgeIndex::is_bootstrapped) | Whether the seed corpus was loaded |
/// | [`insert_bootstrap`](KnowledgeIndex::insert_bootstrap) | Append the seed entries and mark the index bootstrapped |
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    fn owner(&self) -> &UserId;

    async fn insert(&self, entries: &[IndexEntry]) -> Result<()>;

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;

    async fn entry_count(&self) -> Result<usize>;

    async fn sources(&self) -> Result<Vec<SourceSummary>>;

    async fn is_bootstrapped(&self) -> Result<bool>;

    /// Append the seed corpus entries and record the index as bootstrapped.
    ///
    /// Both happen or neither does: a failure leaves no seed entries behind
    /// and the index unbootstrapped.
    async fn insert_bootstrap(&self, entries: &[IndexEntry]) -> Result<()>;
}

/// Opens the index belonging to a user, creating an empty one if needed.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn open(&self, user: &UserId) -> Result<Arc<dyn KnowledgeIndex>>;
}

/// Sort scored chunks best-first and keep the top `k`.
pub fn top_k(mut scored: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}
