//! Integration tests for per-user knowledge indexes on SQLite.
//!
//! These tests exercise the real index files: one-time seed bootstrap under
//! concurrent first access, restarts, failed bootstraps, and isolation
//! between users.

use async_trait::async_trait;
use kbchat::knowledge::KnowledgeStores;
use kbchat::seed::SeedCorpus;
use kbchat::sqlite_index::SqliteIndexBackend;
use kbchat_core::chunk::Chunker;
use kbchat_core::embedding::{Embedder, HashEmbedder};
use kbchat_core::store::{IndexBackend, IndexEntry, KnowledgeIndex, SourceSummary};
use kbchat_core::{Error, Provider, Result, ScoredChunk, UserId};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const DIMS: usize = 4096;

// ─── Test Embedders ─────────────────────────────────────────────────

/// Hash embedder that counts how many texts it was asked to embed.
struct CountingEmbedder {
    inner: HashEmbedder,
    texts: AtomicUsize,
}

impl CountingEmbedder {
    fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIMS),
            texts: AtomicUsize::new(0),
        }
    }

    fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

/// Hash embedder whose `fail_call`-th call (1-based) fails.
struct FlakyEmbedder {
    inner: HashEmbedder,
    calls: AtomicUsize,
    fail_call: AtomicUsize,
}

impl FlakyEmbedder {
    fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIMS),
            calls: AtomicUsize::new(0),
            fail_call: AtomicUsize::new(0),
        }
    }

    /// Make the call after the next `successes` calls fail.
    fn fail_after(&self, successes: usize) {
        let calls = self.calls.load(Ordering::SeqCst);
        self.fail_call.store(calls + successes + 1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "flaky"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_call.load(Ordering::SeqCst) {
            return Err(Error::provider(Provider::Embedding, "connection refused"));
        }
        self.inner.embed(texts).await
    }
}

// ─── Test Indexes ───────────────────────────────────────────────────

/// SQLite backend whose next seed write fails part-way through, after
/// some chunks were already written.
struct TornSeedBackend {
    inner: SqliteIndexBackend,
    fail_next: Arc<AtomicBool>,
}

struct TornSeedIndex {
    inner: Arc<dyn KnowledgeIndex>,
    fail_next: Arc<AtomicBool>,
}

#[async_trait]
impl IndexBackend for TornSeedBackend {
    async fn open(&self, user: &UserId) -> Result<Arc<dyn KnowledgeIndex>> {
        let inner = self.inner.open(user).await?;
        Ok(Arc::new(TornSeedIndex {
            inner,
            fail_next: self.fail_next.clone(),
        }))
    }
}

#[async_trait]
impl KnowledgeIndex for TornSeedIndex {
    fn owner(&self) -> &UserId {
        self.inner.owner()
    }

    async fn insert(&self, entries: &[IndexEntry]) -> Result<()> {
        self.inner.insert(entries).await
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        self.inner.nearest(query, k).await
    }

    async fn entry_count(&self) -> Result<usize> {
        self.inner.entry_count().await
    }

    async fn sources(&self) -> Result<Vec<SourceSummary>> {
        self.inner.sources().await
    }

    async fn is_bootstrapped(&self) -> Result<bool> {
        self.inner.is_bootstrapped().await
    }

    async fn insert_bootstrap(&self, entries: &[IndexEntry]) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            // Repeating the first entry violates the chunk primary key after
            // every real entry has been written.
            let mut torn = entries.to_vec();
            torn.extend(entries.first().cloned());
            return self.inner.insert_bootstrap(&torn).await;
        }
        self.inner.insert_bootstrap(entries).await
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn chunker() -> Chunker {
    Chunker::markdown(120, 20).unwrap()
}

fn write_seed(dir: &Path) {
    fs::create_dir_all(dir.join("guides")).unwrap();
    fs::write(
        dir.join("welcome.md"),
        "# Welcome\n\nThis knowledge base answers questions about onboarding.\n\n\
         Ask about accounts, billing, or the mobile app.",
    )
    .unwrap();
    fs::write(
        dir.join("guides/billing.md"),
        "# Billing\n\nInvoices are issued on the first day of every month.\n\n\
         Refunds are processed within five business days of the request.\n\n\
         Card payments and bank transfers are both accepted.",
    )
    .unwrap();
    // Hidden and non-markdown files are not part of the seed.
    fs::write(dir.join(".draft.md"), "unfinished").unwrap();
    fs::write(dir.join("notes.txt"), "plain notes").unwrap();
}

fn seed_chunk_count(dir: &Path) -> usize {
    let chunker = chunker();
    ["welcome.md", "guides/billing.md"]
        .iter()
        .map(|name| {
            let text = fs::read_to_string(dir.join(name)).unwrap();
            chunker.split(&text, name).len()
        })
        .sum()
}

fn seeded_stores(root: &Path, seed_dir: &Path, embedder: Arc<dyn Embedder>) -> KnowledgeStores {
    let seed = SeedCorpus::new(seed_dir, &["**/*.md".to_string()]).unwrap();
    KnowledgeStores::new(
        Arc::new(SqliteIndexBackend::new(root)),
        embedder,
        chunker(),
        3,
    )
    .with_seed(seed)
    .with_batch_size(2)
}

fn uid(raw: &str) -> UserId {
    UserId::parse(raw).unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_first_access_bootstraps_once() {
    let tmp = TempDir::new().unwrap();
    let seed_dir = tmp.path().join("seed");
    write_seed(&seed_dir);
    let expected = seed_chunk_count(&seed_dir);
    assert!(expected >= 3, "fixture should span several chunks");

    let embedder = Arc::new(CountingEmbedder::new());
    let stores = Arc::new(seeded_stores(
        &tmp.path().join("knowledge"),
        &seed_dir,
        embedder.clone(),
    ));
    let user = uid("1001");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let stores = stores.clone();
        let user = user.clone();
        tasks.push(tokio::spawn(async move {
            stores.open_or_create(&user).await.unwrap()
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle));
    }
    assert_eq!(handles[0].entry_count().await.unwrap(), expected);
    assert!(handles[0].is_bootstrapped().await.unwrap());
    assert_eq!(embedder.texts(), expected);

    let sources: Vec<String> = handles[0]
        .sources()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.source)
        .collect();
    assert!(sources.contains(&"welcome.md".to_string()));
    assert!(sources.contains(&"guides/billing.md".to_string()));
    assert!(!sources.iter().any(|s| s.contains("draft") || s.ends_with(".txt")));
}

#[tokio::test]
async fn test_restart_does_not_bootstrap_again() {
    let tmp = TempDir::new().unwrap();
    let seed_dir = tmp.path().join("seed");
    write_seed(&seed_dir);
    let root = tmp.path().join("knowledge");
    let user = uid("1001");

    let first = seeded_stores(&root, &seed_dir, Arc::new(CountingEmbedder::new()));
    let count = first
        .open_or_create(&user)
        .await
        .unwrap()
        .entry_count()
        .await
        .unwrap();
    drop(first);

    let embedder = Arc::new(CountingEmbedder::new());
    let second = seeded_stores(&root, &seed_dir, embedder.clone());
    let index = second.open_or_create(&user).await.unwrap();
    assert_eq!(index.entry_count().await.unwrap(), count);
    assert_eq!(embedder.texts(), 0);
}

#[tokio::test]
async fn test_failed_bootstrap_is_retried_without_duplicates() {
    let tmp = TempDir::new().unwrap();
    let seed_dir = tmp.path().join("seed");
    write_seed(&seed_dir);
    let expected = seed_chunk_count(&seed_dir);

    // Batch size 2 means the corpus needs several embed calls; the
    // second one fails after the first succeeded.
    let embedder = Arc::new(FlakyEmbedder::new());
    let stores = seeded_stores(&tmp.path().join("knowledge"), &seed_dir, embedder.clone());
    let user = uid("7");

    embedder.fail_after(1);
    let err = match stores.open_or_create(&user).await {
        Ok(_) => panic!("bootstrap should fail while the embedder is down"),
        Err(e) => e,
    };
    assert!(matches!(
        err,
        Error::ProviderUnavailable {
            provider: Provider::Embedding,
            ..
        }
    ));

    let index = stores.open_or_create(&user).await.unwrap();
    assert!(index.is_bootstrapped().await.unwrap());
    assert_eq!(index.entry_count().await.unwrap(), expected);
}

#[tokio::test]
async fn test_seed_write_failure_after_insert_leaves_no_duplicates() {
    let tmp = TempDir::new().unwrap();
    let seed_dir = tmp.path().join("seed");
    write_seed(&seed_dir);
    let expected = seed_chunk_count(&seed_dir);
    let root = tmp.path().join("knowledge");

    let fail_next = Arc::new(AtomicBool::new(true));
    let backend = TornSeedBackend {
        inner: SqliteIndexBackend::new(&root),
        fail_next: fail_next.clone(),
    };
    let seed = SeedCorpus::new(&seed_dir, &["**/*.md".to_string()]).unwrap();
    let stores = KnowledgeStores::new(
        Arc::new(backend),
        Arc::new(HashEmbedder::new(DIMS)),
        chunker(),
        3,
    )
    .with_seed(seed);
    let user = uid("8");

    let err = match stores.open_or_create(&user).await {
        Ok(_) => panic!("bootstrap should fail when the seed write fails"),
        Err(e) => e,
    };
    assert!(matches!(err, Error::Persistence(_)));
    assert!(!fail_next.load(Ordering::SeqCst));

    // Nothing from the failed attempt is visible in the file.
    {
        let raw = SqliteIndexBackend::new(&root).open(&user).await.unwrap();
        assert_eq!(raw.entry_count().await.unwrap(), 0);
        assert!(!raw.is_bootstrapped().await.unwrap());
    }

    let index = stores.open_or_create(&user).await.unwrap();
    assert!(index.is_bootstrapped().await.unwrap());
    assert_eq!(index.entry_count().await.unwrap(), expected);

    // A restart sees exactly one copy of the seed.
    let reopened = seeded_stores(&root, &seed_dir, Arc::new(CountingEmbedder::new()));
    let index = reopened.open_or_create(&user).await.unwrap();
    assert_eq!(index.entry_count().await.unwrap(), expected);
}

#[tokio::test]
async fn test_users_never_see_each_others_documents() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("knowledge");
    let backend = Arc::new(SqliteIndexBackend::new(&root));
    let stores = KnowledgeStores::new(
        backend.clone(),
        Arc::new(HashEmbedder::new(DIMS)),
        chunker(),
        3,
    );
    let (a, b) = (uid("a"), uid("b"));

    let index_a = stores.open_or_create(&a).await.unwrap();
    let chunks = stores.chunker().split("Alpha facts for user A", "alpha.md");
    stores.upsert(&index_a, &chunks).await.unwrap();

    let index_b = stores.open_or_create(&b).await.unwrap();
    let chunks = stores.chunker().split("Beta facts for user B", "beta.md");
    stores.upsert(&index_b, &chunks).await.unwrap();

    let hits_a = stores.query(&index_a, "alpha").await.unwrap();
    assert!(hits_a.iter().all(|h| h.chunk.source == "alpha.md"));
    let hits_b = stores.query(&index_b, "alpha").await.unwrap();
    assert!(hits_b.iter().all(|h| h.chunk.source == "beta.md"));

    assert!(backend.path_for(&a).exists());
    assert!(backend.path_for(&b).exists());
    assert_ne!(backend.path_for(&a), backend.path_for(&b));
}

#[tokio::test]
async fn test_query_reports_embedding_outage() {
    let tmp = TempDir::new().unwrap();
    let embedder = Arc::new(FlakyEmbedder::new());
    let stores = KnowledgeStores::new(
        Arc::new(SqliteIndexBackend::new(tmp.path())),
        embedder.clone(),
        chunker(),
        3,
    );
    let index = stores.open_or_create(&uid("9")).await.unwrap();

    embedder.fail_after(0);
    let err = stores.query(&index, "anything").await.unwrap_err();
    assert!(matches!(err, Error::RetrievalUnavailable(_)));
}
