//! SQLite-backed per-user knowledge index.
//!
//! Each user gets a dedicated database file `<root>/user_<id>.sqlite`
//! holding `chunks`, `chunk_vectors` and an `index_meta` table. Nothing is
//! shared between users, so isolation follows from the file layout.
//!
//! Similarity search is brute-force cosine over the stored vectors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::OnceCell;

use kbchat_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use kbchat_core::store::{top_k, IndexBackend, IndexEntry, KnowledgeIndex, SourceSummary};
use kbchat_core::{DocumentChunk, Error, Result, ScoredChunk, UserId};

use crate::{db, migrate};

const BOOTSTRAPPED_KEY: &str = "bootstrapped";

fn db_err(err: sqlx::Error) -> Error {
    Error::persistence(err)
}

/// One user's index file.
pub struct SqliteIndex {
    owner: UserId,
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(owner: UserId, pool: SqlitePool) -> Self {
        Self { owner, pool }
    }
}

async fn write_entries(tx: &mut Transaction<'_, Sqlite>, entries: &[IndexEntry]) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    for entry in entries {
        let chunk = &entry.chunk;
        sqlx::query(
            "INSERT INTO chunks (id, source, sequence_hint, char_offset, text, hash, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.source)
        .bind(chunk.sequence_hint)
        .bind(chunk.offset as i64)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        sqlx::query("INSERT INTO chunk_vectors (chunk_id, dims, embedding) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(entry.vector.len() as i64)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

#[async_trait]
impl KnowledgeIndex for SqliteIndex {
    fn owner(&self) -> &UserId {
        &self.owner
    }

    async fn insert(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        write_entries(&mut tx, entries).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.source, c.sequence_hint, c.char_offset, c.text, c.hash, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let offset: i64 = row.get("char_offset");
                ScoredChunk {
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                    chunk: DocumentChunk {
                        id: row.get("id"),
                        source: row.get("source"),
                        sequence_hint: row.get("sequence_hint"),
                        offset: offset.max(0) as usize,
                        text: row.get("text"),
                        hash: row.get("hash"),
                    },
                }
            })
            .collect();

        Ok(top_k(scored, k))
    }

    async fn entry_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as usize)
    }

    async fn sources(&self) -> Result<Vec<SourceSummary>> {
        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS chunks FROM chunks GROUP BY source ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let chunks: i64 = row.get("chunks");
                SourceSummary {
                    source: row.get("source"),
                    chunks: chunks as usize,
                }
            })
            .collect())
    }

    async fn is_bootstrapped(&self) -> Result<bool> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(BOOTSTRAPPED_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(value.is_some())
    }

    async fn insert_bootstrap(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        write_entries(&mut tx, entries).await?;
        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(BOOTSTRAPPED_KEY)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

/// Opens per-user index files under a root directory.
///
/// Open pools are kept for the life of the backend; the first open of a
/// user creates the file and its schema. Each user has its own
/// [`OnceCell`], so opening one user's file never waits on another's.
pub struct SqliteIndexBackend {
    root: PathBuf,
    open: Mutex<HashMap<UserId, Arc<OnceCell<Arc<SqliteIndex>>>>>,
}

impl SqliteIndexBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, user: &UserId) -> PathBuf {
        self.root.join(format!("user_{}.sqlite", user))
    }

    fn cell(&self, user: &UserId) -> Result<Arc<OnceCell<Arc<SqliteIndex>>>> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| Error::Persistence("index backend lock poisoned".to_string()))?;
        Ok(open.entry(user.clone()).or_default().clone())
    }

    async fn connect(&self, user: &UserId) -> Result<Arc<SqliteIndex>> {
        let path = self.path_for(user);
        let pool = db::connect_path(&path, 2)
            .await
            .map_err(|e| Error::Persistence(format!("open {}: {:#}", path.display(), e)))?;
        migrate::migrate_index(&pool)
            .await
            .map_err(|e| Error::Persistence(format!("migrate {}: {:#}", path.display(), e)))?;
        tracing::debug!(user = %user, path = %path.display(), "opened knowledge index");
        Ok(Arc::new(SqliteIndex::new(user.clone(), pool)))
    }
}

#[async_trait]
impl IndexBackend for SqliteIndexBackend {
    async fn open(&self, user: &UserId) -> Result<Arc<dyn KnowledgeIndex>> {
        let cell = self.cell(user)?;
        let index = cell.get_or_try_init(|| self.connect(user)).await?;
        let index: Arc<dyn KnowledgeIndex> = index.clone();
        Ok(index)
    }
}
