//! Embedding provider implementations.
//!
//! Concrete backends for the [`Embedder`] trait defined in `kbchat-core`:
//! - **[`DisabledEmbedder`]** — always fails; used when embeddings are not configured.
//! - **[`OpenAIEmbedder`]** — OpenAI (or Azure OpenAI) embeddings API with batching and retry.
//! - **[`OllamaEmbedder`]** — a local Ollama instance.
//! - **`LocalEmbedder`** — fastembed, behind the `local-embeddings` feature.
//! - **[`HashEmbedder`]** — offline feature hashing, for development.
//!
//! Every failure is reported as [`Error::ProviderUnavailable`] so the
//! pipeline can tell a provider outage from bad input.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use kbchat::config::EmbeddingConfig;
//! # use kbchat::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;

use kbchat_core::embedding::{Embedder, HashEmbedder};
use kbchat_core::{Error, Provider, Result};

use crate::config::EmbeddingConfig;
use crate::http::{self, Auth};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

fn unavailable(err: impl std::fmt::Display) -> Error {
    Error::provider(Provider::Embedding, err.to_string())
}

/// Check that a provider returned one vector of the right length per input.
fn check_shape(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        return Err(unavailable(format!(
            "expected {} embeddings, provider returned {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(unavailable(format!(
            "expected {}-dimensional embeddings, provider returned {}",
            dims,
            bad.len()
        )));
    }
    Ok(())
}

// ============ Disabled ============

/// An embedder that always fails.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(unavailable("embedding provider is disabled"))
    }
}

// ============ OpenAI / Azure OpenAI ============

/// Embedder using the OpenAI embeddings API.
///
/// With `provider = "azure"` the same request is sent to
/// `{url}/openai/deployments/{deployment}/embeddings` with an `api-key`
/// header instead.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    endpoint: String,
    auth: Auth,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let key = http::secret_from_env(&config.api_key_env)?;

        let (endpoint, auth) = if config.provider == "azure" {
            let base = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("embedding.url required for Azure provider"))?;
            let deployment = config.deployment.as_deref().ok_or_else(|| {
                anyhow::anyhow!("embedding.deployment required for Azure provider")
            })?;
            (
                format!(
                    "{}/openai/deployments/{}/embeddings?api-version={}",
                    base.trim_end_matches('/'),
                    deployment,
                    config.api_version
                ),
                Auth::ApiKey(key),
            )
        } else {
            let endpoint = match config.url.as_deref() {
                Some(base) => format!("{}/embeddings", base.trim_end_matches('/')),
                None => OPENAI_EMBEDDINGS_URL.to_string(),
            };
            (endpoint, Auth::Bearer(key))
        };

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            endpoint,
            auth,
            model,
            dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = http::post_json(
                &self.client,
                &self.endpoint,
                &self.auth,
                &body,
                self.max_retries,
                "OpenAI",
            )
            .await
            .map_err(unavailable)?;
            let vectors = parse_openai_response(&json).map_err(unavailable)?;
            check_shape(&vectors, batch.len(), self.dims)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Parse the `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &Value) -> anyhow::Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn to_f32_vec(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama ============

/// Embedder using a local Ollama instance (`POST /api/embed`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            url,
            model,
            dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = http::post_json(
                &self.client,
                &endpoint,
                &Auth::None,
                &body,
                self.max_retries,
                "Ollama",
            )
            .await
            .map_err(|e| unavailable(format!("{} (is Ollama running at {}?)", e, self.url)))?;
            let vectors = parse_ollama_response(&json).map_err(unavailable)?;
            check_shape(&vectors, batch.len(), self.dims)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &Value) -> anyhow::Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let values = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?;
        result.push(to_f32_vec(values));
    }
    Ok(result)
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;
    use async_trait::async_trait;

    use kbchat_core::embedding::Embedder;
    use kbchat_core::Result;

    use super::{check_shape, unavailable};
    use crate::config::EmbeddingConfig;

    /// Embedder running a fastembed model in-process. The model is loaded
    /// (and downloaded on first use) lazily on a blocking thread.
    pub struct LocalEmbedder {
        model_name: String,
        model: fastembed::EmbeddingModel,
        dims: usize,
        batch_size: usize,
        loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
            let (model, default_dims) = resolve_model(&model_name)?;
            Ok(Self {
                model_name,
                model,
                dims: config.dims.unwrap_or(default_dims),
                batch_size: config.batch_size,
                loaded: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn resolve_model(name: &str) -> anyhow::Result<(fastembed::EmbeddingModel, usize)> {
        use fastembed::EmbeddingModel::*;
        match name {
            "all-minilm-l6-v2" => Ok((AllMiniLML6V2, 384)),
            "bge-small-en-v1.5" => Ok((BGESmallENV15, 384)),
            "bge-base-en-v1.5" => Ok((BGEBaseENV15, 768)),
            "bge-large-en-v1.5" => Ok((BGELargeENV15, 1024)),
            "nomic-embed-text-v1.5" => Ok((NomicEmbedTextV15, 768)),
            "multilingual-e5-small" => Ok((MultilingualE5Small, 384)),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1.5, multilingual-e5-small",
                other
            ),
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }
        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let loaded = Arc::clone(&self.loaded);
            let model = self.model.clone();
            let batch_size = self.batch_size;
            let texts = texts.to_vec();
            let expected = texts.len();

            let vectors = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Vec<f32>>> {
                let mut guard = loaded
                    .lock()
                    .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
                if guard.is_none() {
                    let embedding = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(model).with_show_download_progress(false),
                    )
                    .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
                    *guard = Some(embedding);
                }
                let embedding = guard
                    .as_mut()
                    .ok_or_else(|| anyhow::anyhow!("local embedding model not loaded"))?;
                embedding
                    .embed(texts, Some(batch_size))
                    .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
            })
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;

            check_shape(&vectors, expected, self.dims)?;
            Ok(vectors)
        }
    }
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"`, `"azure"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `--features local-embeddings`) |
/// | `"hash"` | [`HashEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" | "azure" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims.unwrap_or(512)))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
