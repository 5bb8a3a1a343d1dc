//! TOML configuration parsing and validation.
//!
//! kbchat is configured via a single TOML file (default
//! `./config/kbchat.toml`). Secrets never live in the file: every provider
//! names the environment variable that holds its key (`api_key_env`).
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/kbchat.sqlite"
//!
//! [knowledge]
//! root = "./data/knowledge"
//! seed_dir = "./markdown"
//! top_k = 3
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 200
//! separators = "markdown"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o"
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use kbchat_core::chunk::{Chunker, MARKDOWN_SEPARATORS, PLAIN_SEPARATORS};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    /// Directory holding one index file per user.
    pub root: PathBuf,
    /// Optional directory of markdown files loaded into every new index.
    #[serde(default)]
    pub seed_dir: Option<PathBuf>,
    #[serde(default = "default_seed_globs")]
    pub seed_globs: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_seed_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}
fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub separators: SeparatorConfig,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            separators: SeparatorConfig::default(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

/// Either a named preset (`"markdown"`, `"plain"`) or an explicit list.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum SeparatorConfig {
    Preset(String),
    List(Vec<String>),
}

impl Default for SeparatorConfig {
    fn default() -> Self {
        SeparatorConfig::Preset("markdown".to_string())
    }
}

impl ChunkingConfig {
    pub fn separators(&self) -> Result<Vec<String>> {
        let list = match &self.separators {
            SeparatorConfig::Preset(name) => match name.as_str() {
                "markdown" => MARKDOWN_SEPARATORS,
                "plain" => PLAIN_SEPARATORS,
                other => bail!(
                    "Unknown chunking.separators preset: '{}'. Must be markdown or plain.",
                    other
                ),
            }
            .iter()
            .map(|s| s.to_string())
            .collect(),
            SeparatorConfig::List(list) => list.clone(),
        };
        Ok(list)
    }

    pub fn build(&self) -> Result<Chunker> {
        Ok(Chunker::new(
            self.chunk_size,
            self.chunk_overlap,
            self.separators()?,
        )?)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateways, Ollama, Azure endpoint).
    #[serde(default)]
    pub url: Option<String>,
    /// Azure deployment name.
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            deployment: None,
            api_version: default_api_version(),
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            deployment: None,
            api_version: default_api_version(),
            api_key_env: default_openai_key_env(),
            temperature: default_temperature(),
            max_tokens: None,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_tavily_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            api_key_env: default_tavily_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Turn seeded after a history is cleared.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Newest turns handed to the model on each request.
    #[serde(default = "default_prompt_turns")]
    pub prompt_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
            prompt_turns: default_prompt_turns(),
        }
    }
}

fn default_greeting() -> String {
    "Welcome back! How may I be of assistance today?".to_string()
}
fn default_prompt_turns() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ArtifactsConfig {
    /// Where normalized ingested text is kept for auditing. Disabled when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_session_secret_env")]
    pub session_secret_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            session_secret_env: default_session_secret_env(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_session_secret_env() -> String {
    "KBCHAT_SESSION_SECRET".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_api_version() -> String {
    "2024-05-01-preview".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_tavily_key_env() -> String {
    "TAVILY_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    config
        .chunking
        .build()
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

    // Validate retrieval
    if config.knowledge.top_k == 0 {
        bail!("knowledge.top_k must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "azure" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, azure, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "azure" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.provider == "azure"
        && (config.embedding.url.is_none() || config.embedding.deployment.is_none())
    {
        bail!("embedding.url and embedding.deployment are required for the azure provider");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate language model
    match config.llm.provider.as_str() {
        "disabled" | "openai" | "azure" | "ollama" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, azure, or ollama.",
            other
        ),
    }
    if matches!(config.llm.provider.as_str(), "openai" | "ollama") && config.llm.model.is_none() {
        bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }
    if config.llm.provider == "azure"
        && (config.llm.url.is_none() || config.llm.deployment.is_none())
    {
        bail!("llm.url and llm.deployment are required for the azure provider");
    }

    match config.extraction.provider.as_str() {
        "disabled" | "tavily" => {}
        other => bail!(
            "Unknown extraction provider: '{}'. Must be disabled or tavily.",
            other
        ),
    }

    Ok(config)
}
