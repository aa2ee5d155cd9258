//! Configuration parsing and validation.
//!
//! docrag is configured through a TOML file (default: `config/docrag.toml`).
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! # Example Configuration
//!
//! ```toml
//! [db]
//! path = "./data/docrag.sqlite"
//!
//! [chunking]
//! chunk_size = 512
//! overlap = 50
//! min_chunk_size = 100
//!
//! [retrieval]
//! top_k = 5
//! min_score = 0.5
//! history_turns = 5
//!
//! [embedding]
//! provider = "openai"            # "hash", "openai" or "ollama"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "gemini"            # "echo", "gemini" or "openai"
//! model = "gemini-pro"
//! temperature = 0.7
//! max_tokens = 2048
//!
//! [cache]
//! embedding_ttl_secs = 86400
//! response_ttl_secs = 3600
//!
//! [ingestion]
//! workers = 4
//! allowed_types = ["pdf", "docx", "doc", "zip", "txt", "md"]
//!
//! [server]
//! bind = "127.0.0.1:8000"
//!
//! [logging]
//! level = "info"
//! format = "pretty"              # or "json"
//! ```
//!
//! API keys are read from the environment (`OPENAI_API_KEY`,
//! `GEMINI_API_KEY`), never from the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docrag_core::models::DocumentFormat;
use docrag_core::prompt::PromptStyle;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
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
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}
fn default_min_chunk_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Session turns included in each prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.5
}
fn default_history_turns() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    /// Default dimension of the offline `hash` provider.
    pub const HASH_DIMS: usize = 256;

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub prompt_style: PromptStyle,
    /// Estimated prompt tokens (4 chars per token) before trimming kicks in.
    #[serde(default = "default_prompt_token_budget")]
    pub prompt_token_budget: usize,
    /// Override for the provider's API base URL.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_llm_retries(),
            timeout_secs: default_llm_timeout(),
            backoff_base_ms: default_llm_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            prompt_style: PromptStyle::default(),
            prompt_token_budget: default_prompt_token_budget(),
            url: None,
        }
    }
}

impl LlmConfig {
    /// Model identifier, falling back to the provider's default.
    pub fn model_name(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.provider.as_str() {
            "gemini" => "gemini-pro".to_string(),
            "openai" => "gpt-4o-mini".to_string(),
            _ => "echo".to_string(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_provider() -> String {
    "echo".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_llm_retries() -> u32 {
    3
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_llm_backoff_base_ms() -> u64 {
    1000
}
fn default_prompt_token_budget() -> usize {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,
    #[serde(default = "default_response_ttl")]
    pub response_ttl_secs: u64,
    /// Entry bound per cache; overflow evicts expired entries, then the oldest.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            embedding_ttl_secs: default_embedding_ttl(),
            response_ttl_secs: default_response_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_embedding_ttl() -> u64 {
    86_400
}
fn default_response_ttl() -> u64 {
    3_600
}
fn default_max_entries() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns_per_session: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns_per_session: default_max_turns(),
        }
    }
}

fn default_max_turns() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upload size limit in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
    #[serde(default = "default_parse_timeout")]
    pub parse_timeout_secs: u64,
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,
    #[serde(default = "default_store_retries")]
    pub store_max_retries: u32,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_archive_entries")]
    pub max_archive_entries: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_file_size: default_max_file_size(),
            allowed_types: default_allowed_types(),
            parse_timeout_secs: default_parse_timeout(),
            store_timeout_secs: default_store_timeout(),
            store_max_retries: default_store_retries(),
            task_timeout_secs: default_task_timeout(),
            max_archive_entries: default_max_archive_entries(),
        }
    }
}

impl IngestionConfig {
    pub fn is_allowed(&self, format: DocumentFormat) -> bool {
        self.allowed_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(format.as_str()))
    }

    pub fn store_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.store_max_retries,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_file_size() -> usize {
    100 * 1024 * 1024
}
fn default_allowed_types() -> Vec<String> {
    ["pdf", "docx", "doc", "zip", "txt", "md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_parse_timeout() -> u64 {
    120
}
fn default_store_timeout() -> u64 {
    30
}
fn default_store_retries() -> u32 {
    3
}
fn default_task_timeout() -> u64 {
    3_600
}
fn default_max_archive_entries() -> usize {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins; `"*"` permits any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// All defaults with the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
            ingestion: IngestionConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Chunking
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            bail!("chunking.overlap must be smaller than chunking.chunk_size");
        }
        if self.chunking.min_chunk_size > self.chunking.chunk_size {
            bail!("chunking.min_chunk_size must not exceed chunking.chunk_size");
        }

        // Retrieval
        if !(1..=50).contains(&self.retrieval.top_k) {
            bail!("retrieval.top_k must be in [1, 50]");
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            bail!("retrieval.min_score must be in [0.0, 1.0]");
        }

        // Embedding
        match self.embedding.provider.as_str() {
            "hash" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        // LLM
        match self.llm.provider.as_str() {
            "echo" | "gemini" | "openai" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be echo, gemini, or openai.",
                other
            ),
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if self.llm.max_tokens == 0 {
            bail!("llm.max_tokens must be > 0");
        }
        if self.llm.prompt_token_budget == 0 {
            bail!("llm.prompt_token_budget must be > 0");
        }

        // Ingestion
        if self.ingestion.workers == 0 {
            bail!("ingestion.workers must be > 0");
        }
        if self.ingestion.queue_capacity == 0 {
            bail!("ingestion.queue_capacity must be > 0");
        }
        for t in &self.ingestion.allowed_types {
            if DocumentFormat::from_extension(&t.to_ascii_lowercase()).is_none() {
                bail!("ingestion.allowed_types contains unknown type '{}'", t);
            }
        }

        // Cache
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be > 0");
        }

        // Logging
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => bail!("logging.format must be pretty or json, got '{}'", other),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_file() {
        let config: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.cache.embedding_ttl_secs, 86_400);
        assert_eq!(config.cache.response_ttl_secs, 3_600);
        assert_eq!(config.ingestion.max_file_size, 104_857_600);
        assert_eq!(config.llm.model_name(), "echo");
        assert_eq!(config.llm.prompt_style, PromptStyle::Default);
    }

    #[test]
    fn test_rejects_bad_overlap() {
        let mut config = Config::minimal("/tmp/x.sqlite");
        config.chunking.overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_embedding_needs_model_and_dims() {
        let mut config = Config::minimal("/tmp/x.sqlite");
        config.embedding.provider = "openai".to_string();
        assert!(config.validate().is_err());
        config.embedding.model = Some("text-embedding-3-small".to_string());
        config.embedding.dims = Some(1536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prompt_style_from_toml() {
        let config: Config =
            toml::from_str("[db]\npath = \"x\"\n[llm]\nprovider = \"gemini\"\nprompt_style = \"concise\"\n")
                .unwrap();
        assert_eq!(config.llm.prompt_style, PromptStyle::Concise);
        assert_eq!(config.llm.model_name(), "gemini-pro");
    }

    #[test]
    fn test_allowed_types() {
        let mut config = Config::minimal("x");
        config.ingestion.allowed_types = vec!["txt".to_string()];
        assert!(config.ingestion.is_allowed(DocumentFormat::Txt));
        assert!(!config.ingestion.is_allowed(DocumentFormat::Pdf));
        config.ingestion.allowed_types = vec!["exe".to_string()];
        assert!(config.validate().is_err());
    }
}
