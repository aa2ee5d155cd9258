//! Embedding service: cached, batched, retried calls to an [`EmbeddingBackend`].
//!
//! Backends:
//! - **[`HashEmbedder`]**: deterministic feature hashing; offline, no model.
//! - **[`OpenAiEmbeddings`]**: `POST {url}/embeddings` on an OpenAI-compatible API.
//! - **[`OllamaEmbeddings`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Use [`create_backend`] to pick one from configuration, then wrap it in an
//! [`Embedder`].
//!
//! # Caching
//!
//! Vectors are cached under `(sha256(text), model)` for
//! `cache.embedding_ttl_secs`. [`Embedder::embed`] only sends cache misses
//! to the backend, and sends each distinct text once even when it appears
//! several times in the input.
//!
//! # Retry Strategy
//!
//! Backends make exactly one attempt per call. The [`Embedder`] retries
//! transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error): retry
//! - HTTP 4xx (client error, not 429): fail immediately
//! - Network errors and per-attempt timeouts: retry

mod hash;
mod remote;

pub use hash::HashEmbedder;
pub use remote::{OllamaEmbeddings, OpenAiEmbeddings};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use docrag_core::capabilities::EmbeddingBackend;
use docrag_core::embedding::content_hash;
use docrag_core::{Error, ErrorKind, Result};

use crate::cache::{CacheStats, TtlCache};
use crate::config::{CacheConfig, EmbeddingConfig};
use crate::retry::{retry, RetryPolicy};

/// `(sha256(text), model)`.
type EmbeddingKey = (String, String);

/// Cached, batched front end to an embedding backend.
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    cache: TtlCache<EmbeddingKey, Vec<f32>>,
    ttl: Duration,
    batch_size: usize,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl Embedder {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        config: &EmbeddingConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            backend,
            cache: TtlCache::new("embedding", cache_config.max_entries),
            ttl: Duration::from_secs(cache_config.embedding_ttl_secs),
            batch_size: config.batch_size.max(1),
            policy: config.retry_policy(),
            attempt_timeout: config.timeout(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn key(&self, text: &str) -> EmbeddingKey {
        (content_hash(text), self.backend.model_name().to_string())
    }

    /// Embed `texts`, one vector per input in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        // Distinct misses in first-seen order, and every index each one fills.
        let mut pending: Vec<(EmbeddingKey, String)> = Vec::new();
        let mut targets: HashMap<EmbeddingKey, Vec<usize>> = HashMap::new();

        for (i, text) in texts.iter().enumerate() {
            let key = self.key(text);
            if let Some(v) = self.cache.get(&key) {
                out[i] = Some(v);
                continue;
            }
            let slots = targets.entry(key.clone()).or_default();
            if slots.is_empty() {
                pending.push((key, text.clone()));
            }
            slots.push(i);
        }

        if !pending.is_empty() {
            tracing::debug!(
                model = self.backend.model_name(),
                requested = texts.len(),
                misses = pending.len(),
                "embedding cache misses"
            );
        }

        for batch in pending.chunks(self.batch_size) {
            let batch_texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = fetch(
                self.backend.clone(),
                self.policy,
                self.attempt_timeout,
                batch_texts,
            )
            .await?;

            for ((key, _), vector) in batch.iter().zip(vectors) {
                self.cache.set(key.clone(), vector.clone(), self.ttl);
                for &i in targets.get(key).map(Vec::as_slice).unwrap_or_default() {
                    out[i] = Some(vector.clone());
                }
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| Error::Internal("embedding slot left unfilled".to_string())))
            .collect()
    }

    /// Embed one query. Concurrent identical queries share one backend call.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let backend = self.backend.clone();
        let policy = self.policy;
        let attempt_timeout = self.attempt_timeout;
        let owned = text.to_string();

        self.cache
            .get_or_compute(self.key(text), self.ttl, move || async move {
                let mut vectors = fetch(backend, policy, attempt_timeout, vec![owned]).await?;
                vectors
                    .pop()
                    .ok_or_else(|| Error::embedding_fatal("empty embedding response"))
            })
            .await
    }
}

/// One retried backend call with shape checks on the response.
async fn fetch(
    backend: Arc<dyn EmbeddingBackend>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    texts: Vec<String>,
) -> Result<Vec<Vec<f32>>> {
    let vectors = retry(
        policy,
        ErrorKind::EmbeddingError,
        "embed batch",
        Some(attempt_timeout),
        || backend.embed_batch(&texts),
    )
    .await?;

    if vectors.len() != texts.len() {
        return Err(Error::embedding_fatal(format!(
            "backend returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        )));
    }
    let dims = backend.dims();
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(Error::embedding_fatal(format!(
            "model {} returned a {}-dimensional vector, expected {}",
            backend.model_name(),
            bad.len(),
            dims
        )));
    }
    Ok(vectors)
}

/// Create the [`EmbeddingBackend`] named by `embedding.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbeddings`] |
/// | `"ollama"` | [`OllamaEmbeddings`] |
pub fn create_backend(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.model.as_deref(),
            config.dims.unwrap_or(EmbeddingConfig::HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAiEmbeddings::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbeddings::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
