//! HTTP embedding backends.

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use docrag_core::capabilities::EmbeddingBackend;
use docrag_core::{Error, Result};

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

fn build_client(config: &EmbeddingConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn required(config: &EmbeddingConfig, provider: &str) -> anyhow::Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", provider))?;
    Ok((model, dims))
}

/// Map a non-success HTTP status: 429 and 5xx may clear up, other 4xx won't.
fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let message = format!("{} API error {}: {}", provider, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        Error::embedding_transient(message)
    } else {
        Error::embedding_fatal(message)
    }
}

async fn post_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let response = request
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| Error::embedding_transient(format!("{} request failed: {}", provider, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(status_error(provider, status, &body_text));
    }

    response
        .json()
        .await
        .map_err(|e| Error::embedding_fatal(format!("{} returned invalid JSON: {}", provider, e)))
}

fn as_vector(value: &serde_json::Value, provider: &str) -> Result<Vec<f32>> {
    let items = value.as_array().ok_or_else(|| {
        Error::embedding_fatal(format!("Invalid {} response: embedding is not an array", provider))
    })?;
    items
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                Error::embedding_fatal(format!("Invalid {} response: non-numeric value", provider))
            })
        })
        .collect()
}

// ============ OpenAI ============

/// OpenAI-compatible embeddings API. Reads `OPENAI_API_KEY`.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let (model, dims) = required(config, "OpenAI")?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Ok(Self {
            client: build_client(config)?,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/embeddings", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key);
        let json = post_json("OpenAI", request, &body).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
pub(crate) fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::embedding_fatal("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| Error::embedding_fatal("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, as_vector(embedding, "OpenAI")?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// A local Ollama instance (`ollama pull nomic-embed-text`).
pub struct OllamaEmbeddings {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let (model, dims) = required(config, "Ollama")?;
        Ok(Self {
            client: build_client(config)?,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_URL.to_string()),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')));
        let json = post_json("Ollama", request, &body).await?;
        parse_ollama_response(&json)
    }
}

pub(crate) fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::embedding_fatal("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|v| as_vector(v, "Ollama"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_openai_response_reordered_by_index() {
        let body = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vecs = parse_openai_response(&body).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_malformed_responses_are_fatal() {
        let err = parse_openai_response(&json!({"object": "list"})).unwrap_err();
        assert!(!err.is_transient());
        let err = parse_ollama_response(&json!({"embeddings": [["x"]]})).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_ollama_response() {
        let vecs = parse_ollama_response(&json!({"embeddings": [[0.5, 0.25]]})).unwrap();
        assert_eq!(vecs, vec![vec![0.5, 0.25]]);
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error("x", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!status_error("x", StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!status_error("x", StatusCode::BAD_REQUEST, "").is_transient());
    }
}
