//! Generative model gateway and backends.
//!
//! [`LlmGateway`] owns the default generation parameters and the retry
//! policy; backends make one attempt per call and classify their failures
//! as [`LlmFailure`] variants:
//!
//! | Failure | Cause | Retried |
//! |---------|-------|---------|
//! | `RateLimited` | HTTP 429 | yes |
//! | `Unavailable` | network error, HTTP 5xx | yes |
//! | `Timeout` | per-attempt deadline | yes |
//! | `InvalidResponse` | undecodable body, rejected request | no |

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use docrag_core::capabilities::LlmBackend;
use docrag_core::models::{Generation, GenerationParams, Usage};
use docrag_core::prompt::estimate_tokens;
use docrag_core::{Error, ErrorKind, LlmFailure, Result};

use crate::config::LlmConfig;
use crate::retry::{retry, RetryPolicy};

const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_URL: &str = "https://api.openai.com/v1";

/// Retrying front end to an [`LlmBackend`]. Cheap to clone.
#[derive(Clone)]
pub struct LlmGateway {
    backend: Arc<dyn LlmBackend>,
    params: GenerationParams,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl LlmGateway {
    pub fn new(backend: Arc<dyn LlmBackend>, config: &LlmConfig) -> Self {
        Self {
            backend,
            params: GenerationParams {
                model: config.model_name(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            policy: config.retry_policy(),
            attempt_timeout: config.timeout(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Parameters sent with every request; part of the response cache key.
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub async fn generate(&self, prompt: &str) -> Result<Generation> {
        let started = std::time::Instant::now();
        let generation = retry(
            self.policy,
            ErrorKind::LlmError,
            "generate",
            Some(self.attempt_timeout),
            || self.backend.generate(prompt, &self.params),
        )
        .await?;

        tracing::info!(
            backend = self.backend.name(),
            model = %self.params.model,
            prompt_tokens = generation.usage.prompt_tokens,
            completion_tokens = generation.usage.completion_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation completed"
        );
        Ok(generation)
    }
}

/// Create the [`LlmBackend`] named by `llm.provider`.
pub fn create_backend(config: &LlmConfig) -> anyhow::Result<Arc<dyn LlmBackend>> {
    match config.provider.as_str() {
        "echo" => Ok(Arc::new(EchoBackend)),
        "gemini" => Ok(Arc::new(GeminiBackend::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiChatBackend::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

fn build_client(config: &LlmConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn send_error(provider: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        LlmFailure::Timeout(format!("{} request timed out: {}", provider, e)).into()
    } else {
        LlmFailure::Unavailable(format!("{} request failed: {}", provider, e)).into()
    }
}

fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let message = format!("{} API error {}: {}", provider, status, body);
    let failure = if status.as_u16() == 429 {
        LlmFailure::RateLimited(message)
    } else if status.is_server_error() {
        LlmFailure::Unavailable(message)
    } else {
        LlmFailure::InvalidResponse(message)
    };
    failure.into()
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
        .map_err(|e| send_error(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(status_error(provider, status, &body_text));
    }

    response.json().await.map_err(|e| {
        LlmFailure::InvalidResponse(format!("{} returned invalid JSON: {}", provider, e)).into()
    })
}

fn token_count(value: Option<&serde_json::Value>) -> u32 {
    value.and_then(|v| v.as_u64()).unwrap_or(0) as u32
}

// ============ Gemini ============

/// Google Generative Language API (`models/{model}:generateContent`).
/// Reads `GEMINI_API_KEY`.
pub struct GeminiBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl GeminiBackend {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var("GEMINI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("GEMINI_API_KEY environment variable not set"),
        };
        Ok(Self {
            client: build_client(config)?,
            url: config.url.clone().unwrap_or_else(|| GEMINI_URL.to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Generation> {
        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": params.temperature,
                "maxOutputTokens": params.max_tokens,
            },
        });
        let request = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.url.trim_end_matches('/'),
                params.model
            ))
            .header("x-goog-api-key", &self.api_key);
        let json = post_json("Gemini", request, &body).await?;
        parse_gemini_response(&json)
    }
}

pub(crate) fn parse_gemini_response(json: &serde_json::Value) -> Result<Generation> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            LlmFailure::InvalidResponse("Gemini response has no candidate content".to_string())
        })?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        return Err(LlmFailure::InvalidResponse("Gemini returned empty text".to_string()).into());
    }

    let usage = json.get("usageMetadata");
    Ok(Generation {
        text,
        usage: Usage {
            prompt_tokens: token_count(usage.and_then(|u| u.get("promptTokenCount"))),
            completion_tokens: token_count(usage.and_then(|u| u.get("candidatesTokenCount"))),
            total_tokens: token_count(usage.and_then(|u| u.get("totalTokenCount"))),
        },
    })
}

// ============ OpenAI ============

/// OpenAI-compatible chat completions API. Reads `OPENAI_API_KEY`.
pub struct OpenAiChatBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl OpenAiChatBackend {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Ok(Self {
            client: build_client(config)?,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl LlmBackend for OpenAiChatBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Generation> {
        let body = serde_json::json!({
            "model": params.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });
        let request = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key);
        let json = post_json("OpenAI", request, &body).await?;
        parse_openai_response(&json)
    }
}

pub(crate) fn parse_openai_response(json: &serde_json::Value) -> Result<Generation> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            LlmFailure::InvalidResponse("OpenAI response has no message content".to_string())
        })?;

    let usage = json.get("usage");
    Ok(Generation {
        text: text.to_string(),
        usage: Usage {
            prompt_tokens: token_count(usage.and_then(|u| u.get("prompt_tokens"))),
            completion_tokens: token_count(usage.and_then(|u| u.get("completion_tokens"))),
            total_tokens: token_count(usage.and_then(|u| u.get("total_tokens"))),
        },
    })
}

// ============ Echo ============

/// Offline backend that answers by restating the question and how much
/// context it was given. Deterministic.
pub struct EchoBackend;

#[async_trait]
impl LlmBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<Generation> {
        let question = prompt
            .split("## User Question:\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\n").next())
            .unwrap_or(prompt)
            .trim();
        let documents = prompt.matches("\n### Document ").count();

        let text = format!(
            "You asked: \"{}\". I was given {} context document(s).",
            question, documents
        );
        let prompt_tokens = estimate_tokens(prompt) as u32;
        let completion_tokens = estimate_tokens(&text) as u32;
        Ok(Generation {
            text,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }
}
