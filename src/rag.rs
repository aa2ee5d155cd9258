//! Retrieval-augmented chat.
//!
//! [`RagOrchestrator::generate`] runs one chat turn:
//!
//! 1. validate the request and reserve the session's next sequence number
//! 2. embed the query and search the store (failure degrades, never aborts)
//! 3. load recent session history
//! 4. assemble the prompt within the token budget
//! 5. generate through the response cache, so identical concurrent prompts
//!    share one backend call
//! 6. record the turn in memory and in the durable log
//! 7. attribute sources
//!
//! Only a generation failure fails the request. Memory and log failures are
//! logged and otherwise ignored.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use docrag_core::models::{ConversationTurn, Generation, RetrievalResult, Source, Usage};
use docrag_core::prompt::{self, PromptInput};
use docrag_core::sources::build_sources;
use docrag_core::{Error, Result};

use crate::cache::{CacheStats, TtlCache};
use crate::context::AppContext;

const MAX_TOP_K: usize = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    pub session_id: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub session_id: String,
    pub usage: Usage,
    /// Retrieval failed and the answer was produced without documents.
    pub degraded: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<RetrievalResult>,
    pub total: usize,
}

pub struct RagOrchestrator {
    ctx: Arc<AppContext>,
    responses: TtlCache<String, Generation>,
    response_ttl: Duration,
}

impl RagOrchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let cache = &ctx.config.cache;
        Self {
            responses: TtlCache::new("response", cache.max_entries),
            response_ttl: Duration::from_secs(cache.response_ttl_secs),
            ctx,
        }
    }

    pub fn response_cache_stats(&self) -> CacheStats {
        self.responses.stats()
    }

    pub async fn generate(&self, req: ChatRequest) -> Result<ChatResponse> {
        let query = req.query.trim();
        if query.is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }
        let session_id = req.session_id.trim();
        if session_id.is_empty() {
            return Err(Error::Validation("session_id must not be empty".to_string()));
        }
        let (top_k, min_score) = self.retrieval_params(req.top_k, req.min_score)?;

        let requested_at = Utc::now();
        let sequence = match self.ctx.memory.next_sequence(session_id).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "could not reserve a sequence number");
                0
            }
        };

        let (context, degraded) = match self
            .retrieve(query, top_k, min_score, req.document_id.as_deref())
            .await
        {
            Ok(results) => (results, false),
            Err(e) => {
                tracing::warn!(session_id, error = %e, kind = %e.kind(), "retrieval failed, answering without documents");
                (Vec::new(), true)
            }
        };

        let history = self.recent_history(session_id).await;

        let assembled = prompt::assemble(
            &PromptInput {
                style: self.ctx.config.llm.prompt_style,
                query,
                context: &context,
                history: &history,
                retrieval_unavailable: degraded,
            },
            self.ctx.config.llm.prompt_token_budget,
        );
        if assembled.context_used < context.len() || assembled.history_used < history.len() {
            tracing::debug!(
                session_id,
                context_dropped = context.len() - assembled.context_used,
                history_dropped = history.len() - assembled.history_used,
                "prompt trimmed to fit token budget"
            );
        }

        let generation = self.generate_cached(assembled.text).await?;

        let turn = ConversationTurn {
            session_id: session_id.to_string(),
            sequence,
            user_message: query.to_string(),
            assistant_message: generation.text.clone(),
            timestamp: requested_at,
            memory_snapshot: Some(serde_json::json!({
                "context_segments": context
                    .iter()
                    .take(assembled.context_used)
                    .map(|r| r.segment_id.as_str())
                    .collect::<Vec<_>>(),
                "history_turns": assembled.history_used,
                "degraded": degraded,
            })),
        };
        if let Err(e) = self.ctx.memory.append(turn.clone()).await {
            tracing::warn!(session_id, error = %e, "could not append turn to memory");
        }
        if let Err(e) = self.ctx.log.record(&turn).await {
            tracing::warn!(session_id, error = %e, "could not record turn");
        }

        tracing::info!(
            session_id,
            sequence,
            context = assembled.context_used,
            degraded,
            "chat turn answered"
        );

        Ok(ChatResponse {
            answer: generation.text,
            sources: build_sources(&context),
            session_id: session_id.to_string(),
            usage: generation.usage,
            degraded,
        })
    }

    /// Retrieval without generation. Failures are returned, not degraded.
    pub async fn search(&self, req: SearchRequest) -> Result<SearchResponse> {
        let query = req.query.trim();
        if query.is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }
        let (top_k, min_score) = self.retrieval_params(req.top_k, req.min_score)?;
        let results = self
            .retrieve(query, top_k, min_score, req.document_id.as_deref())
            .await?;
        Ok(SearchResponse {
            query: query.to_string(),
            total: results.len(),
            results,
        })
    }

    /// The session's turns, oldest first. Durable history wins when present.
    pub async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let durable = self.ctx.log.history(session_id, None).await?;
        if !durable.is_empty() {
            return Ok(durable);
        }
        self.ctx.memory.history(session_id).await
    }

    /// Forget a session everywhere; returns how many turns were removed.
    pub async fn clear_session(&self, session_id: &str) -> Result<u64> {
        let in_memory = self.ctx.memory.history(session_id).await?.len() as u64;
        self.ctx.memory.clear(session_id).await?;
        let durable = self.ctx.log.clear(session_id).await?;
        tracing::info!(session_id, removed = durable.max(in_memory), "session cleared");
        Ok(durable.max(in_memory))
    }

    fn retrieval_params(&self, top_k: Option<usize>, min_score: Option<f32>) -> Result<(usize, f32)> {
        let defaults = &self.ctx.config.retrieval;
        let top_k = top_k.unwrap_or(defaults.top_k);
        if !(1..=MAX_TOP_K).contains(&top_k) {
            return Err(Error::Validation(format!(
                "top_k must be between 1 and {}",
                MAX_TOP_K
            )));
        }
        let min_score = min_score.unwrap_or(defaults.min_score);
        if !(0.0..=1.0).contains(&min_score) {
            return Err(Error::Validation(
                "min_score must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok((top_k, min_score))
    }

    /// Recent turns from memory, or from the durable log when this process
    /// has not seen the session yet.
    async fn recent_history(&self, session_id: &str) -> Vec<ConversationTurn> {
        let limit = self.ctx.config.retrieval.history_turns;
        match self.ctx.memory.recent(session_id, limit).await {
            Ok(turns) if !turns.is_empty() => return turns,
            Ok(_) => {}
            Err(e) => tracing::warn!(session_id, error = %e, "could not load session history"),
        }
        match self.ctx.log.history(session_id, Some(limit)).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "could not load durable session history");
                Vec::new()
            }
        }
    }

    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        min_score: f32,
        document_id: Option<&str>,
    ) -> Result<Vec<RetrievalResult>> {
        let vector = self.ctx.embedder.embed_query(query).await?;
        self.ctx
            .store
            .search(&vector, top_k, min_score, document_id)
            .await
    }

    async fn generate_cached(&self, prompt: String) -> Result<Generation> {
        let key = response_key(&prompt, self.ctx.gateway.params());
        let gateway = self.ctx.gateway.clone();
        self.responses
            .get_or_compute(key, self.response_ttl, move || async move {
                gateway.generate(&prompt).await
            })
            .await
    }
}

/// SHA-256 over the prompt and every parameter that changes the output.
fn response_key(prompt: &str, params: &docrag_core::models::GenerationParams) -> String {
    let material = serde_json::json!({
        "prompt": prompt,
        "model": params.model,
        "temperature": params.temperature,
        "max_tokens": params.max_tokens,
    });
    format!("{:x}", Sha256::digest(material.to_string().as_bytes()))
}
