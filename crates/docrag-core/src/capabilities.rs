//! Capability traits implemented by the application crate.
//!
//! Each external collaborator (parser, embedding model, generative model,
//! conversation storage) is a strategy trait. Concrete implementations are
//! chosen once at construction time and injected behind `Arc<dyn _>`.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ConversationTurn, DocumentFormat, Generation, GenerationParams, ParsedDocument};

/// Raw bytes plus a format hint to canonical text.
///
/// Failure modes: `UnsupportedFormat`, `Parse`.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, bytes: &[u8], format: DocumentFormat) -> Result<ParsedDocument>;
}

/// A batch embedding backend.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier, part of every embedding cache key.
    fn model_name(&self) -> &str;

    /// Output vector dimension.
    fn dims(&self) -> usize;

    /// Embed a batch, one vector per input, in input order.
    ///
    /// Unreachable or overloaded backends fail with a transient
    /// `Embedding` error so the caller may retry.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A generative model backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Failure modes are the [`LlmFailure`](crate::LlmFailure) variants.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Generation>;
}

/// Short-term per-session conversation memory.
///
/// Writes for one session are serialized; sessions are independent.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// Reserve the next sequence number for a session. Called when a request
    /// arrives so that turns land in arrival order.
    async fn next_sequence(&self, session_id: &str) -> Result<u64>;

    async fn append(&self, turn: ConversationTurn) -> Result<()>;

    /// The `limit` most recent turns, oldest first.
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>>;

    async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>>;

    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// Durable conversation history.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn record(&self, turn: &ConversationTurn) -> Result<()>;

    /// Oldest first; `limit` keeps the most recent turns.
    async fn history(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<ConversationTurn>>;

    /// Returns the number of turns removed.
    async fn clear(&self, session_id: &str) -> Result<u64>;
}

/// A [`ConversationLog`] that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConversationLog;

#[async_trait]
impl ConversationLog for NoopConversationLog {
    async fn record(&self, _turn: &ConversationTurn) -> Result<()> {
        Ok(())
    }

    async fn history(&self, _session_id: &str, _limit: Option<usize>) -> Result<Vec<ConversationTurn>> {
        Ok(Vec::new())
    }

    async fn clear(&self, _session_id: &str) -> Result<u64> {
        Ok(0)
    }
}
