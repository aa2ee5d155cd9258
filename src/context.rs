//! Explicit application context.
//!
//! Every long-lived collaborator is built once here and shared through
//! `Arc`. Services ([`IngestionCoordinator`](crate::ingest::IngestionCoordinator),
//! [`RagOrchestrator`](crate::rag::RagOrchestrator)) borrow from the context
//! and never from each other.

use std::sync::Arc;

use anyhow::{bail, Result};

use docrag_core::capabilities::{
    ConversationLog, ConversationMemory, DocumentParser, EmbeddingBackend, LlmBackend,
    NoopConversationLog,
};
use docrag_core::store::memory::InMemoryVectorStore;
use docrag_core::store::VectorStore;

use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::llm::{self, LlmGateway};
use crate::memory::InMemoryConversationMemory;
use crate::parser::BuiltinParser;
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn VectorStore>,
    pub log: Arc<dyn ConversationLog>,
    pub memory: Arc<dyn ConversationMemory>,
    pub parser: Arc<dyn DocumentParser>,
    pub embedder: Arc<Embedder>,
    pub gateway: LlmGateway,
}

impl AppContext {
    /// Open the SQLite database (migrating it if needed) and build the
    /// configured backends.
    pub async fn open(config: Config) -> Result<Self> {
        let embedding_backend = embedding::create_backend(&config.embedding)?;
        let llm_backend = llm::create_backend(&config.llm)?;

        let pool = db::connect(&config).await?;
        migrate::migrate(&pool).await?;
        check_stored_dims(&pool, embedding_backend.dims()).await?;

        let sqlite = Arc::new(SqliteStore::new(pool, embedding_backend.dims()));
        tracing::info!(
            db = %config.db.path.display(),
            embedding_model = embedding_backend.model_name(),
            dims = embedding_backend.dims(),
            llm = llm_backend.name(),
            "application context ready"
        );

        Ok(Self::assemble(
            config,
            sqlite.clone(),
            sqlite,
            embedding_backend,
            llm_backend,
        ))
    }

    /// A context with in-memory storage and no durable history.
    pub fn in_memory(
        config: Config,
        embedding_backend: Arc<dyn EmbeddingBackend>,
        llm_backend: Arc<dyn LlmBackend>,
    ) -> Self {
        let store = Arc::new(InMemoryVectorStore::new(embedding_backend.dims()));
        Self::assemble(
            config,
            store,
            Arc::new(NoopConversationLog),
            embedding_backend,
            llm_backend,
        )
    }

    fn assemble(
        config: Config,
        store: Arc<dyn VectorStore>,
        log: Arc<dyn ConversationLog>,
        embedding_backend: Arc<dyn EmbeddingBackend>,
        llm_backend: Arc<dyn LlmBackend>,
    ) -> Self {
        let embedder = Arc::new(Embedder::new(
            embedding_backend,
            &config.embedding,
            &config.cache,
        ));
        let gateway = LlmGateway::new(llm_backend, &config.llm);
        Self {
            memory: Arc::new(InMemoryConversationMemory::new(
                config.memory.max_turns_per_session,
            )),
            parser: Arc::new(BuiltinParser),
            config: Arc::new(config),
            store,
            log,
            embedder,
            gateway,
        }
    }
}

/// Refuse to mix vectors of different sizes in one database.
async fn check_stored_dims(pool: &sqlx::SqlitePool, dims: usize) -> Result<()> {
    let stored: Option<i64> = sqlx::query_scalar("SELECT dims FROM segments LIMIT 1")
        .fetch_optional(pool)
        .await?;
    match stored {
        Some(d) if d as usize != dims => bail!(
            "database holds {}-dimensional embeddings but the configured model produces {}; \
             use a new database or the original embedding settings",
            d,
            dims
        ),
        _ => Ok(()),
    }
}
