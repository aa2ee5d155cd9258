//! # docrag
//!
//! Document ingestion and retrieval-augmented chat over a local vector store.
//!
//! Uploaded files (PDF, DOCX, plain text, markdown, or ZIP archives of those)
//! are parsed, split into overlapping chunks, embedded, and stored in SQLite.
//! Chat requests embed the question, retrieve the most similar segments, and
//! ask an LLM to answer with those segments and the session's recent turns in
//! the prompt. Embeddings and generated answers are cached with TTLs, and
//! identical in-flight requests share a single backend call.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌────────────┐
//! │  Upload  │──▶│ Ingestion queue  │──▶│   SQLite   │
//! │ CLI/HTTP │   │ parse+chunk+embed│   │ docs+vecs  │
//! └──────────┘   └──────────────────┘   └─────┬──────┘
//!                                             │
//! ┌──────────┐   ┌──────────────────┐         │
//! │   Chat   │──▶│ RAG orchestrator │◀────────┘
//! │ CLI/HTTP │   │ retrieve+prompt  │──▶ LLM (cached)
//! └──────────┘   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`context`] | Shared application context |
//! | [`parser`] | PDF, DOCX, text extraction and ZIP expansion |
//! | [`ingest`] | Background ingestion queue and task tracking |
//! | [`embedding`] | Embedding backends with caching and retry |
//! | [`llm`] | Generative backends behind a retrying gateway |
//! | [`rag`] | Retrieval-augmented chat |
//! | [`memory`] | Bounded per-session conversation memory |
//! | [`cache`] | TTL cache with request coalescing |
//! | [`retry`] | Exponential backoff for transient failures |
//! | [`sqlite_store`] | SQLite vector store and conversation log |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod migrate;
pub mod parser;
pub mod rag;
pub mod retry;
pub mod server;
pub mod sqlite_store;
