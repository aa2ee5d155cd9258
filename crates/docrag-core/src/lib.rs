//! # docrag core
//!
//! Shared, runtime-agnostic logic for docrag: data models, the error
//! taxonomy, chunking, the vector store abstraction, prompt assembly,
//! source attribution, and the capability traits implemented by the
//! application crate (parser, embedding backend, LLM backend,
//! conversation memory and log).
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. Every
//! suspension point lives behind an `async_trait` so the application can
//! decide how to drive it.

pub mod capabilities;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod prompt;
pub mod sources;
pub mod store;

pub use error::{Error, ErrorKind, LlmFailure, Result};
