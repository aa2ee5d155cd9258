//! Vector store abstraction for docrag.
//!
//! The [`VectorStore`] trait defines every storage operation the ingestion
//! pipeline and the RAG orchestrator need, so the backend (SQLite, in-memory)
//! is chosen at construction time.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Search semantics
//!
//! | Rule | Behavior |
//! |------|----------|
//! | Order | descending score, ties broken by ascending segment id |
//! | Threshold | a segment whose true cosine similarity is below `min_score` is excluded |
//! | Score | cosine similarity clipped to `[0, 1]` |
//! | Filter | `document_id` restricts the search to one document |
//!
//! [`rank`] and [`admits`] implement these rules once for every backend.

pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{Document, DocumentFormat, RetrievalResult, Segment};

/// Lightweight document listing entry (no canonical text).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentSummary {
    pub id: String,
    pub filename: String,
    pub format: DocumentFormat,
    pub content_hash: String,
    pub segment_count: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Document> for DocumentSummary {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            filename: doc.filename.clone(),
            format: doc.format,
            content_hash: doc.content_hash.clone(),
            segment_count: doc.segment_count,
            created_at: doc.created_at,
        }
    }
}

/// Abstract storage backend for documents and their embedded segments.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`store`](VectorStore::store) | Persist a document and all its segments atomically |
/// | [`search`](VectorStore::search) | Cosine similarity search over segment vectors |
/// | [`find_by_hash`](VectorStore::find_by_hash) | Resolve a content hash to a stored document |
/// | [`get_document`](VectorStore::get_document) | Fetch one document |
/// | [`list_documents`](VectorStore::list_documents) | List all documents, newest first |
/// | [`document_segments`](VectorStore::document_segments) | Segments of one document, by ordinal |
/// | [`delete_document`](VectorStore::delete_document) | Remove a document and its segments |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Deployment-wide embedding dimension every stored vector must match.
    fn dims(&self) -> usize;

    /// Persist a document with its segments.
    ///
    /// Either every segment becomes visible to [`search`](VectorStore::search)
    /// or none does. Fails with a non-transient `Storage` error when a vector
    /// has the wrong length or the content hash is already stored.
    async fn store(&self, document: &Document, segments: &[Segment]) -> Result<()>;

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        document_id: Option<&str>,
    ) -> Result<Vec<RetrievalResult>>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;

    async fn document_segments(&self, document_id: &str) -> Result<Vec<Segment>>;

    /// Returns `false` when no such document existed.
    async fn delete_document(&self, id: &str) -> Result<bool>;
}

/// Check a write before it reaches a backend.
pub fn validate_write(document: &Document, segments: &[Segment], dims: usize) -> Result<()> {
    for seg in segments {
        if seg.vector.len() != dims {
            return Err(Error::storage_fatal(format!(
                "segment {} has vector length {}, expected {}",
                seg.id,
                seg.vector.len(),
                dims
            )));
        }
        if seg.document_id != document.id {
            return Err(Error::storage_fatal(format!(
                "segment {} belongs to {}, not {}",
                seg.id, seg.document_id, document.id
            )));
        }
    }
    Ok(())
}

/// Check search parameters before scanning.
pub fn validate_query(query: &[f32], dims: usize, min_score: f32) -> Result<()> {
    if query.len() != dims {
        return Err(Error::Retrieval(format!(
            "query vector has length {}, expected {}",
            query.len(),
            dims
        )));
    }
    if !min_score.is_finite() {
        return Err(Error::Validation("min_score must be a finite number".to_string()));
    }
    Ok(())
}

/// Whether a segment with this true similarity passes the threshold.
pub fn admits(similarity: f32, min_score: f32) -> bool {
    similarity >= min_score
}

/// Sort admitted results into their final order and keep the best `top_k`.
pub fn rank(mut results: Vec<RetrievalResult>, top_k: usize) -> Vec<RetrievalResult> {
    results.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.segment_id.cmp(&b.segment_id),
        other => other,
    });
    results.truncate(top_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            segment_id: id.to_string(),
            document_id: "d".to_string(),
            document_filename: "d.txt".to_string(),
            score,
            text: String::new(),
            preview: String::new(),
        }
    }

    #[test]
    fn test_rank_orders_by_score_then_id() {
        let ranked = rank(
            vec![result("b", 0.5), result("c", 0.9), result("a", 0.5)],
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.segment_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rank_truncates() {
        let ranked = rank(vec![result("a", 0.1), result("b", 0.2)], 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].segment_id, "b");
    }

    #[test]
    fn test_admits_uses_true_similarity() {
        assert!(admits(0.5, 0.5));
        assert!(!admits(0.4999, 0.5));
        assert!(!admits(-0.2, 0.0));
    }

    #[test]
    fn test_validate_query() {
        assert!(validate_query(&[1.0, 0.0], 2, 0.5).is_ok());
        assert!(matches!(
            validate_query(&[1.0], 2, 0.5),
            Err(Error::Retrieval(_))
        ));
        assert!(matches!(
            validate_query(&[1.0, 0.0], 2, f32::NAN),
            Err(Error::Validation(_))
        ));
    }
}
