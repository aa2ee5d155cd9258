//! In-memory [`VectorStore`] implementation for tests and ephemeral runs.
//!
//! All state sits behind one `std::sync::RwLock`, so a document and its
//! segments become visible to readers in a single step. Vector search is
//! brute-force cosine similarity over every stored segment.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::{clip_score, cosine_similarity};
use crate::error::{Error, Result};
use crate::models::{make_preview, Document, RetrievalResult, Segment};

use super::{admits, rank, validate_query, validate_write, DocumentSummary, VectorStore};

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    by_hash: HashMap<String, String>,
    segments: HashMap<String, Vec<Segment>>,
}

/// In-memory vector store.
pub struct InMemoryVectorStore {
    dims: usize,
    inner: RwLock<Inner>,
}

impl InMemoryVectorStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn store(&self, document: &Document, segments: &[Segment]) -> Result<()> {
        validate_write(document, segments, self.dims)?;

        let mut inner = self.write();
        if let Some(existing) = inner.by_hash.get(&document.content_hash) {
            return Err(Error::storage_fatal(format!(
                "content hash already stored as document {}",
                existing
            )));
        }
        if inner.docs.contains_key(&document.id) {
            return Err(Error::storage_fatal(format!(
                "document {} already exists",
                document.id
            )));
        }

        let mut ordered = segments.to_vec();
        ordered.sort_by_key(|s| s.ordinal);
        inner
            .by_hash
            .insert(document.content_hash.clone(), document.id.clone());
        inner.segments.insert(document.id.clone(), ordered);
        inner.docs.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        document_id: Option<&str>,
    ) -> Result<Vec<RetrievalResult>> {
        validate_query(query, self.dims, min_score)?;

        let inner = self.read();
        let mut results = Vec::new();
        for (doc_id, segments) in &inner.segments {
            if document_id.is_some_and(|filter| filter != doc_id) {
                continue;
            }
            let filename = inner
                .docs
                .get(doc_id)
                .map(|d| d.filename.clone())
                .unwrap_or_default();
            for seg in segments {
                let similarity = cosine_similarity(query, &seg.vector);
                if !admits(similarity, min_score) {
                    continue;
                }
                results.push(RetrievalResult {
                    segment_id: seg.id.clone(),
                    document_id: doc_id.clone(),
                    document_filename: filename.clone(),
                    score: clip_score(similarity),
                    text: seg.text.clone(),
                    preview: make_preview(&seg.text),
                });
            }
        }
        Ok(rank(results, top_k))
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let inner = self.read();
        Ok(inner
            .by_hash
            .get(content_hash)
            .and_then(|id| inner.docs.get(id))
            .cloned())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read().docs.get(id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let inner = self.read();
        let mut docs: Vec<DocumentSummary> =
            inner.docs.values().map(DocumentSummary::from).collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn document_segments(&self, document_id: &str) -> Result<Vec<Segment>> {
        Ok(self
            .read()
            .segments
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut inner = self.write();
        match inner.docs.remove(id) {
            Some(doc) => {
                inner.by_hash.remove(&doc.content_hash);
                inner.segments.remove(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
