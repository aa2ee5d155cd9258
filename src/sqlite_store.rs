//! SQLite-backed [`VectorStore`] and [`ConversationLog`].
//!
//! Each document is written in one transaction, so its segments become
//! visible to [`search`](VectorStore::search) all at once. Vectors are stored
//! as little-endian f32 BLOBs and scored by brute-force cosine similarity.
//!
//! Busy/locked databases and pool timeouts surface as transient `Storage`
//! errors so callers can retry them; constraint violations are fatal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docrag_core::capabilities::ConversationLog;
use docrag_core::embedding::{blob_to_vec, clip_score, cosine_similarity, vec_to_blob};
use docrag_core::models::{
    make_preview, ConversationTurn, Document, DocumentFormat, RetrievalResult, Segment,
};
use docrag_core::store::{admits, rank, validate_query, validate_write, DocumentSummary, VectorStore};
use docrag_core::{Error, Result};

/// SQLite implementation of [`VectorStore`] and [`ConversationLog`].
pub struct SqliteStore {
    pool: SqlitePool,
    dims: usize,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, dims: usize) -> Self {
        Self { pool, dims }
    }
}

/// Classify a driver error by whether retrying can help.
pub(crate) fn storage_error(e: sqlx::Error) -> Error {
    let transient = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    };
    Error::Storage {
        message: e.to_string(),
        transient,
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let format: String = row.get("format");
    let format = DocumentFormat::from_extension(&format)
        .ok_or_else(|| Error::storage_fatal(format!("unknown stored format '{}'", format)))?;
    let segment_count: i64 = row.get("segment_count");
    let metadata: String = row.get("metadata_json");
    Ok(Document {
        id: row.get("id"),
        filename: row.get("filename"),
        format,
        text: row.get("text"),
        metadata: parse_json(&metadata),
        content_hash: row.get("content_hash"),
        segment_count: segment_count as usize,
        created_at: from_millis(row.get("created_at")),
    })
}

const DOCUMENT_COLUMNS: &str =
    "id, filename, format, text, metadata_json, content_hash, segment_count, created_at";

#[async_trait]
impl VectorStore for SqliteStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn store(&self, document: &Document, segments: &[Segment]) -> Result<()> {
        validate_write(document, segments, self.dims)?;

        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE content_hash = ?")
                .bind(&document.content_hash)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_error)?;
        if let Some(id) = existing {
            return Err(Error::storage_fatal(format!(
                "content hash already stored as document {}",
                id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, format, text, metadata_json,
                                   content_hash, segment_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.filename)
        .bind(document.format.as_str())
        .bind(&document.text)
        .bind(document.metadata.to_string())
        .bind(&document.content_hash)
        .bind(document.segment_count as i64)
        .bind(document.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        for seg in segments {
            sqlx::query(
                r#"
                INSERT INTO segments (id, document_id, ordinal, text, embedding, dims,
                                      metadata_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&seg.id)
            .bind(&seg.document_id)
            .bind(seg.ordinal as i64)
            .bind(&seg.text)
            .bind(vec_to_blob(&seg.vector))
            .bind(seg.vector.len() as i64)
            .bind(seg.metadata.to_string())
            .bind(seg.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }

        tx.commit().await.map_err(storage_error)?;
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

        let rows = match document_id {
            Some(doc_id) => sqlx::query(
                r#"
                SELECT s.id, s.document_id, s.text, s.embedding, d.filename
                FROM segments s
                JOIN documents d ON d.id = s.document_id
                WHERE s.document_id = ?
                "#,
            )
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                r#"
                SELECT s.id, s.document_id, s.text, s.embedding, d.filename
                FROM segments s
                JOIN documents d ON d.id = s.document_id
                "#,
            )
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(|e| Error::Retrieval(storage_error(e).to_string()))?;

        let mut results = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(query, &blob_to_vec(&blob));
            if !admits(similarity, min_score) {
                continue;
            }
            let text: String = row.get("text");
            results.push(RetrievalResult {
                segment_id: row.get("id"),
                document_id: row.get("document_id"),
                document_filename: row.get("filename"),
                score: clip_score(similarity),
                preview: make_preview(&text),
                text,
            });
        }

        Ok(rank(results, top_k))
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE content_hash = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, filename, format, content_hash, segment_count, created_at
            FROM documents
            ORDER BY created_at DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter()
            .map(|row| {
                let format: String = row.get("format");
                let segment_count: i64 = row.get("segment_count");
                Ok(DocumentSummary {
                    id: row.get("id"),
                    filename: row.get("filename"),
                    format: DocumentFormat::from_extension(&format).ok_or_else(|| {
                        Error::storage_fatal(format!("unknown stored format '{}'", format))
                    })?,
                    content_hash: row.get("content_hash"),
                    segment_count: segment_count as usize,
                    created_at: from_millis(row.get("created_at")),
                })
            })
            .collect()
    }

    async fn document_segments(&self, document_id: &str) -> Result<Vec<Segment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, ordinal, text, embedding, metadata_json, created_at
            FROM segments
            WHERE document_id = ?
            ORDER BY ordinal ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .iter()
            .map(|row| {
                let ordinal: i64 = row.get("ordinal");
                let blob: Vec<u8> = row.get("embedding");
                let metadata: String = row.get("metadata_json");
                Segment {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    ordinal: ordinal as usize,
                    text: row.get("text"),
                    vector: blob_to_vec(&blob),
                    metadata: parse_json(&metadata),
                    created_at: from_millis(row.get("created_at")),
                }
            })
            .collect())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        sqlx::query("DELETE FROM segments WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?
            .rows_affected();
        tx.commit().await.map_err(storage_error)?;
        Ok(deleted > 0)
    }
}

fn row_to_turn(row: &SqliteRow) -> ConversationTurn {
    let sequence: i64 = row.get("sequence");
    let snapshot: Option<String> = row.get("memory_snapshot");
    ConversationTurn {
        session_id: row.get("session_id"),
        sequence: sequence as u64,
        user_message: row.get("user_message"),
        assistant_message: row.get("assistant_message"),
        timestamp: from_millis(row.get("requested_at")),
        memory_snapshot: snapshot.as_deref().map(parse_json),
    }
}

#[async_trait]
impl ConversationLog for SqliteStore {
    async fn record(&self, turn: &ConversationTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_turns (session_id, sequence, user_message,
                                            assistant_message, requested_at, memory_snapshot)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&turn.session_id)
        .bind(turn.sequence as i64)
        .bind(&turn.user_message)
        .bind(&turn.assistant_message)
        .bind(turn.timestamp.timestamp_millis())
        .bind(turn.memory_snapshot.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn history(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<ConversationTurn>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT id, session_id, sequence, user_message, assistant_message,
                       requested_at, memory_snapshot
                FROM conversation_turns
                WHERE session_id = ?
                ORDER BY requested_at DESC, sequence DESC, id DESC
                LIMIT ?
            )
            ORDER BY requested_at ASC, sequence ASC, id ASC
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(row_to_turn).collect())
    }

    async fn clear(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversation_turns WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected())
    }
}
