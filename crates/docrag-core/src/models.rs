//! Core data models used throughout docrag.
//!
//! These types represent the documents, segments, ingestion tasks, and
//! conversation turns that flow through the ingestion and retrieval
//! pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Number of characters kept in a [`RetrievalResult::preview`].
pub const PREVIEW_CHARS: usize = 200;

/// Upload formats accepted by the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Doc,
    Zip,
    Txt,
    Md,
}

impl DocumentFormat {
    /// Resolve a format from a filename's extension (case-insensitive).
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
        Self::from_extension(&ext)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "doc" => Some(DocumentFormat::Doc),
            "zip" => Some(DocumentFormat::Zip),
            "txt" => Some(DocumentFormat::Txt),
            "md" | "markdown" => Some(DocumentFormat::Md),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Doc => "doc",
            DocumentFormat::Zip => "zip",
            DocumentFormat::Txt => "txt",
            DocumentFormat::Md => "md",
        }
    }
}

/// Output of the parsing capability: canonical text plus structural metadata.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub metadata: serde_json::Value,
}

/// A stored document. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub format: DocumentFormat,
    pub text: String,
    pub metadata: serde_json::Value,
    /// SHA-256 hex of the uploaded bytes.
    pub content_hash: String,
    pub segment_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A text span produced by the chunker, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub ordinal: usize,
    pub text: String,
    /// Byte offset of the span start in the canonical text.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    pub token_count: usize,
    /// SHA-256 hex of `text`.
    pub hash: String,
}

/// An embedded, stored chunk of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    /// Deterministic segment id: ties in search are broken on it.
    pub fn make_id(document_id: &str, ordinal: usize) -> String {
        format!("{}_{}", document_id, ordinal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for TaskError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Background ingestion task record.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionTask {
    pub id: String,
    pub filename: String,
    pub content_hash: String,
    pub status: TaskStatus,
    pub progress: f32,
    pub message: String,
    pub document_id: Option<String>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One question/answer exchange within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub session_id: String,
    /// Per-session arrival order, reserved when the request arrived.
    pub sequence: u64,
    pub user_message: String,
    pub assistant_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_snapshot: Option<serde_json::Value>,
}

/// A segment returned by similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub segment_id: String,
    pub document_id: String,
    pub document_filename: String,
    /// Cosine similarity clipped to `[0, 1]`.
    pub score: f32,
    pub text: String,
    pub preview: String,
}

/// Attribution for an answer: the best segment of one document.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Source {
    pub segment_id: String,
    pub document_id: String,
    pub document_filename: String,
    pub score: f32,
    pub preview: String,
}

/// Token accounting reported by the generative backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Parameters passed to the generative backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Generated text plus usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// Truncate `text` to [`PREVIEW_CHARS`] characters, appending `...` when cut.
pub fn make_preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        preview.push_str("...");
        preview
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_filename() {
        assert_eq!(DocumentFormat::from_filename("a.PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_filename("notes.md"), Some(DocumentFormat::Md));
        assert_eq!(DocumentFormat::from_filename("archive.tar.zip"), Some(DocumentFormat::Zip));
        assert_eq!(DocumentFormat::from_filename("image.png"), None);
        assert_eq!(DocumentFormat::from_filename("README"), None);
    }

    #[test]
    fn test_preview_truncates_on_chars() {
        let long = "é".repeat(250);
        let p = make_preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
        assert_eq!(make_preview("short"), "short");
    }

    #[test]
    fn test_segment_id_is_deterministic() {
        assert_eq!(Segment::make_id("doc", 3), "doc_3");
    }
}
