//! Error taxonomy shared by every docrag component.
//!
//! Each variant maps to a stable [`ErrorKind`] whose string form is the
//! machine-readable code surfaced to clients. Retry decisions are made from
//! [`Error::is_transient`]; nothing else inspects message text.
//!
//! `Error` is `Clone` because a single failed in-flight computation is
//! delivered to every coalesced waiter.

use serde::Serialize;
use thiserror::Error;

/// Failure reported by the generative-model capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmFailure {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Network or 5xx failure reaching the backend.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Main error type for docrag operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Parsing failed or timed out. Fatal for the ingestion task.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("embedding error: {message}")]
    Embedding { message: String, transient: bool },

    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("memory error: {0}")]
    Memory(String),

    #[error("llm error: {0}")]
    Llm(#[from] LlmFailure),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error kind, serialized as its snake_case code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    UnsupportedFormat,
    ParseError,
    EmbeddingError,
    StorageError,
    RetrievalError,
    MemoryError,
    LlmError,
    CacheError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::EmbeddingError => "embedding_error",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::RetrievalError => "retrieval_error",
            ErrorKind::MemoryError => "memory_error",
            ErrorKind::LlmError => "llm_error",
            ErrorKind::CacheError => "cache_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::Parse(_) => ErrorKind::ParseError,
            Error::Embedding { .. } => ErrorKind::EmbeddingError,
            Error::Storage { .. } => ErrorKind::StorageError,
            Error::Retrieval(_) => ErrorKind::RetrievalError,
            Error::Memory(_) => ErrorKind::MemoryError,
            Error::Llm(_) => ErrorKind::LlmError,
            Error::Cache(_) => ErrorKind::CacheError,
            Error::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Embedding { transient, .. } | Error::Storage { transient, .. } => *transient,
            Error::Llm(failure) => !matches!(failure, LlmFailure::InvalidResponse(_)),
            _ => false,
        }
    }

    pub fn embedding_transient(message: impl Into<String>) -> Self {
        Error::Embedding {
            message: message.into(),
            transient: true,
        }
    }

    pub fn embedding_fatal(message: impl Into<String>) -> Self {
        Error::Embedding {
            message: message.into(),
            transient: false,
        }
    }

    pub fn storage_transient(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            transient: true,
        }
    }

    pub fn storage_fatal(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// The timeout flavor of this error's kind, used by per-stage deadlines.
    pub fn timeout(kind: ErrorKind, what: &str, secs: u64) -> Self {
        let message = format!("{} timed out after {}s", what, secs);
        match kind {
            ErrorKind::ParseError => Error::Parse(message),
            ErrorKind::EmbeddingError => Error::embedding_transient(message),
            ErrorKind::StorageError => Error::storage_transient(message),
            ErrorKind::LlmError => Error::Llm(LlmFailure::Timeout(message)),
            _ => Error::Internal(message),
        }
    }
}

/// Result type alias for docrag operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(Error::Validation("x".into()).kind().as_str(), "validation_error");
        assert_eq!(Error::NotFound("x".into()).kind().as_str(), "not_found");
        assert_eq!(
            Error::Llm(LlmFailure::RateLimited("x".into())).kind().as_str(),
            "llm_error"
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::UnsupportedFormat).unwrap(),
            "\"unsupported_format\""
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::embedding_transient("503").is_transient());
        assert!(!Error::embedding_fatal("bad dims").is_transient());
        assert!(Error::storage_transient("locked").is_transient());
        assert!(Error::Llm(LlmFailure::RateLimited("429".into())).is_transient());
        assert!(Error::Llm(LlmFailure::Timeout("slow".into())).is_transient());
        assert!(!Error::Llm(LlmFailure::InvalidResponse("garbage".into())).is_transient());
        assert!(!Error::Parse("broken pdf".into()).is_transient());
        assert!(!Error::Validation("empty".into()).is_transient());
    }

    #[test]
    fn test_timeout_maps_to_stage_policy() {
        assert!(!Error::timeout(ErrorKind::ParseError, "parse", 5).is_transient());
        assert!(Error::timeout(ErrorKind::EmbeddingError, "embed", 5).is_transient());
        assert!(Error::timeout(ErrorKind::StorageError, "store", 5).is_transient());
        let e = Error::timeout(ErrorKind::LlmError, "generate", 30);
        assert_eq!(e.to_string(), "llm error: timed out: generate timed out after 30s");
    }
}
