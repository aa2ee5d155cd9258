//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload` | Multipart upload (`file` field); `.zip` fans out into one task per entry |
//! | `GET`  | `/tasks` | All ingestion tasks, newest first |
//! | `GET`  | `/tasks/{id}` | One ingestion task |
//! | `POST` | `/chat` | Retrieval-augmented answer for a session |
//! | `POST` | `/search` | Retrieval only |
//! | `GET`  | `/documents` | Document listing |
//! | `GET`  | `/documents/{id}` | Document with its segments |
//! | `DELETE` | `/documents/{id}` | Delete a document and its segments |
//! | `GET`  | `/conversations/{session_id}` | Session history |
//! | `DELETE` | `/conversations/{session_id}` | Clear a session |
//! | `GET`  | `/health` | Health check (version and cache counters) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "query must not be empty" } }
//! ```
//!
//! `code` is the stable error kind. Status codes: validation, unsupported
//! format and parse errors → 400, not found → 404, LLM rate limit → 429,
//! LLM timeout → 504, other LLM and embedding/retrieval failures → 502,
//! everything else → 500.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use docrag_core::models::{ConversationTurn, Document, IngestionTask, TaskError, TaskStatus};
use docrag_core::store::DocumentSummary;
use docrag_core::{Error, LlmFailure};

use crate::cache::CacheStats;
use crate::config::{Config, ServerConfig};
use crate::context::AppContext;
use crate::ingest::IngestionCoordinator;
use crate::rag::{ChatRequest, ChatResponse, RagOrchestrator, SearchRequest, SearchResponse};

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub ingest: Arc<IngestionCoordinator>,
    pub rag: Arc<RagOrchestrator>,
}

impl AppState {
    /// Build the services on top of `ctx`. Spawns the ingestion workers.
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ingest: Arc::new(IngestionCoordinator::start(ctx.clone())),
            rag: Arc::new(RagOrchestrator::new(ctx.clone())),
            ctx,
        }
    }
}

/// Open the configured context and serve until the process is stopped.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let ctx = Arc::new(AppContext::open(config.clone()).await?);
    let app = router(AppState::new(ctx));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "docrag server listening");
    println!("docrag server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.ctx.config.server);
    // multipart framing on top of the largest accepted file
    let body_limit = state.ctx.config.ingestion.max_file_size + 64 * 1024;

    Router::new()
        .route("/upload", post(handle_upload))
        .route("/tasks", get(handle_list_tasks))
        .route("/tasks/{id}", get(handle_task_status))
        .route("/chat", post(handle_chat))
        .route("/search", post(handle_search))
        .route("/documents", get(handle_list_documents))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route(
            "/conversations/{session_id}",
            get(handle_history).delete(handle_clear_session),
        )
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) | Error::UnsupportedFormat(_) | Error::Parse(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Llm(LlmFailure::RateLimited(_)) => StatusCode::TOO_MANY_REQUESTS,
            Error::Llm(LlmFailure::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Error::Llm(_) | Error::Embedding { .. } | Error::Retrieval(_) => StatusCode::BAD_GATEWAY,
            Error::Storage { .. } | Error::Memory(_) | Error::Cache(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(kind = %err.kind(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.kind().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    Error::Validation(message.into()).into()
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    task_id: String,
    task_ids: Vec<String>,
    status: TaskStatus,
    message: String,
}

async fn handle_upload(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<UploadResponse> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("file field has no filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }
    let (filename, bytes) = upload.ok_or_else(|| bad_request("missing 'file' field"))?;

    let task_ids = state.ingest.submit_upload(bytes, &filename).await?;
    let first = state.ingest.get_status(&task_ids[0])?;
    let message = if task_ids.len() == 1 {
        first.message.clone()
    } else {
        format!("{} documents queued from {}", task_ids.len(), filename)
    };

    Ok(Json(UploadResponse {
        task_id: first.id,
        task_ids,
        status: first.status,
        message,
    }))
}

// ============ GET /tasks ============

#[derive(Serialize)]
struct TaskResponse {
    task_id: String,
    filename: String,
    status: TaskStatus,
    progress: f32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
}

impl From<IngestionTask> for TaskResponse {
    fn from(t: IngestionTask) -> Self {
        Self {
            task_id: t.id,
            filename: t.filename,
            status: t.status,
            progress: t.progress,
            message: t.message,
            document_id: t.document_id,
            error: t.error,
        }
    }
}

async fn handle_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskResponse> {
    Ok(Json(state.ingest.get_status(&id)?.into()))
}

async fn handle_list_tasks(State(state): State<AppState>) -> Json<Vec<TaskResponse>> {
    Json(state.ingest.list_tasks().into_iter().map(Into::into).collect())
}

// ============ POST /chat, POST /search ============

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    Ok(Json(state.rag.generate(req).await?))
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    Ok(Json(state.rag.search(req).await?))
}

// ============ /documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSummary>,
    total: usize,
}

async fn handle_list_documents(State(state): State<AppState>) -> ApiResult<DocumentListResponse> {
    let documents = state.ctx.store.list_documents().await?;
    Ok(Json(DocumentListResponse {
        total: documents.len(),
        documents,
    }))
}

#[derive(Serialize)]
struct SegmentView {
    id: String,
    ordinal: usize,
    text: String,
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct DocumentResponse {
    #[serde(flatten)]
    document: Document,
    segments: Vec<SegmentView>,
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DocumentResponse> {
    let document = state
        .ctx
        .store
        .get_document(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("document {}", id)))?;
    let segments = state
        .ctx
        .store
        .document_segments(&id)
        .await?
        .into_iter()
        .map(|s| SegmentView {
            id: s.id,
            ordinal: s.ordinal,
            text: s.text,
            metadata: s.metadata,
        })
        .collect();
    Ok(Json(DocumentResponse { document, segments }))
}

#[derive(Serialize)]
struct DeleteResponse {
    document_id: String,
    deleted: bool,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeleteResponse> {
    if !state.ctx.store.delete_document(&id).await? {
        return Err(Error::NotFound(format!("document {}", id)).into());
    }
    tracing::info!(document_id = %id, "document deleted");
    Ok(Json(DeleteResponse {
        document_id: id,
        deleted: true,
    }))
}

// ============ /conversations ============

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    turns: Vec<ConversationTurn>,
    total: usize,
}

async fn handle_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<HistoryResponse> {
    let turns = state.rag.history(&session_id).await?;
    Ok(Json(HistoryResponse {
        session_id,
        total: turns.len(),
        turns,
    }))
}

#[derive(Serialize)]
struct ClearResponse {
    session_id: String,
    removed: u64,
}

async fn handle_clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ClearResponse> {
    let removed = state.rag.clear_session(&session_id).await?;
    Ok(Json(ClearResponse {
        session_id,
        removed,
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    caches: CacheReport,
}

#[derive(Serialize)]
struct CacheReport {
    embedding: CacheStats,
    response: CacheStats,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        caches: CacheReport {
            embedding: state.ctx.embedder.cache_stats(),
            response: state.rag.response_cache_stats(),
        },
    })
}
