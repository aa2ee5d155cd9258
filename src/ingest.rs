//! Background ingestion: upload → parse → chunk → embed → store.
//!
//! [`IngestionCoordinator::submit`] validates an upload, creates a task
//! record, queues the job and returns the task id straight away. A fixed
//! pool of workers drains the bounded queue. Progress is reported through
//! the task record only:
//!
//! | Stage | Progress | Message |
//! |-------|----------|---------|
//! | queued | 0.0 | `Queued for processing` |
//! | started | 0.0 | `Parsing document...` |
//! | parsed | 0.25 | `Chunking text...` |
//! | chunked | 0.5 | `Generating embeddings...` |
//! | embedded | 0.75 | `Storing segments...` |
//! | stored | 1.0 | `Completed` |
//!
//! Progress never decreases. Any stage error fails the task; embedding and
//! storage retry internally before giving up, parsing does not.
//!
//! # Deduplication
//!
//! Uploads are keyed by the SHA-256 of their bytes. A hash that is already
//! stored yields a task that is Completed from the start. A hash with a
//! task in flight attaches the caller to that task. A failed task releases
//! its hash. Workers check the store again before parsing, which closes the
//! window between a submission's store lookup and another task finishing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use docrag_core::chunk;
use docrag_core::models::{
    Document, DocumentFormat, IngestionTask, Segment, TaskError, TaskStatus,
};
use docrag_core::{Error, ErrorKind, Result};

use crate::context::AppContext;
use crate::parser::expand_archive;
use crate::retry::retry;

struct Job {
    task_id: String,
    filename: String,
    format: DocumentFormat,
    content_hash: String,
    bytes: Vec<u8>,
}

struct Shared {
    ctx: Arc<AppContext>,
    tasks: DashMap<String, IngestionTask>,
    /// content hash → id of the task processing it
    in_flight: Mutex<HashMap<String, String>>,
}

/// Owns the task table and the worker pool.
pub struct IngestionCoordinator {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Job>,
}

impl IngestionCoordinator {
    /// Spawn `ingestion.workers` workers on the current runtime.
    pub fn start(ctx: Arc<AppContext>) -> Self {
        let workers = ctx.config.ingestion.workers.max(1);
        let (tx, rx) = mpsc::channel(ctx.config.ingestion.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let shared = Arc::new(Shared {
            ctx,
            tasks: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
        });

        for worker in 0..workers {
            let shared = shared.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => shared.run(job).await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "ingestion worker stopped");
            });
        }
        tracing::info!(workers, "ingestion workers started");

        Self { shared, queue: tx }
    }

    /// Submit one upload, expanding `.zip` archives into one task per entry.
    pub async fn submit_upload(&self, bytes: Vec<u8>, filename: &str) -> Result<Vec<String>> {
        match DocumentFormat::from_filename(filename) {
            Some(DocumentFormat::Zip) => self.submit_archive(bytes, filename).await,
            _ => Ok(vec![self.submit(bytes, filename).await?]),
        }
    }

    /// Queue a single document and return its task id.
    pub async fn submit(&self, bytes: Vec<u8>, filename: &str) -> Result<String> {
        let cfg = &self.shared.ctx.config.ingestion;
        validate_size(&bytes, cfg.max_file_size)?;
        let format = DocumentFormat::from_filename(filename).ok_or_else(|| {
            Error::UnsupportedFormat(format!("'{}' has no supported extension", filename))
        })?;
        if !cfg.is_allowed(format) {
            return Err(Error::UnsupportedFormat(format!(
                "{} uploads are not allowed",
                format.as_str()
            )));
        }
        if format == DocumentFormat::Zip {
            return Err(Error::Validation(
                "zip archives must be submitted as archives".to_string(),
            ));
        }

        let content_hash = format!("{:x}", Sha256::digest(&bytes));

        if let Some(task_id) = self.shared.lock_in_flight().get(&content_hash) {
            tracing::info!(task_id = %task_id, filename, "attached to in-flight task");
            return Ok(task_id.clone());
        }

        if let Some(existing) = self.shared.ctx.store.find_by_hash(&content_hash).await? {
            let task = self.shared.completed_duplicate(filename, &content_hash, &existing.id);
            tracing::info!(
                task_id = %task.id,
                document_id = %existing.id,
                filename,
                "content already ingested"
            );
            let id = task.id.clone();
            self.shared.tasks.insert(id.clone(), task);
            return Ok(id);
        }

        let task = new_task(filename, &content_hash);
        let task_id = task.id.clone();
        {
            let mut in_flight = self.shared.lock_in_flight();
            // another submission may have registered the hash while we
            // were looking in the store
            if let Some(existing) = in_flight.get(&content_hash) {
                return Ok(existing.clone());
            }
            in_flight.insert(content_hash.clone(), task_id.clone());
            self.shared.tasks.insert(task_id.clone(), task);
        }

        let job = Job {
            task_id: task_id.clone(),
            filename: filename.to_string(),
            format,
            content_hash,
            bytes,
        };
        if self.queue.send(job).await.is_err() {
            let err = Error::Internal("ingestion queue is closed".to_string());
            self.shared.fail(&task_id, &err);
            return Err(err);
        }

        tracing::info!(task_id = %task_id, filename, format = format.as_str(), "task queued");
        Ok(task_id)
    }

    /// Expand a zip upload and submit every supported entry.
    pub async fn submit_archive(&self, bytes: Vec<u8>, filename: &str) -> Result<Vec<String>> {
        let cfg = &self.shared.ctx.config.ingestion;
        validate_size(&bytes, cfg.max_file_size)?;
        if !cfg.is_allowed(DocumentFormat::Zip) {
            return Err(Error::UnsupportedFormat("zip uploads are not allowed".to_string()));
        }

        let entries = expand_archive(&bytes, cfg.max_archive_entries, cfg.max_file_size, |f| {
            f != DocumentFormat::Zip && cfg.is_allowed(f)
        })?;

        let mut task_ids = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.submit(entry.bytes, &entry.filename).await {
                Ok(id) => {
                    if !task_ids.contains(&id) {
                        task_ids.push(id);
                    }
                }
                Err(e @ (Error::Validation(_) | Error::UnsupportedFormat(_))) => {
                    tracing::warn!(archive = filename, entry = %entry.filename, error = %e, "skipping archive entry");
                }
                Err(e) => return Err(e),
            }
        }

        if task_ids.is_empty() {
            return Err(Error::Validation(format!(
                "archive '{}' contains no supported documents",
                filename
            )));
        }
        tracing::info!(archive = filename, tasks = task_ids.len(), "archive expanded");
        Ok(task_ids)
    }

    pub fn get_status(&self, task_id: &str) -> Result<IngestionTask> {
        self.shared
            .tasks
            .get(task_id)
            .map(|t| t.clone())
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    /// All known tasks, newest first.
    pub fn list_tasks(&self) -> Vec<IngestionTask> {
        let mut tasks: Vec<IngestionTask> =
            self.shared.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Poll until the task is Completed or Failed, or `timeout` elapses.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<IngestionTask> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.get_status(task_id)?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(format!(
                    "task {} still {} after {}s",
                    task_id,
                    task.status.as_str(),
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn validate_size(bytes: &[u8], max: usize) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::Validation("uploaded file is empty".to_string()));
    }
    if bytes.len() > max {
        return Err(Error::Validation(format!(
            "file is {} bytes, the limit is {}",
            bytes.len(),
            max
        )));
    }
    Ok(())
}

fn new_task(filename: &str, content_hash: &str) -> IngestionTask {
    let now = Utc::now();
    IngestionTask {
        id: Uuid::new_v4().to_string(),
        filename: filename.to_string(),
        content_hash: content_hash.to_string(),
        status: TaskStatus::Queued,
        progress: 0.0,
        message: "Queued for processing".to_string(),
        document_id: None,
        error: None,
        created_at: now,
        updated_at: now,
    }
}

impl Shared {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn completed_duplicate(&self, filename: &str, content_hash: &str, document_id: &str) -> IngestionTask {
        let mut task = new_task(filename, content_hash);
        task.status = TaskStatus::Completed;
        task.progress = 1.0;
        task.message = "Document already ingested".to_string();
        task.document_id = Some(document_id.to_string());
        task
    }

    /// Apply a stage update. Progress is clamped and never moves backwards;
    /// terminal tasks are frozen.
    fn advance(&self, task_id: &str, status: TaskStatus, progress: f32, message: &str) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            if task.status.is_terminal() {
                return;
            }
            task.status = status;
            task.progress = task.progress.max(progress.clamp(0.0, 1.0));
            task.message = message.to_string();
            task.updated_at = Utc::now();
        }
    }

    fn complete(&self, task_id: &str, document_id: &str, message: &str) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Completed;
            task.progress = 1.0;
            task.message = message.to_string();
            task.document_id = Some(document_id.to_string());
            task.updated_at = Utc::now();
        }
    }

    fn fail(&self, task_id: &str, err: &Error) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.message = format!("Failed: {}", err);
            task.error = Some(TaskError::from(err));
            task.updated_at = Utc::now();
        }
        let mut in_flight = self.lock_in_flight();
        in_flight.retain(|_, id| id != task_id);
    }

    async fn run(&self, job: Job) {
        let task_id = job.task_id.clone();
        let content_hash = job.content_hash.clone();
        let limit = Duration::from_secs(self.ctx.config.ingestion.task_timeout_secs);
        let started = std::time::Instant::now();

        let outcome = match tokio::time::timeout(limit, self.pipeline(job)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Internal(format!(
                "ingestion timed out after {}s",
                limit.as_secs()
            ))),
        };

        match outcome {
            Ok(document_id) => {
                tracing::info!(
                    task_id = %task_id,
                    document_id = %document_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                );
                let mut in_flight = self.lock_in_flight();
                if in_flight.get(&content_hash) == Some(&task_id) {
                    in_flight.remove(&content_hash);
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, kind = %e.kind(), "task failed");
                self.fail(&task_id, &e);
            }
        }
    }

    /// Run every stage; returns the document id.
    async fn pipeline(&self, job: Job) -> Result<String> {
        let ctx = &self.ctx;
        let cfg = &ctx.config;
        let task_id = job.task_id.as_str();

        self.advance(task_id, TaskStatus::Processing, 0.0, "Parsing document...");

        if let Some(existing) = ctx.store.find_by_hash(&job.content_hash).await? {
            self.complete(task_id, &existing.id, "Document already ingested");
            return Ok(existing.id);
        }

        // parse
        let parse_limit = Duration::from_secs(cfg.ingestion.parse_timeout_secs);
        let parsed = tokio::time::timeout(parse_limit, ctx.parser.parse(&job.bytes, job.format))
            .await
            .map_err(|_| Error::timeout(ErrorKind::ParseError, "parsing", parse_limit.as_secs()))??;
        tracing::debug!(task_id, chars = parsed.text.len(), "document parsed");
        self.advance(task_id, TaskStatus::Processing, 0.25, "Chunking text...");

        // chunk
        let chunks = chunk::split(
            &parsed.text,
            cfg.chunking.chunk_size,
            cfg.chunking.overlap,
            cfg.chunking.min_chunk_size,
        )?;
        tracing::debug!(task_id, chunks = chunks.len(), "text chunked");
        self.advance(task_id, TaskStatus::Processing, 0.5, "Generating embeddings...");

        // embed
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = ctx.embedder.embed(&texts).await?;
        self.advance(task_id, TaskStatus::Processing, 0.75, "Storing segments...");

        // store
        let document_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let segments: Vec<Segment> = chunks
            .iter()
            .zip(vectors)
            .map(|(c, vector)| Segment {
                id: Segment::make_id(&document_id, c.ordinal),
                document_id: document_id.clone(),
                ordinal: c.ordinal,
                text: c.text.clone(),
                vector,
                metadata: serde_json::json!({
                    "filename": job.filename,
                    "start": c.start,
                    "end": c.end,
                    "token_count": c.token_count,
                    "chunk_hash": c.hash,
                }),
                created_at: now,
            })
            .collect();
        let document = Document {
            id: document_id.clone(),
            filename: job.filename.clone(),
            format: job.format,
            text: parsed.text,
            metadata: parsed.metadata,
            content_hash: job.content_hash.clone(),
            segment_count: segments.len(),
            created_at: now,
        };

        retry(
            cfg.ingestion.store_retry_policy(),
            ErrorKind::StorageError,
            "store document",
            Some(Duration::from_secs(cfg.ingestion.store_timeout_secs)),
            || ctx.store.store(&document, &segments),
        )
        .await?;

        self.complete(task_id, &document_id, "Completed");
        Ok(document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashEmbedder;
    use crate::llm::EchoBackend;

    fn coordinator(config: Config) -> IngestionCoordinator {
        let ctx = AppContext::in_memory(
            config,
            Arc::new(HashEmbedder::new(None, 32)),
            Arc::new(EchoBackend),
        );
        IngestionCoordinator::start(Arc::new(ctx))
    }

    fn small_chunks() -> Config {
        let mut config = Config::minimal("unused.sqlite");
        config.chunking.chunk_size = 4;
        config.chunking.overlap = 1;
        config.chunking.min_chunk_size = 1;
        config
    }

    #[tokio::test]
    async fn test_text_upload_completes() {
        let c = coordinator(small_chunks());
        let id = c
            .submit(b"one two three four five six seven".to_vec(), "notes.txt")
            .await
            .unwrap();
        let task = c.wait_for(&id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert_eq!(task.progress, 1.0);
        assert_eq!(task.message, "Completed");

        let doc_id = task.document_id.unwrap();
        let segments = c.shared.ctx.store.document_segments(&doc_id).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].id, format!("{}_0", doc_id));
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let mut config = small_chunks();
        config.ingestion.max_file_size = 8;
        config.ingestion.allowed_types = vec!["txt".to_string(), "doc".to_string()];
        let c = coordinator(config);

        assert!(matches!(c.submit(Vec::new(), "a.txt").await, Err(Error::Validation(_))));
        assert!(matches!(
            c.submit(b"way too many bytes".to_vec(), "a.txt").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            c.submit(b"x".to_vec(), "a.pdf").await,
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            c.submit(b"x".to_vec(), "a.exe").await,
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(c.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_doc_fails_task() {
        let c = coordinator(small_chunks());
        let id = c.submit(b"\xd0\xcf\x11\xe0".to_vec(), "legacy.doc").await.unwrap();
        let task = c.wait_for(&id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::UnsupportedFormat);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let c = coordinator(small_chunks());
        assert!(matches!(c.get_status("nope"), Err(Error::NotFound(_))));
    }
}
