//! # docrag CLI
//!
//! The `docrag` binary initializes the database, ingests files, answers
//! questions against the ingested documents, and runs the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docrag --config ./config/docrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag init` | Create the SQLite database and run schema migrations |
//! | `docrag ingest <files>...` | Parse, chunk, embed and store files |
//! | `docrag search "<query>"` | Rank stored segments against a query |
//! | `docrag chat "<query>" --session <id>` | Answer a question using retrieved context |
//! | `docrag history <session>` | Show a session's recorded turns |
//! | `docrag documents list` | List stored documents |
//! | `docrag documents get <id>` | Show one document and its segments |
//! | `docrag documents delete <id>` | Remove a document and its segments |
//! | `docrag serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! docrag init
//! docrag ingest ./docs/handbook.pdf ./docs/notes.zip
//! docrag search "vacation policy" --top-k 3
//! docrag chat "How many vacation days do I get?" --session alice
//! docrag serve
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use docrag::config;
use docrag::context::AppContext;
use docrag::ingest::IngestionCoordinator;
use docrag::logging;
use docrag::migrate;
use docrag::rag::{ChatRequest, RagOrchestrator, SearchRequest};
use docrag::server;
use docrag_core::models::TaskStatus;

#[derive(Parser)]
#[command(
    name = "docrag",
    about = "Document ingestion and retrieval-augmented chat",
    version,
    long_about = "docrag ingests PDF, DOCX, text and markdown files (also inside ZIP archives) \
                  into a local SQLite vector store and answers questions about them with an LLM."
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/docrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    Init,

    /// Ingest one or more files and wait for them to finish.
    ///
    /// ZIP archives are expanded and each supported entry becomes its own
    /// document. Files already ingested (same content) are skipped.
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Seconds to wait for each file before giving up
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },

    /// Search stored segments by semantic similarity.
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity score (0.0 to 1.0)
        #[arg(long)]
        min_score: Option<f32>,

        /// Only search within this document
        #[arg(long)]
        document: Option<String>,
    },

    /// Ask a question, answered from the ingested documents.
    Chat {
        /// The question
        query: String,

        /// Conversation session identifier
        #[arg(long, default_value = "cli")]
        session: String,

        /// Number of context segments to retrieve
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity for a segment to be used as context
        #[arg(long)]
        min_score: Option<f32>,

        /// Only use context from this document
        #[arg(long)]
        document: Option<String>,
    },

    /// Show the recorded turns of a session.
    History {
        /// Conversation session identifier
        session: String,

        /// Delete the session's turns instead of printing them
        #[arg(long)]
        clear: bool,
    },

    /// Inspect or remove stored documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum DocumentsAction {
    /// List every stored document, newest first.
    List,
    /// Show a document's metadata and segments.
    Get { id: String },
    /// Delete a document and all of its segments.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { files, timeout } => {
            let ctx = Arc::new(AppContext::open(cfg).await?);
            run_ingest(ctx, &files, Duration::from_secs(timeout)).await?;
        }
        Commands::Search {
            query,
            top_k,
            min_score,
            document,
        } => {
            let ctx = Arc::new(AppContext::open(cfg).await?);
            let rag = RagOrchestrator::new(ctx);
            let response = rag
                .search(SearchRequest {
                    query,
                    top_k,
                    min_score,
                    document_id: document,
                })
                .await?;
            if response.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, r) in response.results.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {} ({})",
                    i + 1,
                    r.score,
                    r.document_filename,
                    r.segment_id
                );
                println!("    {}", r.preview);
                println!();
            }
        }
        Commands::Chat {
            query,
            session,
            top_k,
            min_score,
            document,
        } => {
            let ctx = Arc::new(AppContext::open(cfg).await?);
            let rag = RagOrchestrator::new(ctx);
            let response = rag
                .generate(ChatRequest {
                    query,
                    session_id: session,
                    top_k,
                    min_score,
                    document_id: document,
                })
                .await?;
            println!("{}", response.answer);
            if response.degraded {
                println!();
                println!("(document retrieval was unavailable for this answer)");
            }
            if !response.sources.is_empty() {
                println!();
                println!("Sources:");
                for s in &response.sources {
                    println!("  - {} (relevance {:.2})", s.document_filename, s.score);
                }
            }
        }
        Commands::History { session, clear } => {
            let ctx = Arc::new(AppContext::open(cfg).await?);
            let rag = RagOrchestrator::new(ctx);
            if clear {
                let removed = rag.clear_session(&session).await?;
                println!("Removed {} turn(s) from session {}.", removed, session);
                return Ok(());
            }
            let turns = rag.history(&session).await?;
            if turns.is_empty() {
                println!("No turns recorded for session {}.", session);
            }
            for turn in &turns {
                println!("[{}] {}", turn.sequence, turn.timestamp.to_rfc3339());
                println!("user:      {}", turn.user_message);
                println!("assistant: {}", turn.assistant_message);
                println!();
            }
        }
        Commands::Documents { action } => {
            let ctx = AppContext::open(cfg).await?;
            match action {
                DocumentsAction::List => {
                    let docs = ctx.store.list_documents().await?;
                    if docs.is_empty() {
                        println!("No documents.");
                    }
                    for d in &docs {
                        println!(
                            "{}  {:<5} {:>4} segments  {}  {}",
                            d.id,
                            d.format.as_str(),
                            d.segment_count,
                            d.created_at.format("%Y-%m-%d %H:%M"),
                            d.filename
                        );
                    }
                }
                DocumentsAction::Get { id } => {
                    let doc = ctx
                        .store
                        .get_document(&id)
                        .await?
                        .with_context(|| format!("document not found: {}", id))?;
                    let segments = ctx.store.document_segments(&id).await?;

                    println!("--- Document ---");
                    println!("id:           {}", doc.id);
                    println!("filename:     {}", doc.filename);
                    println!("format:       {}", doc.format.as_str());
                    println!("content_hash: {}", doc.content_hash);
                    println!("created_at:   {}", doc.created_at.to_rfc3339());
                    println!("metadata:     {}", doc.metadata);
                    println!();
                    println!("--- Segments ({}) ---", segments.len());
                    for s in &segments {
                        println!("[segment {}]", s.ordinal);
                        println!("{}", s.text);
                        println!();
                    }
                }
                DocumentsAction::Delete { id } => {
                    if !ctx.store.delete_document(&id).await? {
                        bail!("document not found: {}", id);
                    }
                    println!("Deleted document {}.", id);
                }
            }
        }
    }

    Ok(())
}

/// Submit every file, then wait for each task to reach a terminal state.
async fn run_ingest(ctx: Arc<AppContext>, files: &[PathBuf], timeout: Duration) -> anyhow::Result<()> {
    let coordinator = IngestionCoordinator::start(ctx);

    let mut submitted = Vec::new();
    for path in files {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = display_name(path);
        match coordinator.submit_upload(bytes, &filename).await {
            Ok(ids) => submitted.extend(ids),
            Err(e) => eprintln!("{}: {}", filename, e),
        }
    }

    let mut failed = 0usize;
    for id in &submitted {
        let task = coordinator.wait_for(id, timeout).await?;
        match task.status {
            TaskStatus::Completed => println!(
                "ok      {}  {}  ({})",
                task.document_id.as_deref().unwrap_or("-"),
                task.filename,
                task.message
            ),
            status => {
                failed += 1;
                let reason = task
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| task.message.clone());
                println!("{:<7} {}  {}", status.as_str(), task.filename, reason);
            }
        }
    }

    println!();
    println!(
        "{} file(s) submitted, {} task(s) completed, {} failed.",
        files.len(),
        submitted.len() - failed,
        failed
    );
    if failed > 0 || submitted.is_empty() {
        bail!("ingestion finished with errors");
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
