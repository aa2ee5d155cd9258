use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn docrag_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docrag"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    ).unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    ).unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    ).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/docrag.sqlite"

[chunking]
chunk_size = 64
overlap = 8
min_chunk_size = 8

[retrieval]
top_k = 3
min_score = 0.0

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("docrag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

fn run_docrag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docrag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docrag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn ingest_all(config_path: &Path) -> String {
    let dir = files_dir(config_path);
    let alpha = dir.join("alpha.md");
    let beta = dir.join("beta.md");
    let gamma = dir.join("gamma.txt");
    let (stdout, stderr, success) = run_docrag(
        config_path,
        &[
            "ingest",
            alpha.to_str().unwrap(),
            beta.to_str().unwrap(),
            gamma.to_str().unwrap(),
        ],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

fn first_document_id(config_path: &Path) -> String {
    let (stdout, _, _) = run_docrag(config_path, &["documents", "list"]);
    stdout
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docrag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_docrag(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_docrag(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_files() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["init"]);
    let stdout = ingest_all(&config_path);
    assert!(stdout.contains("3 task(s) completed, 0 failed"), "{}", stdout);

    let (list, _, success) = run_docrag(&config_path, &["documents", "list"]);
    assert!(success);
    assert_eq!(list.lines().count(), 3);
    assert!(list.contains("alpha.md"));
    assert!(list.contains("gamma.txt"));
}

#[test]
fn test_reingest_does_not_duplicate() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["init"]);
    ingest_all(&config_path);
    let stdout = ingest_all(&config_path);
    assert!(stdout.contains("Document already ingested"), "{}", stdout);

    let (list, _, _) = run_docrag(&config_path, &["documents", "list"]);
    assert_eq!(list.lines().count(), 3);
}

#[test]
fn test_ingest_zip_archive() {
    let (tmp, config_path) = setup_test_env();

    let archive_path = tmp.path().join("bundle.zip");
    {
        let file = fs::File::create(&archive_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("one.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"first file inside the archive").unwrap();
        zip.start_file("docs/two.md", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"# Second\n\nanother archived note").unwrap();
        zip.start_file("skip.exe", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"MZ").unwrap();
        zip.finish().unwrap();
    }

    run_docrag(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_docrag(&config_path, &["ingest", archive_path.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("2 task(s) completed"), "{}", stdout);
}

#[test]
fn test_ingest_unsupported_file_fails() {
    let (tmp, config_path) = setup_test_env();
    let path = tmp.path().join("program.exe");
    fs::write(&path, b"MZ").unwrap();

    run_docrag(&config_path, &["init"]);
    let (_, stderr, success) = run_docrag(&config_path, &["ingest", path.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("unsupported format"), "{}", stderr);
}

#[test]
fn test_search_finds_document() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["init"]);
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_docrag(
        &config_path,
        &["search", "Kubernetes and Docker deployment infrastructure"],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("1. "), "{}", stdout);
    assert!(stdout.lines().next().unwrap().contains("gamma.txt"), "{}", stdout);
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["init"]);
    ingest_all(&config_path);

    let (first, _, _) = run_docrag(&config_path, &["search", "Rust cargo crates"]);
    let (second, _, _) = run_docrag(&config_path, &["search", "Rust cargo crates"]);
    assert_eq!(first, second);
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["init"]);
    let (_, stderr, success) = run_docrag(&config_path, &["search", "  "]);
    assert!(!success);
    assert!(stderr.contains("query must not be empty"), "{}", stderr);
}

#[test]
fn test_chat_and_history() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["init"]);
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_docrag(
        &config_path,
        &["chat", "What does the alpha document say about Rust?", "--session", "cli-test"],
    );
    assert!(success, "chat failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("You asked: \"What does the alpha document say about Rust?\""));
    assert!(stdout.contains("Sources:"));

    run_docrag(&config_path, &["chat", "And about Python?", "--session", "cli-test"]);

    let (history, _, success) = run_docrag(&config_path, &["history", "cli-test"]);
    assert!(success);
    let first = history.find("alpha document say").unwrap();
    let second = history.find("And about Python?").unwrap();
    assert!(first < second);

    let (cleared, _, _) = run_docrag(&config_path, &["history", "cli-test", "--clear"]);
    assert!(cleared.contains("Removed 2 turn(s)"), "{}", cleared);
    let (history, _, _) = run_docrag(&config_path, &["history", "cli-test"]);
    assert!(history.contains("No turns recorded"));
}

#[test]
fn test_documents_get_and_delete() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["init"]);
    ingest_all(&config_path);
    let id = first_document_id(&config_path);

    let (stdout, _, success) = run_docrag(&config_path, &["documents", "get", &id]);
    assert!(success);
    assert!(stdout.contains(&format!("id:           {}", id)));
    assert!(stdout.contains("--- Segments (1) ---"));

    let (_, _, success) = run_docrag(&config_path, &["documents", "delete", &id]);
    assert!(success);
    let (_, stderr, success) = run_docrag(&config_path, &["documents", "get", &id]);
    assert!(!success);
    assert!(stderr.contains("document not found"));

    let (list, _, _) = run_docrag(&config_path, &["documents", "list"]);
    assert_eq!(list.lines().count(), 2);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_docrag(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
