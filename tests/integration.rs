use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn semche_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_semche"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("nested")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("nested/gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(files_dir.join("empty.txt"), "  \n").unwrap();
    fs::write(files_dir.join("blob.bin"), b"\x00\x01\x02binary").unwrap();

    let config_content = format!(
        r#"[collection]
name = "integration"
persist_directory = "{}/data"

[embedding]
provider = "hash"
dims = 128

[chunking]
chunk_size = 400
chunk_overlap = 50

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = root.join("semche.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_semche(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = semche_binary();
    let root = config_path.parent().unwrap();
    let output = Command::new(&binary)
        .current_dir(root)
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run semche binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn info_line(stdout: &str, key: &str) -> usize {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.trim().parse().ok())
        .unwrap_or_else(|| panic!("no '{key}' line in: {stdout}"))
}

#[test]
fn test_info_on_fresh_collection() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_semche(&config, &["info"]);
    assert!(success, "info failed: {stderr}");
    assert!(stdout.contains("collection:  integration"));
    assert_eq!(info_line(&stdout, "documents:"), 0);
    assert_eq!(info_line(&stdout, "dimension:"), 128);
}

#[test]
fn test_register_skips_binary_and_empty_files() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) =
        run_semche(&config, &["register", "files", "--id-prefix", "kb"]);
    assert!(success, "register failed: {stderr}");
    assert!(
        stdout.contains("Registered 3 of 5 files (2 skipped, 0 failed)."),
        "unexpected output: {stdout}"
    );

    let (stdout, _, _) = run_semche(&config, &["info"]);
    assert_eq!(info_line(&stdout, "documents:"), 3);
}

#[test]
fn test_register_then_search_finds_exact_text() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_semche(&config, &["register", "files/**/*.md"]);
    assert!(success, "register failed: {stderr}");

    let query = "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.";
    let (stdout, stderr, success) = run_semche(&config, &["search", query, "-k", "1"]);
    assert!(success, "search failed: {stderr}");
    assert!(stdout.starts_with("1. "), "unexpected output: {stdout}");
    assert!(stdout.contains("files/beta.md"));
}

#[test]
fn test_register_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    run_semche(&config, &["register", "files"]);
    let (first, _, _) = run_semche(&config, &["info"]);
    run_semche(&config, &["register", "files"]);
    let (second, _, _) = run_semche(&config, &["info"]);
    assert_eq!(first, second);
}

#[test]
fn test_search_filter_restricts_results() {
    let (_tmp, config) = setup_test_env();
    run_semche(&config, &["register", "files"]);

    let (stdout, stderr, success) = run_semche(
        &config,
        &["search", "deployment", "-k", "5", "--filter", r#"{"language": "text"}"#],
    );
    assert!(success, "search failed: {stderr}");
    assert!(stdout.contains("files/nested/gamma.txt"));
    assert!(!stdout.contains(".md"));
}

#[test]
fn test_keyword_and_hybrid_search_modes() {
    let (_tmp, config) = setup_test_env();
    run_semche(&config, &["register", "files"]);

    let (stdout, stderr, success) =
        run_semche(&config, &["search", "Kubernetes Docker", "--mode", "keyword"]);
    assert!(success, "search failed: {stderr}");
    assert!(stdout.starts_with("1. "), "unexpected output: {stdout}");
    assert!(stdout.contains("files/nested/gamma.txt"));
    assert!(!stdout.contains("2. "), "only one file mentions these terms: {stdout}");

    let (stdout, stderr, success) =
        run_semche(&config, &["search", "Kubernetes Docker", "--mode", "hybrid", "-k", "1"]);
    assert!(success, "search failed: {stderr}");
    assert!(stdout.contains("files/nested/gamma.txt"));

    let (_, stderr, success) = run_semche(&config, &["search", "anything", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("Unknown search mode"), "unexpected stderr: {stderr}");
}

#[test]
fn test_search_rejects_zero_k() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_semche(&config, &["search", "anything", "-k", "0"]);
    assert!(!success);
    assert!(stderr.contains("k must be"), "unexpected stderr: {stderr}");
}

#[test]
fn test_delete_by_id_and_filter() {
    let (_tmp, config) = setup_test_env();
    run_semche(&config, &["register", "files"]);

    let (stdout, stderr, success) = run_semche(&config, &["delete", "files/alpha.md"]);
    assert!(success, "delete failed: {stderr}");
    assert!(stdout.contains("Deleted 1 document(s)."));

    let (stdout, _, success) =
        run_semche(&config, &["delete", "--filter", r#"{"language": "text"}"#]);
    assert!(success);
    assert!(stdout.contains("Deleted 1 document(s)."));

    let (stdout, _, _) = run_semche(&config, &["info"]);
    assert_eq!(info_line(&stdout, "documents:"), 1);
}

#[test]
fn test_delete_requires_target() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_semche(&config, &["delete"]);
    assert!(!success);
    assert!(stderr.contains("Provide document ids or --filter"));
}

#[test]
fn test_config_prints_effective_settings() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_semche(&config, &["config"]);
    assert!(success, "config failed: {stderr}");
    assert!(stdout.contains("name = \"integration\""));
    assert!(stdout.contains("dims = 128"));
}

#[test]
fn test_invalid_config_fails_fast() {
    let (_tmp, config) = setup_test_env();
    let output = Command::new(semche_binary())
        .arg("--config")
        .arg(&config)
        .arg("info")
        .env("SEMCHE_COLLECTION__EF_SEARCH", "0")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("ef_search"), "unexpected stderr: {stderr}");
}

#[test]
fn test_missing_config_file_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_semche(&tmp.path().join("absent.toml"), &["info"]);
    assert!(!success);
    assert!(stderr.contains("config file not found"));
}
