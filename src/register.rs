//! Bulk registration of files into a collection.
//!
//! Inputs may be files, directories (walked recursively) or glob patterns
//! relative to the base directory. Each readable UTF-8 text file becomes one
//! document whose id is its path relative to the base directory with forward
//! slashes, optionally prefixed (`prefix:docs/guide.md`). Files outside the
//! base directory keep their absolute path.
//!
//! Binary files (a NUL byte in the first 8 KiB), empty or whitespace-only
//! files, and files that are not valid UTF-8 are skipped.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use walkdir::WalkDir;

use semche_core::models::{Metadata, MetadataValue, NewDocument};
use semche_core::store::BatchFailure;

use crate::collection::Collection;

const BINARY_SNIFF_BYTES: usize = 8192;
const REGISTER_BATCH: usize = 64;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub inputs: Vec<String>,
    pub id_prefix: String,
    pub file_type: String,
    pub ignore: Vec<String>,
    /// Skip files last modified before this instant.
    pub since: Option<DateTime<Utc>>,
    pub base_dir: PathBuf,
}

impl RegisterOptions {
    pub fn new(inputs: Vec<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            id_prefix: String::new(),
            file_type: "none".to_string(),
            ignore: Vec::new(),
            since: None,
            base_dir: base_dir.into(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RegisterReport {
    /// Files that survived input resolution and filtering.
    pub scanned: usize,
    pub registered: usize,
    pub skipped: usize,
    pub failed: Vec<BatchFailure>,
}

/// Parse `--since`: `YYYY-MM-DD`, a naive `YYYY-MM-DDTHH:MM:SS[.f]` in local
/// time, or RFC 3339.
pub fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        date.and_hms_opt(0, 0, 0)
    } else {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()
    };
    let Some(naive) = naive else {
        bail!("Invalid date '{value}': use YYYY-MM-DD or ISO 8601");
    };
    match Local.from_local_datetime(&naive).earliest() {
        Some(local) => Ok(local.with_timezone(&Utc)),
        None => bail!("Date '{value}' does not exist in the local time zone"),
    }
}

/// Resolve inputs to a sorted, de-duplicated list of files, applying the
/// ignore patterns and the modification-time filter.
pub fn resolve_inputs(opts: &RegisterOptions) -> Result<Vec<PathBuf>> {
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(opts.ignore.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut resolved = BTreeSet::new();
    for input in &opts.inputs {
        if is_pattern(input) {
            resolve_pattern(input, &opts.base_dir, &mut resolved)?;
            continue;
        }
        let path = absolute(&opts.base_dir, Path::new(input));
        if path.is_dir() {
            for entry in WalkDir::new(&path) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    resolved.insert(entry.into_path());
                }
            }
        } else if path.is_file() {
            resolved.insert(path);
        } else {
            tracing::warn!(input = %input, "input not found");
        }
    }

    let mut files = Vec::with_capacity(resolved.len());
    for path in resolved {
        let relative = display_path(&path, &opts.base_dir);
        if exclude_set.is_match(&relative) || exclude_set.is_match(&path) {
            tracing::debug!(path = %relative, "ignored by pattern");
            continue;
        }
        if let Some(since) = opts.since {
            if modified_at(&path)? < since {
                tracing::debug!(path = %relative, "older than --since");
                continue;
            }
        }
        files.push(path);
    }
    Ok(files)
}

/// Id of the document registered for `path`.
pub fn document_id(path: &Path, base_dir: &Path, prefix: &str) -> String {
    let id_path = display_path(path, base_dir);
    if prefix.is_empty() {
        id_path
    } else {
        format!("{prefix}:{id_path}")
    }
}

/// Register every resolved file, flushing the collection afterwards.
pub async fn register(collection: &Collection, opts: &RegisterOptions) -> Result<RegisterReport> {
    let scan_opts = opts.clone();
    let (scanned, documents) = tokio::task::spawn_blocking(move || -> Result<_> {
        let files = resolve_inputs(&scan_opts)?;
        let scanned = files.len();
        let documents: Vec<NewDocument> = files
            .iter()
            .filter_map(|path| load_document(path, &scan_opts).transpose())
            .collect::<Result<_>>()?;
        Ok((scanned, documents))
    })
    .await
    .context("File scan task failed")??;

    let mut report = RegisterReport {
        scanned,
        skipped: scanned - documents.len(),
        ..Default::default()
    };
    tracing::info!(files = scanned, documents = documents.len(), "registering files");

    let mut documents = documents.into_iter().peekable();
    while documents.peek().is_some() {
        let batch: Vec<NewDocument> = documents.by_ref().take(REGISTER_BATCH).collect();
        let outcome = collection.store().index_documents(batch, true).await;
        for id in &outcome.ids {
            tracing::info!(doc_id = %id, "registered");
        }
        report.registered += outcome.indexed;
        report.failed.extend(outcome.failed);
    }

    if report.registered > 0 {
        collection.flush().await?;
    }
    Ok(report)
}

/// Read a file into a document, or `None` when it should be skipped.
fn load_document(path: &Path, opts: &RegisterOptions) -> Result<Option<NewDocument>> {
    let relative = display_path(path, &opts.base_dir);
    let Some(content) = read_text(path, &relative) else {
        return Ok(None);
    };

    let updated_at = modified_at(path)?;
    let mut metadata = Metadata {
        file_path: Some(relative),
        language: language_for(path).map(str::to_string),
        ..Default::default()
    };
    metadata.set("fileType", MetadataValue::from(opts.file_type.as_str()))?;
    metadata.set(
        "updatedAt",
        MetadataValue::String(updated_at.to_rfc3339()),
    )?;

    Ok(Some(
        NewDocument::new(content)
            .with_id(document_id(path, &opts.base_dir, &opts.id_prefix))
            .with_metadata(metadata),
    ))
}

fn read_text(path: &Path, label: &str) -> Option<String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %label, error = %e, "skipped: unreadable");
            return None;
        }
    };
    if is_binary(&bytes) {
        tracing::debug!(path = %label, "skipped: binary");
        return None;
    }
    match String::from_utf8(bytes) {
        Ok(text) if text.trim().is_empty() => {
            tracing::debug!(path = %label, "skipped: empty");
            None
        }
        Ok(text) => Some(text),
        Err(_) => {
            tracing::warn!(path = %label, "skipped: not valid UTF-8");
            None
        }
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

fn language_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let language = match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "md" | "markdown" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "html" | "htm" => "html",
        "css" => "css",
        "txt" => "text",
        _ => return None,
    };
    Some(language)
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified))
}

fn is_pattern(input: &str) -> bool {
    input.contains(['*', '?', '['])
}

/// Walk the literal directory prefix of `pattern` and collect matching files.
/// Relative patterns match paths relative to `base_dir`.
fn resolve_pattern(pattern: &str, base_dir: &Path, out: &mut BTreeSet<PathBuf>) -> Result<()> {
    let pattern_path = Path::new(pattern);
    let relative = !pattern_path.is_absolute();
    let mut root = if relative {
        base_dir.to_path_buf()
    } else {
        PathBuf::new()
    };
    for component in pattern_path.components() {
        if is_pattern(&component.as_os_str().to_string_lossy()) {
            break;
        }
        root.push(component);
    }

    let glob = if relative {
        pattern.trim_start_matches("./")
    } else {
        pattern
    };
    let matcher = GlobBuilder::new(glob)
        .literal_separator(true)
        .build()
        .with_context(|| format!("Invalid pattern: {pattern}"))?
        .compile_matcher();

    if !root.exists() {
        tracing::warn!(input = %pattern, "no files match");
        return Ok(());
    }
    for entry in WalkDir::new(&root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matched = if relative {
            matcher.is_match(display_path(entry.path(), base_dir))
        } else {
            matcher.is_match(entry.path())
        };
        if matched {
            out.insert(entry.into_path());
        }
    }
    Ok(())
}

fn absolute(base_dir: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    // Lexical normalization only; symlinks are left alone.
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Path relative to `base_dir` with forward slashes, or the absolute path
/// for files outside it.
fn display_path(path: &Path, base_dir: &Path) -> String {
    match path.strip_prefix(base_dir) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/"),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid ignore pattern: {pattern}"))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use semche_core::embedding::HashingProvider;
    use std::sync::Arc;

    fn write(dir: &Path, rel: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn opts(base: &Path, inputs: &[&str]) -> RegisterOptions {
        RegisterOptions::new(inputs.iter().map(|s| s.to_string()).collect(), base)
    }

    fn rel(files: &[PathBuf], base: &Path) -> Vec<String> {
        files.iter().map(|p| display_path(p, base)).collect()
    }

    #[test]
    fn test_document_id_uses_prefix_and_forward_slashes() {
        let base = Path::new("/work");
        let path = Path::new("/work/docs/guide.md");
        assert_eq!(document_id(path, base, ""), "docs/guide.md");
        assert_eq!(document_id(path, base, "proj"), "proj:docs/guide.md");
    }

    #[test]
    fn test_document_id_outside_base_is_absolute() {
        let id = document_id(Path::new("/elsewhere/a.txt"), Path::new("/work"), "p");
        assert_eq!(id, "p:/elsewhere/a.txt");
    }

    #[test]
    fn test_parse_since_formats() {
        assert!(parse_since("2025-11-01").is_ok());
        assert!(parse_since("2025-11-01T08:30:00").is_ok());
        assert_eq!(
            parse_since("2025-11-01T08:30:00+00:00").unwrap().to_rfc3339(),
            "2025-11-01T08:30:00+00:00"
        );
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn test_binary_detection_looks_for_nul() {
        assert!(!is_binary(b"plain text"));
        assert!(is_binary(b"abc\0def"));
        let mut late = vec![b'a'; BINARY_SNIFF_BYTES];
        late.push(0);
        assert!(!is_binary(&late));
    }

    #[test]
    fn test_resolve_directory_sorted_with_default_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write(base, "docs/b.md", b"b");
        write(base, "docs/a.md", b"a");
        write(base, "docs/.git/config", b"x");
        write(base, "docs/node_modules/m.js", b"x");

        let files = resolve_inputs(&opts(base, &["docs"])).unwrap();
        assert_eq!(rel(&files, base), vec!["docs/a.md", "docs/b.md"]);
    }

    #[test]
    fn test_resolve_glob_and_ignore() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write(base, "notes/one.md", b"1");
        write(base, "notes/deep/two.md", b"2");
        write(base, "notes/three.txt", b"3");
        write(base, "notes/drafts/four.md", b"4");

        let mut options = opts(base, &["notes/**/*.md"]);
        options.ignore.push("**/drafts/**".into());
        let files = resolve_inputs(&options).unwrap();
        assert_eq!(rel(&files, base), vec!["notes/deep/two.md", "notes/one.md"]);
    }

    #[test]
    fn test_resolve_deduplicates_overlapping_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write(base, "a.md", b"a");
        let files = resolve_inputs(&opts(base, &["a.md", ".", "*.md"])).unwrap();
        assert_eq!(rel(&files, base), vec!["a.md"]);
    }

    #[test]
    fn test_since_filters_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write(base, "a.md", b"a");
        let mut options = opts(base, &["a.md"]);
        options.since = Some(Utc::now() + chrono::Duration::days(1));
        assert!(resolve_inputs(&options).unwrap().is_empty());

        options.since = Some(Utc::now() - chrono::Duration::days(1));
        assert_eq!(resolve_inputs(&options).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_skips_binary_and_empty_files() {
        let data = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let base = src.path();
        write(base, "src/main.rs", b"fn main() { println!(\"hi\"); }");
        write(base, "README.md", b"# Title\n\nSome words.");
        write(base, "blank.txt", b"   \n\t ");
        write(base, "image.png", b"\x89PNG\0\0\0");
        write(base, "latin1.txt", &[0x63, 0x61, 0x66, 0xe9]);

        let mut config = Config::default();
        config.collection.persist_directory = data.path().to_path_buf();
        let collection = Collection::open_with_provider(&config, Arc::new(HashingProvider::new(32)))
            .await
            .unwrap();

        let mut options = opts(base, &["."]);
        options.id_prefix = "proj".into();
        options.file_type = "code".into();
        let report = register(&collection, &options).await.unwrap();

        assert_eq!(report.scanned, 5);
        assert_eq!(report.registered, 2);
        assert_eq!(report.skipped, 3);
        assert!(report.failed.is_empty());

        let doc = collection.store().get_document("proj:src/main.rs").unwrap();
        assert_eq!(doc.metadata.file_path.as_deref(), Some("src/main.rs"));
        assert_eq!(doc.metadata.language.as_deref(), Some("rust"));
        assert_eq!(
            doc.metadata.get("fileType").unwrap().as_str(),
            Some("code")
        );
        assert!(doc.metadata.get("updatedAt").is_some());
        assert!(collection.snapshot_path().exists());
    }

    #[tokio::test]
    async fn test_reregistering_is_idempotent() {
        let data = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.md", b"alpha beta gamma");

        let mut config = Config::default();
        config.collection.persist_directory = data.path().to_path_buf();
        let collection = Collection::open_with_provider(&config, Arc::new(HashingProvider::new(32)))
            .await
            .unwrap();
        let options = opts(src.path(), &["a.md"]);

        register(&collection, &options).await.unwrap();
        let first = collection.info().await.unwrap();
        register(&collection, &options).await.unwrap();
        assert_eq!(collection.info().await.unwrap(), first);
    }
}
