//! # Semche CLI (`semche`)
//!
//! ```bash
//! semche serve                                  # MCP over stdio
//! semche register ./docs --id-prefix docs --file-type note
//! semche search "deployment checklist" -k 3
//! semche search "ECONNRESET retry" --mode hybrid
//! semche delete docs:old.md
//! semche info
//! semche config                                 # print effective settings
//! ```
//!
//! Settings come from `--config` (TOML) and `SEMCHE_*` environment
//! variables. See [`semche::config`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use semche::collection::Collection;
use semche::config::{self, Config};
use semche::register::{self, RegisterOptions};
use semche::{logging, mcp};
use semche_core::filter::MetadataFilter;
use semche_core::search::SearchMode;

#[derive(Parser)]
#[command(
    name = "semche",
    about = "Semantic document search over MCP",
    version
)]
struct Cli {
    /// Path to a TOML configuration file.
    ///
    /// Optional; environment variables (`SEMCHE_*`) override file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the MCP tools over stdio.
    Serve,

    /// Search the collection.
    Search {
        query: String,

        /// Number of chunks to return.
        #[arg(short, long, default_value_t = semche_core::search::DEFAULT_TOP_K)]
        k: usize,

        /// Metadata filter as JSON, e.g. `{"language": "rust"}`.
        #[arg(long)]
        filter: Option<String>,

        /// Retrieval mode: `semantic`, `keyword` (BM25), or `hybrid`.
        #[arg(long, default_value = "semantic")]
        mode: SearchMode,
    },

    /// Delete documents by id or by metadata filter.
    Delete {
        ids: Vec<String>,

        /// Metadata filter as JSON.
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show collection statistics.
    Info,

    /// Register files, directories, or glob patterns as documents.
    ///
    /// Each text file becomes one document whose id is its path relative to
    /// the current directory. Re-registering a file replaces it.
    Register {
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Prefix for document ids (`prefix:path/to/file.md`).
        #[arg(long, default_value = "")]
        id_prefix: String,

        /// Value stored in the `fileType` metadata field.
        #[arg(long, default_value = "none")]
        file_type: String,

        /// Glob pattern to skip. Repeatable.
        #[arg(long)]
        ignore: Vec<String>,

        /// Only register files modified at or after this date
        /// (YYYY-MM-DD or ISO 8601).
        #[arg(long, alias = "filter-from-date")]
        since: Option<String>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    logging::init(&cfg.logging.level);

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Commands::Serve => {
            let collection = Arc::new(Collection::open(&cfg).await?);
            mcp::run_stdio(collection).await?;
        }
        Commands::Search {
            query,
            k,
            filter,
            mode,
        } => {
            run_search(&cfg, &query, k, filter.as_deref(), mode).await?;
        }
        Commands::Delete { ids, filter } => {
            run_delete(&cfg, ids, filter.as_deref()).await?;
        }
        Commands::Info => {
            let collection = Collection::open(&cfg).await?;
            let info = collection.info().await?;
            println!("collection:  {}", info.collection_name);
            println!("documents:   {}", info.document_count);
            println!("chunks:      {}", info.chunk_count);
            println!("dimension:   {}", info.embedding_dimension);
        }
        Commands::Register {
            inputs,
            id_prefix,
            file_type,
            ignore,
            since,
        } => {
            let base_dir = std::env::current_dir().context("Failed to read current directory")?;
            let mut opts = RegisterOptions::new(inputs, base_dir);
            opts.id_prefix = id_prefix;
            opts.file_type = file_type;
            opts.ignore = ignore;
            opts.since = since.as_deref().map(register::parse_since).transpose()?;

            let collection = Collection::open(&cfg).await?;
            let report = register::register(&collection, &opts).await?;
            println!(
                "Registered {} of {} files ({} skipped, {} failed).",
                report.registered,
                report.scanned,
                report.skipped,
                report.failed.len()
            );
            for failure in &report.failed {
                println!("  {} [{}]: {}", failure.id, failure.kind, failure.error);
            }
            collection.close().await?;
        }
    }

    Ok(())
}

fn parse_filter(raw: Option<&str>) -> anyhow::Result<Option<MetadataFilter>> {
    raw.map(|text| {
        let value: serde_json::Value =
            serde_json::from_str(text).context("--filter must be a JSON object")?;
        Ok(MetadataFilter::from_json(&value)?)
    })
    .transpose()
}

async fn run_search(
    cfg: &Config,
    query: &str,
    k: usize,
    filter: Option<&str>,
    mode: SearchMode,
) -> anyhow::Result<()> {
    let filter = parse_filter(filter)?;
    let collection = Collection::open(cfg).await?;
    let results = collection
        .engine()
        .search_with_mode(query, k, filter.as_ref(), mode)
        .await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, result.score, result.document_id);
        if let Some(path) = result.metadata.file_path.as_deref() {
            println!("    path: {path}");
        }
        let excerpt: String = result.chunk_text.chars().take(200).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

async fn run_delete(cfg: &Config, ids: Vec<String>, filter: Option<&str>) -> anyhow::Result<()> {
    let filter = parse_filter(filter)?;
    if ids.is_empty() && filter.is_none() {
        anyhow::bail!("Provide document ids or --filter");
    }

    let collection = Collection::open(cfg).await?;
    let mut report = collection.store().delete_documents(&ids).await;
    if let Some(filter) = filter {
        report.merge(collection.store().delete_by_filter(&filter).await?);
    }
    println!("Deleted {} document(s).", report.deleted);
    for failure in &report.failed {
        println!("  {} [{}]: {}", failure.id, failure.kind, failure.error);
    }
    collection.close().await?;
    Ok(())
}
