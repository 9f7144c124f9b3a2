//! Tool definitions exposed over MCP.
//!
//! Each tool implements [`Tool`]: a name, a description, a JSON Schema for
//! its arguments, and an `execute` that takes the raw JSON arguments and the
//! shared [`ToolContext`]. The MCP bridge only ever talks to the
//! [`ToolRegistry`].
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `indexDocuments` | Chunk, embed, and upsert documents |
//! | `search` | Semantic, keyword, or hybrid search with optional metadata filter |
//! | `deleteDocuments` | Delete by id list and/or metadata filter |
//! | `getCollectionInfo` | Live document/chunk counts |
//! | `getDocumentsByPrefix` | List documents by id prefix |
//!
//! Argument problems surface as [`semche_core::Error::Validation`] so the
//! bridge can report them as invalid parameters. A mutation that succeeded
//! but could not be persisted is still reported, with a `warning` field.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use semche_core::filter::MetadataFilter;
use semche_core::models::{Metadata, NewDocument};
use semche_core::search::{SearchMode, DEFAULT_TOP_K};
use semche_core::Error;

use crate::collection::Collection;

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Wire name, e.g. `"indexDocuments"`.
    fn name(&self) -> &str;

    /// One-line description for tool discovery.
    fn description(&self) -> &str;

    /// Whether the tool only reads state.
    fn read_only(&self) -> bool {
        true
    }

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. `params` is always a JSON object.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Shared state handed to every tool call.
pub struct ToolContext {
    collection: Arc<Collection>,
}

impl ToolContext {
    pub fn new(collection: Arc<Collection>) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Mutating tools persist the collection before answering. A failed
    /// flush does not undo the mutation, so it becomes a warning.
    async fn after_write(&self) -> Option<String> {
        match self.collection.flush().await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "failed to persist collection");
                Some(format!("changes applied but not persisted: {err:#}"))
            }
        }
    }
}

fn with_warning(mut value: Value, warning: Option<String>) -> Value {
    if let (Some(warning), Some(obj)) = (warning, value.as_object_mut()) {
        obj.insert("warning".into(), json!(warning));
    }
    value
}

/// Longest `chunkText` returned by `search`, in characters.
pub const PREVIEW_CHARS: usize = 500;

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    Error::Validation(message.into()).into()
}

/// Deserialize the arguments object into `T`, mapping failures to a
/// validation error naming the tool.
fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| invalid(format!("invalid arguments for {tool}: {e}")))
}

fn parse_filter(value: Option<&Value>) -> Result<Option<MetadataFilter>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(MetadataFilter::from_json(v)?)),
    }
}

// ============ indexDocuments ============

#[derive(Deserialize)]
struct DocumentArg {
    #[serde(default)]
    id: Option<String>,
    content: String,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
struct IndexArgs {
    documents: Vec<DocumentArg>,
    #[serde(default = "default_upsert")]
    upsert: bool,
}

fn default_upsert() -> bool {
    true
}

pub struct IndexDocumentsTool;

#[async_trait]
impl Tool for IndexDocumentsTool {
    fn name(&self) -> &str {
        "indexDocuments"
    }

    fn description(&self) -> &str {
        "Chunk, embed, and store documents. Re-indexing an existing id replaces its previous chunks."
    }

    fn read_only(&self) -> bool {
        false
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "documents": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string", "description": "Document id; a UUID is generated when omitted" },
                            "content": { "type": "string", "description": "Document text" },
                            "metadata": {
                                "type": "object",
                                "description": "Scalar metadata. filePath, language and projectName are recognized"
                            }
                        },
                        "required": ["content"]
                    }
                },
                "upsert": { "type": "boolean", "default": true, "description": "Replace documents that already exist" }
            },
            "required": ["documents"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let args: IndexArgs = parse_args(self.name(), params)?;
        if args.documents.is_empty() {
            return Err(invalid("documents must not be empty"));
        }

        let mut docs = Vec::with_capacity(args.documents.len());
        for (i, arg) in args.documents.into_iter().enumerate() {
            let metadata = match &arg.metadata {
                Some(value) => Metadata::from_json(value)
                    .map_err(|e| invalid(format!("documents[{i}].metadata: {e}")))?,
                None => Metadata::default(),
            };
            docs.push(NewDocument {
                id: arg.id,
                content: arg.content,
                metadata,
            });
        }

        let report = ctx
            .collection()
            .store()
            .index_documents(docs, args.upsert)
            .await;
        let warning = if report.indexed > 0 {
            ctx.after_write().await
        } else {
            None
        };
        Ok(with_warning(serde_json::to_value(&report)?, warning))
    }
}

// ============ search ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchArgs {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    filter: Option<Value>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default = "default_include_documents")]
    include_documents: bool,
}

fn default_include_documents() -> bool {
    true
}

pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search indexed documents by meaning, keywords, or both, optionally restricted by a metadata filter"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Natural-language query" },
                "k": { "type": "integer", "minimum": 1, "default": DEFAULT_TOP_K, "description": "Number of chunks to return" },
                "filter": {
                    "type": "object",
                    "description": "Metadata filter, e.g. {\"language\": \"rust\"} or {\"$and\": [...]}"
                },
                "mode": {
                    "type": "string",
                    "enum": ["semantic", "keyword", "hybrid"],
                    "default": "semantic",
                    "description": "semantic: vector similarity; keyword: BM25; hybrid: rank fusion of both"
                },
                "includeDocuments": {
                    "type": "boolean",
                    "default": true,
                    "description": "Include chunkText, cut to 500 characters"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let args: SearchArgs = parse_args(self.name(), params)?;
        let filter = parse_filter(args.filter.as_ref())?;
        let mode = match args.mode.as_deref() {
            Some(mode) => mode.parse::<SearchMode>()?,
            None => SearchMode::default(),
        };
        let results = ctx
            .collection()
            .engine()
            .search_with_mode(
                &args.query,
                args.k.unwrap_or(DEFAULT_TOP_K),
                filter.as_ref(),
                mode,
            )
            .await?;

        let results: Vec<Value> = results
            .into_iter()
            .map(|r| {
                let mut entry = Map::new();
                entry.insert("documentId".into(), json!(r.document_id));
                if args.include_documents {
                    entry.insert("chunkText".into(), json!(preview(&r.chunk_text)));
                }
                entry.insert("score".into(), json!(r.score));
                entry.insert("metadata".into(), r.metadata.to_json());
                Value::Object(entry)
            })
            .collect();
        Ok(json!({ "mode": mode, "count": results.len(), "results": results }))
    }
}

// ============ deleteDocuments ============

#[derive(Deserialize)]
struct DeleteArgs {
    #[serde(default)]
    ids: Option<Vec<String>>,
    #[serde(default)]
    filter: Option<Value>,
}

pub struct DeleteDocumentsTool;

#[async_trait]
impl Tool for DeleteDocumentsTool {
    fn name(&self) -> &str {
        "deleteDocuments"
    }

    fn description(&self) -> &str {
        "Delete documents and all their chunks by id list and/or metadata filter"
    }

    fn read_only(&self) -> bool {
        false
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ids": { "type": "array", "items": { "type": "string" }, "description": "Document ids to delete" },
                "filter": { "type": "object", "description": "Delete every document whose metadata matches" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let args: DeleteArgs = parse_args(self.name(), params)?;
        let filter = parse_filter(args.filter.as_ref())?;
        let ids = args.ids.unwrap_or_default();
        if ids.is_empty() && filter.as_ref().map_or(true, MetadataFilter::is_empty) {
            return Err(invalid("deleteDocuments needs at least one of ids or filter"));
        }

        let store = ctx.collection().store();
        let mut report = store.delete_documents(&ids).await;
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            report.merge(store.delete_by_filter(&filter).await?);
        }
        // A failed delete may still have removed some chunks.
        let warning = if report.deleted > 0 || !report.failed.is_empty() {
            ctx.after_write().await
        } else {
            None
        };
        Ok(with_warning(serde_json::to_value(&report)?, warning))
    }
}

// ============ getCollectionInfo ============

pub struct CollectionInfoTool;

#[async_trait]
impl Tool for CollectionInfoTool {
    fn name(&self) -> &str {
        "getCollectionInfo"
    }

    fn description(&self) -> &str {
        "Document count, chunk count, embedding dimension, and collection name"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(serde_json::to_value(ctx.collection().info().await?)?)
    }
}

// ============ getDocumentsByPrefix ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrefixArgs {
    prefix: String,
    #[serde(default)]
    filter: Option<Value>,
    #[serde(default = "default_include_content")]
    include_content: bool,
    #[serde(default)]
    limit: Option<usize>,
}

fn default_include_content() -> bool {
    true
}

pub struct DocumentsByPrefixTool;

#[async_trait]
impl Tool for DocumentsByPrefixTool {
    fn name(&self) -> &str {
        "getDocumentsByPrefix"
    }

    fn description(&self) -> &str {
        "List documents whose id starts with a prefix, e.g. everything registered under 'proj:src/'"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prefix": { "type": "string", "description": "Document id prefix" },
                "filter": { "type": "object", "description": "Metadata filter, e.g. {\"fileType\": \"code\"}" },
                "includeContent": { "type": "boolean", "default": true },
                "limit": { "type": "integer", "minimum": 1 }
            },
            "required": ["prefix"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let args: PrefixArgs = parse_args(self.name(), params)?;
        if args.prefix.trim().is_empty() {
            return Err(invalid("prefix must not be empty"));
        }
        if args.limit == Some(0) {
            return Err(invalid("limit must be at least 1"));
        }
        let filter = parse_filter(args.filter.as_ref())?;

        let docs = ctx
            .collection()
            .store()
            .get_documents_by_prefix(&args.prefix, filter.as_ref(), args.limit);

        let documents: Vec<Value> = docs
            .into_iter()
            .map(|doc| {
                let mut entry = Map::new();
                entry.insert("id".into(), json!(doc.id));
                entry.insert("metadata".into(), doc.metadata.to_json());
                entry.insert("chunkCount".into(), json!(doc.chunk_ids.len()));
                entry.insert("updatedAt".into(), json!(doc.updated_at.to_rfc3339()));
                if args.include_content {
                    entry.insert("content".into(), json!(doc.content));
                }
                Value::Object(entry)
            })
            .collect();

        Ok(json!({
            "prefix": args.prefix,
            "count": documents.len(),
            "documents": documents,
        }))
    }
}

// ============ Registry ============

/// The set of tools served over MCP.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with every built-in tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(IndexDocumentsTool));
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(DeleteDocumentsTool));
        registry.register(Box::new(CollectionInfoTool));
        registry.register(Box::new(DocumentsByPrefixTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use semche_core::embedding::HashingProvider;

    async fn context(dir: &std::path::Path) -> ToolContext {
        let mut config = Config::default();
        config.collection.persist_directory = dir.to_path_buf();
        let collection = Collection::open_with_provider(&config, Arc::new(HashingProvider::new(64)))
            .await
            .unwrap();
        ToolContext::new(Arc::new(collection))
    }

    async fn call(ctx: &ToolContext, name: &str, params: Value) -> Result<Value> {
        let registry = ToolRegistry::with_builtins();
        registry.find(name).unwrap().execute(params, ctx).await
    }

    fn is_validation(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_)))
    }

    #[tokio::test]
    async fn test_index_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let out = call(
            &ctx,
            "indexDocuments",
            json!({
                "documents": [
                    { "id": "a", "content": "tokio runtime and async tasks", "metadata": { "language": "rust" } },
                    { "id": "b", "content": "pandas dataframes and numpy", "metadata": { "language": "python" } }
                ]
            }),
        )
        .await
        .unwrap();
        assert_eq!(out["indexed"], 2);
        assert_eq!(out["failed"], json!([]));
        assert!(ctx.collection().snapshot_path().exists());

        let out = call(
            &ctx,
            "search",
            json!({ "query": "async tasks", "k": 5, "filter": { "language": "python" } }),
        )
        .await
        .unwrap();
        let results = out["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["documentId"], "b");
        assert!(results[0]["chunkText"].is_string());
        assert!(results[0]["score"].is_number());
    }

    #[tokio::test]
    async fn test_index_reports_per_document_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let out = call(
            &ctx,
            "indexDocuments",
            json!({ "documents": [ { "id": "ok", "content": "fine" }, { "id": "bad", "content": "" } ] }),
        )
        .await
        .unwrap();
        assert_eq!(out["indexed"], 1);
        assert_eq!(out["ids"], json!(["ok"]));
        assert_eq!(out["failed"][0]["id"], "bad");
    }

    #[tokio::test]
    async fn test_nested_metadata_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let err = call(
            &ctx,
            "indexDocuments",
            json!({ "documents": [ { "content": "x", "metadata": { "tags": ["a"] } } ] }),
        )
        .await
        .unwrap_err();
        assert!(is_validation(&err));
    }

    #[tokio::test]
    async fn test_delete_requires_ids_or_filter() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let err = call(&ctx, "deleteDocuments", json!({})).await.unwrap_err();
        assert!(is_validation(&err));
    }

    #[tokio::test]
    async fn test_delete_by_ids_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        call(
            &ctx,
            "indexDocuments",
            json!({
                "documents": [
                    { "id": "a", "content": "one", "metadata": { "projectName": "x" } },
                    { "id": "b", "content": "two", "metadata": { "projectName": "y" } },
                    { "id": "c", "content": "three", "metadata": { "projectName": "y" } }
                ]
            }),
        )
        .await
        .unwrap();

        let out = call(
            &ctx,
            "deleteDocuments",
            json!({ "ids": ["a", "missing"], "filter": { "projectName": "y" } }),
        )
        .await
        .unwrap();
        assert_eq!(out["deleted"], 3);
        assert_eq!(out["failed"], json!([]));

        let info = call(&ctx, "getCollectionInfo", json!({})).await.unwrap();
        assert_eq!(info["documentCount"], 0);
        assert_eq!(info["chunkCount"], 0);
        assert_eq!(info["embeddingDimension"], 64);
    }

    #[tokio::test]
    async fn test_documents_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        call(
            &ctx,
            "indexDocuments",
            json!({
                "documents": [
                    { "id": "proj:a.md", "content": "alpha", "metadata": { "fileType": "note" } },
                    { "id": "proj:b.rs", "content": "beta", "metadata": { "fileType": "code" } },
                    { "id": "other:c.md", "content": "gamma" }
                ]
            }),
        )
        .await
        .unwrap();

        let out = call(
            &ctx,
            "getDocumentsByPrefix",
            json!({ "prefix": "proj:", "filter": { "fileType": "code" }, "includeContent": false }),
        )
        .await
        .unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["documents"][0]["id"], "proj:b.rs");
        assert!(out["documents"][0].get("content").is_none());

        let err = call(&ctx, "getDocumentsByPrefix", json!({ "prefix": " " }))
            .await
            .unwrap_err();
        assert!(is_validation(&err));
    }

    #[tokio::test]
    async fn test_search_rejects_missing_query() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let err = call(&ctx, "search", json!({ "k": 3 })).await.unwrap_err();
        assert!(is_validation(&err));
        let err = call(&ctx, "search", json!({ "query": "x", "k": 0 })).await.unwrap_err();
        assert!(is_validation(&err));
        let err = call(&ctx, "search", json!({ "query": "x", "mode": "fuzzy" }))
            .await
            .unwrap_err();
        assert!(is_validation(&err));
    }

    #[tokio::test]
    async fn test_search_modes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        call(
            &ctx,
            "indexDocuments",
            json!({
                "documents": [
                    { "id": "wal", "content": "write ahead logging for crash recovery" },
                    { "id": "cook", "content": "slow roasted tomatoes" }
                ]
            }),
        )
        .await
        .unwrap();

        let out = call(&ctx, "search", json!({ "query": "crash recovery", "mode": "keyword" }))
            .await
            .unwrap();
        assert_eq!(out["mode"], "keyword");
        assert_eq!(out["count"], 1);
        assert_eq!(out["results"][0]["documentId"], "wal");

        let out = call(&ctx, "search", json!({ "query": "crash recovery", "mode": "hybrid", "k": 2 }))
            .await
            .unwrap();
        assert_eq!(out["mode"], "hybrid");
        assert_eq!(out["results"][0]["documentId"], "wal");

        let out = call(&ctx, "search", json!({ "query": "crash recovery" })).await.unwrap();
        assert_eq!(out["mode"], "semantic");
    }

    #[tokio::test]
    async fn test_search_previews_and_omits_chunk_text() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let long = "é".repeat(900);
        call(&ctx, "indexDocuments", json!({ "documents": [ { "id": "long", "content": long } ] }))
            .await
            .unwrap();

        let out = call(&ctx, "search", json!({ "query": "é", "k": 1 })).await.unwrap();
        let text = out["results"][0]["chunkText"].as_str().unwrap();
        assert_eq!(text.chars().count(), PREVIEW_CHARS + 3);
        assert!(text.ends_with("..."));
        assert!(text.starts_with("éé"));

        let out = call(&ctx, "search", json!({ "query": "é", "k": 1, "includeDocuments": false }))
            .await
            .unwrap();
        let result = &out["results"][0];
        assert_eq!(result["documentId"], "long");
        assert!(result.get("chunkText").is_none());
        assert!(result["score"].is_number());
    }

    #[test]
    fn test_preview_keeps_short_text() {
        assert_eq!(preview("short"), "short");
        let exact = "x".repeat(PREVIEW_CHARS);
        assert_eq!(preview(&exact), exact);
    }

    /// A directory squatting on the temp snapshot path makes every flush fail.
    fn block_flush(ctx: &ToolContext) {
        let tmp = ctx.collection().snapshot_path().with_extension("json.tmp");
        std::fs::create_dir_all(tmp).unwrap();
    }

    #[tokio::test]
    async fn test_index_reports_unpersisted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        block_flush(&ctx);

        let out = call(
            &ctx,
            "indexDocuments",
            json!({ "documents": [ { "id": "a", "content": "kept in memory" }, { "id": "b", "content": "" } ] }),
        )
        .await
        .unwrap();
        assert_eq!(out["indexed"], 1);
        assert_eq!(out["ids"], json!(["a"]));
        assert_eq!(out["failed"][0]["id"], "b");
        assert!(out["warning"].as_str().unwrap().contains("not persisted"));
        assert!(ctx.collection().store().contains("a"));
    }

    #[tokio::test]
    async fn test_delete_reports_unpersisted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        call(
            &ctx,
            "indexDocuments",
            json!({ "documents": [ { "id": "a", "content": "one" }, { "id": "b", "content": "two" } ] }),
        )
        .await
        .unwrap();
        block_flush(&ctx);

        let out = call(&ctx, "deleteDocuments", json!({ "ids": ["a", "b", "missing"] }))
            .await
            .unwrap();
        assert_eq!(out["deleted"], 2);
        assert_eq!(out["failed"], json!([]));
        assert!(out["warning"].as_str().unwrap().contains("not persisted"));
        assert_eq!(ctx.collection().store().document_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_writes_carry_no_warning() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let out = call(&ctx, "indexDocuments", json!({ "documents": [ { "id": "a", "content": "one" } ] }))
            .await
            .unwrap();
        assert!(out.get("warning").is_none());
        let out = call(&ctx, "deleteDocuments", json!({ "ids": ["a"] })).await.unwrap();
        assert_eq!(out["deleted"], 1);
        assert!(out.get("warning").is_none());
    }
}
