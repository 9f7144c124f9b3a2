//! End-to-end tool behavior against a real on-disk collection.

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use semche::collection::Collection;
use semche::config::Config;
use semche::tools::{ToolContext, ToolRegistry};
use semche_core::embedding::HashingProvider;

const DIMS: usize = 64;

struct Harness {
    _dir: TempDir,
    config: Config,
    registry: ToolRegistry,
    ctx: ToolContext,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.collection.persist_directory = dir.path().to_path_buf();
        config.collection.name = "tools".into();
        let ctx = ToolContext::new(Arc::new(open(&config).await));
        Self {
            _dir: dir,
            config,
            registry: ToolRegistry::with_builtins(),
            ctx,
        }
    }

    async fn call(&self, tool: &str, params: Value) -> anyhow::Result<Value> {
        let tool = self.registry.find(tool).expect("tool registered");
        tool.execute(params, &self.ctx).await
    }

    async fn info(&self) -> Value {
        self.call("getCollectionInfo", json!({})).await.unwrap()
    }

    async fn index(&self, documents: Value) -> Value {
        self.call("indexDocuments", json!({ "documents": documents }))
            .await
            .unwrap()
    }
}

async fn open(config: &Config) -> Collection {
    Collection::open_with_provider(config, Arc::new(HashingProvider::new(DIMS)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_exact_text_round_trip() {
    let h = Harness::new().await;
    h.index(json!([
        { "id": "doc1", "content": "Rust ownership and borrowing rules" },
        { "id": "doc2", "content": "Gardening tips for tomatoes in spring" },
    ]))
    .await;

    let out = h
        .call("search", json!({ "query": "Gardening tips for tomatoes in spring", "k": 1 }))
        .await
        .unwrap();
    let top = &out["results"][0];
    assert_eq!(top["documentId"], "doc2");
    assert_eq!(top["chunkText"], "Gardening tips for tomatoes in spring");
}

#[tokio::test]
async fn test_upsert_twice_is_idempotent() {
    let h = Harness::new().await;
    let doc = json!([{ "id": "same", "content": "stable content", "metadata": { "language": "en" } }]);
    h.index(doc.clone()).await;
    let first = h.info().await;
    h.index(doc).await;
    assert_eq!(h.info().await, first);
    assert_eq!(first["documentCount"], 1);
}

#[tokio::test]
async fn test_replace_with_shorter_content_drops_old_chunks() {
    let h = Harness::new().await;
    h.index(json!([{ "id": "long", "content": "A".repeat(1500) }])).await;
    assert_eq!(h.info().await["chunkCount"], 2);

    h.index(json!([{ "id": "long", "content": "short now" }])).await;
    let info = h.info().await;
    assert_eq!(info["chunkCount"], 1);
    assert_eq!(info["documentCount"], 1);

    let out = h
        .call("search", json!({ "query": "A".repeat(1000), "k": 5 }))
        .await
        .unwrap();
    let texts: Vec<&str> = out["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["chunkText"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["short now"]);
}

#[tokio::test]
async fn test_delete_removes_every_chunk() {
    let h = Harness::new().await;
    h.index(json!([
        { "id": "big", "content": "A".repeat(1500) },
        { "id": "small", "content": "unrelated words" },
    ]))
    .await;
    let before = h.info().await["chunkCount"].as_u64().unwrap();

    let out = h
        .call("deleteDocuments", json!({ "ids": ["big"] }))
        .await
        .unwrap();
    assert_eq!(out["deleted"], 1);
    assert_eq!(h.info().await["chunkCount"].as_u64().unwrap(), before - 2);

    let out = h
        .call("search", json!({ "query": "A".repeat(1500), "k": 10 }))
        .await
        .unwrap();
    assert!(out["results"]
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["documentId"] != "big"));
}

#[tokio::test]
async fn test_filtered_search_only_returns_matches() {
    let h = Harness::new().await;
    let docs: Vec<Value> = (0..20)
        .map(|i| {
            json!({
                "id": format!("doc{i}"),
                "content": format!("shared topic text number {i}"),
                "metadata": { "language": if i % 4 == 0 { "rust" } else { "python" } },
            })
        })
        .collect();
    h.index(Value::Array(docs)).await;

    let out = h
        .call(
            "search",
            json!({ "query": "shared topic text", "k": 10, "filter": { "language": "rust" } }),
        )
        .await
        .unwrap();
    let results = out["results"].as_array().unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r["metadata"]["language"] == "rust"));
}

#[tokio::test]
async fn test_scores_are_ordered() {
    let h = Harness::new().await;
    h.index(json!([
        { "content": "vector databases and similarity search" },
        { "content": "similarity search over embeddings" },
        { "content": "cooking pasta at home" },
    ]))
    .await;
    let out = h
        .call("search", json!({ "query": "similarity search", "k": 3 }))
        .await
        .unwrap();
    let scores: Vec<f64> = out["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["score"].as_f64().unwrap())
        .collect();
    assert_eq!(scores.len(), 3);
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn test_prefix_listing() {
    let h = Harness::new().await;
    h.index(json!([
        { "id": "kb:a.md", "content": "first" },
        { "id": "kb:b.md", "content": "second" },
        { "id": "other:c.md", "content": "third" },
    ]))
    .await;

    let out = h
        .call(
            "getDocumentsByPrefix",
            json!({ "prefix": "kb:", "includeContent": false }),
        )
        .await
        .unwrap();
    assert_eq!(out["count"], 2);
    assert_eq!(out["documents"][0]["id"], "kb:a.md");
    assert!(out["documents"][0].get("content").is_none());
}

#[tokio::test]
async fn test_writes_survive_reopen() {
    let h = Harness::new().await;
    h.index(json!([{ "id": "kept", "content": "durable text" }])).await;
    let info = h.info().await;

    let reopened = open(&h.config).await;
    let reopened_info = serde_json::to_value(reopened.info().await.unwrap()).unwrap();
    assert_eq!(reopened_info, info);
    assert!(reopened.store().contains("kept"));
}

#[tokio::test]
async fn test_reopen_with_other_dimension_is_rejected() {
    let h = Harness::new().await;
    h.index(json!([{ "id": "x", "content": "some text" }])).await;

    let err = Collection::open_with_provider(&h.config, Arc::new(HashingProvider::new(DIMS * 2)))
        .await
        .err()
        .unwrap();
    let core = err.downcast_ref::<semche_core::Error>().unwrap();
    assert_eq!(core.kind(), "IncompatibleCollectionError");
}
