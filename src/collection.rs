//! An opened collection: the explicitly owned context every command and
//! tool call works against.
//!
//! A collection is persisted as a single JSON snapshot at
//! `<persist_directory>/<name>.json` holding the collection parameters, the
//! document records and every chunk with its vector. The HNSW graph is not
//! stored; it is rebuilt from the chunks on open. Snapshots are written to a
//! temporary file and renamed into place.
//!
//! Loading reconciles records with chunks, so a snapshot written by an older
//! build or edited by hand cannot leave orphan chunks in search results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use semche_core::embedding::EmbeddingProvider;
use semche_core::index::{InMemoryIndex, VectorIndex};
use semche_core::models::{CollectionConfig, Document, EmbeddedChunk};
use semche_core::search::{CollectionInfo, QueryEngine};
use semche_core::store::{DocumentStore, StoreSnapshot};

use crate::config::Config;
use crate::embedding::create_provider;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: u32,
    collection: CollectionConfig,
    embedding_model: String,
    documents: Vec<Document>,
    chunks: Vec<EmbeddedChunk>,
}

pub struct Collection {
    store: Arc<DocumentStore>,
    engine: QueryEngine,
    snapshot_path: PathBuf,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Collection {
    /// Open the configured collection, creating it if no snapshot exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        Self::open_with_provider(config, embedder).await
    }

    /// Open with an explicit embedding provider.
    pub async fn open_with_provider(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let requested = config.collection_config(embedder.dims());
        requested.validate()?;

        let persist_dir = &config.collection.persist_directory;
        tokio::fs::create_dir_all(persist_dir)
            .await
            .with_context(|| format!("Failed to create persist directory: {}", persist_dir.display()))?;
        let snapshot_path = config.snapshot_path();

        let (index, documents) = match read_snapshot(&snapshot_path).await? {
            Some(snapshot) => {
                snapshot.collection.check_compatible(&requested)?;
                if snapshot.collection.m != requested.m
                    || snapshot.collection.ef_construction != requested.ef_construction
                {
                    tracing::warn!(
                        collection = %requested.name,
                        stored_m = snapshot.collection.m,
                        stored_ef_construction = snapshot.collection.ef_construction,
                        "graph parameters are fixed at creation; using the stored values"
                    );
                }
                if snapshot.embedding_model != embedder.model_name() {
                    tracing::warn!(
                        stored = %snapshot.embedding_model,
                        configured = %embedder.model_name(),
                        "embedding model differs from the one the collection was built with"
                    );
                }
                let index_config = CollectionConfig {
                    ef_search: requested.ef_search,
                    ..snapshot.collection
                };
                tracing::info!(
                    collection = %index_config.name,
                    documents = snapshot.documents.len(),
                    chunks = snapshot.chunks.len(),
                    "loaded collection snapshot"
                );
                let state = StoreSnapshot {
                    documents: snapshot.documents,
                    chunks: snapshot.chunks,
                }
                .reconcile();
                let index = InMemoryIndex::with_entries(index_config, state.chunks)?;
                (index, state.documents)
            }
            None => {
                tracing::info!(collection = %requested.name, "creating new collection");
                (InMemoryIndex::new(requested)?, Vec::new())
            }
        };

        let index: Arc<dyn VectorIndex> = Arc::new(index);
        let store = Arc::new(DocumentStore::new(index, embedder, config.store_options())?);
        store.restore(documents);

        Ok(Self {
            engine: QueryEngine::new(Arc::clone(&store)),
            store,
            snapshot_path,
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub async fn info(&self) -> Result<CollectionInfo> {
        Ok(self.engine.collection_info().await?)
    }

    /// Write the current state to the snapshot file.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let state = self.store.snapshot().await?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            collection: self.store.index().config().clone(),
            embedding_model: self.store.embedder().model_name().to_string(),
            documents: state.documents,
            chunks: state.chunks,
        };
        let bytes = serde_json::to_vec(&snapshot).context("Failed to serialize snapshot")?;

        let tmp = self.snapshot_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.snapshot_path)
            .await
            .with_context(|| format!("Failed to replace snapshot: {}", self.snapshot_path.display()))?;

        tracing::debug!(
            path = %self.snapshot_path.display(),
            documents = snapshot.documents.len(),
            chunks = snapshot.chunks.len(),
            "flushed snapshot"
        );
        Ok(())
    }

    /// Flush and release the collection.
    pub async fn close(self) -> Result<()> {
        self.flush().await
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read snapshot: {}", path.display()))
        }
    };
    let snapshot: Snapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("Corrupt snapshot: {}", path.display()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        anyhow::bail!(
            "Unsupported snapshot version {} in {}",
            snapshot.version,
            path.display()
        );
    }
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use semche_core::embedding::HashingProvider;
    use semche_core::models::{DistanceMetric, NewDocument};
    use semche_core::Error;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.collection.persist_directory = dir.to_path_buf();
        config.collection.name = "test".into();
        config
    }

    fn provider(dims: usize) -> Arc<dyn EmbeddingProvider> {
        Arc::new(HashingProvider::new(dims))
    }

    #[tokio::test]
    async fn test_reopen_restores_documents_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let collection = Collection::open_with_provider(&config, provider(64)).await.unwrap();
        collection
            .store()
            .index_document(NewDocument::new("persist me please").with_id("doc"), true)
            .await
            .unwrap();
        let before = collection.info().await.unwrap();
        collection.close().await.unwrap();

        let reopened = Collection::open_with_provider(&config, provider(64)).await.unwrap();
        assert_eq!(reopened.info().await.unwrap(), before);
        let results = reopened
            .engine()
            .search("persist me please", 1, None)
            .await
            .unwrap();
        assert_eq!(results[0].document_id, "doc");
    }

    #[tokio::test]
    async fn test_dimension_change_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        Collection::open_with_provider(&config, provider(64))
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let err = Collection::open_with_provider(&config, provider(32))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::IncompatibleCollection { .. })
        ));
    }

    #[tokio::test]
    async fn test_metric_change_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        Collection::open_with_provider(&config, provider(64))
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        config.collection.metric = DistanceMetric::InnerProduct;
        let err = Collection::open_with_provider(&config, provider(64))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<Error>().map(Error::kind),
            Some("IncompatibleCollectionError")
        );
    }

    #[tokio::test]
    async fn test_flush_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::open_with_provider(&config(dir.path()), provider(16))
            .await
            .unwrap();
        collection.flush().await.unwrap();
        assert!(collection.snapshot_path().exists());
        assert!(!collection.snapshot_path().with_extension("json.tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flush_during_writes_is_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let collection = Arc::new(Collection::open_with_provider(&config, provider(32)).await.unwrap());

        let writer = {
            let collection = Arc::clone(&collection);
            tokio::spawn(async move {
                for round in 0..5 {
                    for i in 0..20 {
                        let content = if (round + i) % 2 == 0 {
                            format!("long body {i} ").repeat(200)
                        } else {
                            format!("short body {i}")
                        };
                        collection
                            .store()
                            .index_document(NewDocument::new(content).with_id(format!("d{i}")), true)
                            .await
                            .unwrap();
                    }
                }
            })
        };

        let mut checked = 0;
        while !writer.is_finished() || checked == 0 {
            collection.flush().await.unwrap();
            let snapshot = read_snapshot(collection.snapshot_path()).await.unwrap().unwrap();
            let listed: HashSet<&str> = snapshot
                .documents
                .iter()
                .flat_map(|d| d.chunk_ids.iter().map(String::as_str))
                .collect();
            let stored: HashSet<&str> = snapshot.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
            assert_eq!(listed, stored, "snapshot {checked} is not a consistent cut");
            checked += 1;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_load_drops_orphan_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let collection = Collection::open_with_provider(&config, provider(16)).await.unwrap();
        for id in ["kept", "gone"] {
            collection
                .store()
                .index_document(NewDocument::new(format!("{id} text")).with_id(id), true)
                .await
                .unwrap();
        }
        collection.close().await.unwrap();

        let mut snapshot = read_snapshot(&config.snapshot_path()).await.unwrap().unwrap();
        snapshot.documents.retain(|d| d.id == "kept");
        std::fs::write(config.snapshot_path(), serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let reopened = Collection::open_with_provider(&config, provider(16)).await.unwrap();
        let info = reopened.info().await.unwrap();
        assert_eq!(info.document_count, 1);
        assert_eq!(info.chunk_count, 1);
        let results = reopened.engine().search("gone text", 5, None).await.unwrap();
        assert!(results.iter().all(|r| r.document_id == "kept"));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(config.snapshot_path(), b"{ not json").unwrap();
        let err = Collection::open_with_provider(&config, provider(16))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Corrupt snapshot"));
    }
}
