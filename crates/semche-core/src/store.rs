//! Document store: keeps document records and the vector index consistent.
//!
//! Re-indexing a document runs in two phases. The read phase chunks the new
//! content and embeds every chunk whose hash is not already stored; it has
//! no side effects, so failing or being cancelled there leaves the prior
//! version untouched. The write phase upserts the new chunks, deletes
//! orphaned chunk ids and commits the record. It runs on a spawned task
//! that owns the document lock, so dropping the caller's future cannot stop
//! it halfway.
//!
//! Write phases hold the read side of a commit gate; [`DocumentStore::snapshot`]
//! takes the write side, so a snapshot never sees a record without its
//! chunks or chunks without their record.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};

use crate::chunk::{chunk_document, ChunkOptions};
use crate::embedding::{normalize, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::filter::MetadataFilter;
use crate::index::VectorIndex;
use crate::models::{Chunk, Document, EmbeddedChunk, Metadata, MetadataValue, NewDocument};

pub const DEFAULT_EMBED_CONCURRENCY: usize = 4;
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;

/// Tunables for [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub chunk: ChunkOptions,
    /// Maximum embedding requests in flight for one document.
    pub embed_concurrency: usize,
    /// Chunk texts sent per embedding request.
    pub embed_batch_size: usize,
    /// L2-normalize vectors returned by the provider.
    pub normalize_embeddings: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            chunk: ChunkOptions::default(),
            embed_concurrency: DEFAULT_EMBED_CONCURRENCY,
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            normalize_embeddings: false,
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<()> {
        self.chunk.validate()?;
        if self.embed_concurrency == 0 {
            return Err(Error::Config("embed concurrency must be positive".into()));
        }
        if self.embed_batch_size == 0 {
            return Err(Error::Config("embed batch size must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of a batch index request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub indexed: usize,
    pub ids: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub id: String,
    pub kind: &'static str,
    pub error: String,
}

/// Outcome of a multi-document delete.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: Vec<BatchFailure>,
}

impl DeleteReport {
    fn record(&mut self, id: &str, result: Result<bool>) {
        match result {
            Ok(true) => self.deleted += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(doc_id = %id, error = %err, "failed to delete document");
                self.failed.push(BatchFailure {
                    id: id.to_string(),
                    kind: err.kind(),
                    error: err.to_string(),
                });
            }
        }
    }

    pub fn merge(&mut self, other: DeleteReport) {
        self.deleted += other.deleted;
        self.failed.extend(other.failed);
    }
}

/// A consistent cut of document records and index chunks.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub documents: Vec<Document>,
    pub chunks: Vec<EmbeddedChunk>,
}

impl StoreSnapshot {
    /// Drop chunks that no record lists and strip record chunk ids that have
    /// no stored chunk. Records left without any chunk are dropped.
    pub fn reconcile(self) -> Self {
        let StoreSnapshot {
            mut documents,
            chunks,
        } = self;

        let listed: HashSet<(String, String)> = documents
            .iter()
            .flat_map(|d| d.chunk_ids.iter().map(|c| (d.id.clone(), c.clone())))
            .collect();
        let chunk_total = chunks.len();
        let chunks: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .filter(|c| listed.contains(&(c.chunk.document_id.clone(), c.chunk.id.clone())))
            .collect();
        let orphan_chunks = chunk_total - chunks.len();

        let stored: HashSet<&str> = chunks.iter().map(|c| c.chunk.id.as_str()).collect();
        let mut repaired = 0;
        for doc in &mut documents {
            let before = doc.chunk_ids.len();
            doc.chunk_ids.retain(|id| stored.contains(id.as_str()));
            if doc.chunk_ids.len() != before {
                repaired += 1;
            }
        }
        let record_total = documents.len();
        documents.retain(|d| !d.chunk_ids.is_empty());
        let dropped = record_total - documents.len();

        if orphan_chunks > 0 || repaired > 0 {
            tracing::warn!(
                orphan_chunks,
                repaired_records = repaired,
                dropped_records = dropped,
                "reconciled document records with stored chunks"
            );
        }
        Self { documents, chunks }
    }
}

type DocumentMap = Arc<RwLock<HashMap<String, Document>>>;
type LockTable = Arc<Mutex<HashMap<String, LockSlot>>>;

struct LockSlot {
    mutex: Arc<AsyncMutex<()>>,
    holders: usize,
}

/// A held (or awaited) per-document lock. The table entry is removed when
/// the last holder drops, including when a waiting future is cancelled.
struct DocumentLock {
    table: LockTable,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock();
        if let Some(slot) = table.get_mut(&self.id) {
            slot.holders -= 1;
            if slot.holders == 0 {
                table.remove(&self.id);
            }
        }
    }
}

/// Owns document records and coordinates every mutation of the index.
pub struct DocumentStore {
    documents: DocumentMap,
    locks: LockTable,
    commit_gate: Arc<AsyncRwLock<()>>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: StoreOptions,
}

impl DocumentStore {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        options: StoreOptions,
    ) -> Result<Self> {
        options.validate()?;
        if embedder.dims() != index.config().dimension {
            return Err(Error::Config(format!(
                "embedding model '{}' produces {} dimensions but collection '{}' expects {}",
                embedder.model_name(),
                embedder.dims(),
                index.config().name,
                index.config().dimension
            )));
        }
        Ok(Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            commit_gate: Arc::new(AsyncRwLock::new(())),
            index,
            embedder,
            options,
        })
    }

    /// Replace all document records, e.g. after loading a snapshot.
    pub fn restore(&self, documents: Vec<Document>) {
        let mut map = self.documents.write();
        map.clear();
        map.extend(documents.into_iter().map(|d| (d.id.clone(), d)));
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.read().contains_key(id)
    }

    pub fn get_document(&self, id: &str) -> Option<Document> {
        self.documents.read().get(id).cloned()
    }

    /// Every document record, ordered by id.
    pub fn documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.documents.read().values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    /// Records and chunks as of one instant: waits for in-flight write
    /// phases to finish and holds off new ones while it reads.
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        let _gate = self.commit_gate.write().await;
        let documents = self.documents();
        let chunks = self.index.entries().await?;
        Ok(StoreSnapshot { documents, chunks })
    }

    /// Documents whose id starts with `prefix`, ordered by id.
    pub fn get_documents_by_prefix(
        &self,
        prefix: &str,
        filter: Option<&MetadataFilter>,
        limit: Option<usize>,
    ) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .values()
            .filter(|d| d.id.starts_with(prefix))
            .filter(|d| filter.map_or(true, |f| f.matches(&document_view(d))))
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        docs
    }

    /// Index one document. With `upsert`, an existing document with the
    /// same id is replaced; without it, that is a [`Error::DuplicateDocument`].
    pub async fn index_document(&self, doc: NewDocument, upsert: bool) -> Result<Document> {
        let id = match doc.id {
            Some(id) if id.trim().is_empty() => {
                return Err(Error::Validation("document id must not be empty".into()))
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        if doc.content.trim().is_empty() {
            return Err(Error::Validation(format!(
                "document '{id}' has empty content"
            )));
        }

        let lock = self.lock_document(&id).await;
        self.index_locked(lock, id, doc.content, doc.metadata, upsert)
            .await
    }

    /// Index a batch, reporting success or failure per document.
    pub async fn index_documents(&self, docs: Vec<NewDocument>, upsert: bool) -> BatchReport {
        let mut report = BatchReport::default();
        for mut doc in docs {
            let id = doc
                .id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            match self.index_document(doc, upsert).await {
                Ok(indexed) => {
                    report.indexed += 1;
                    report.ids.push(indexed.id);
                }
                Err(err) => {
                    tracing::warn!(doc_id = %id, error = %err, "failed to index document");
                    report.failed.push(BatchFailure {
                        id,
                        kind: err.kind(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn index_locked(
        &self,
        lock: DocumentLock,
        id: String,
        content: String,
        metadata: Metadata,
        upsert: bool,
    ) -> Result<Document> {
        let existing = self.get_document(&id);
        if existing.is_some() && !upsert {
            return Err(Error::DuplicateDocument(id));
        }

        let now = Utc::now();
        let mut chunks = chunk_document(&id, &content, &metadata, &self.options.chunk)?;
        if metadata.get("updatedAt").is_none() {
            for chunk in &mut chunks {
                chunk
                    .metadata
                    .extra
                    .insert("updatedAt".into(), MetadataValue::String(now.to_rfc3339()));
            }
        }

        let previous = match &existing {
            Some(old) => self.index.get(&old.chunk_ids).await?,
            None => Vec::new(),
        };
        let embedded = self.embed_chunks(chunks, &previous).await?;

        let record = Document {
            id: id.clone(),
            content,
            metadata,
            chunk_ids: embedded.iter().map(|e| e.chunk.id.clone()).collect(),
            updated_at: now,
        };
        let old_chunk_ids = existing.map(|d| d.chunk_ids).unwrap_or_default();

        let index = Arc::clone(&self.index);
        let documents = Arc::clone(&self.documents);
        let gate = Arc::clone(&self.commit_gate);
        let write = tokio::spawn(async move {
            let _lock = lock;
            let _gate = gate.read().await;
            commit(index, documents, record, embedded, previous, old_chunk_ids).await
        });
        write
            .await
            .map_err(|e| Error::index_write("index_document", &id, e))?
    }

    /// Embed `chunks`, reusing vectors from `previous` for unchanged text.
    async fn embed_chunks(
        &self,
        chunks: Vec<Chunk>,
        previous: &[EmbeddedChunk],
    ) -> Result<Vec<EmbeddedChunk>> {
        let reusable: HashMap<&str, &Vec<f32>> = previous
            .iter()
            .map(|e| (e.chunk.hash.as_str(), &e.vector))
            .collect();

        let mut vectors: Vec<Option<Vec<f32>>> = chunks
            .iter()
            .map(|c| reusable.get(c.hash.as_str()).map(|v| (*v).clone()))
            .collect();
        let pending: Vec<usize> = (0..chunks.len()).filter(|&i| vectors[i].is_none()).collect();

        tracing::debug!(
            chunks = chunks.len(),
            reused = chunks.len() - pending.len(),
            "embedding chunks"
        );

        let batches: Vec<Vec<usize>> = pending
            .chunks(self.options.embed_batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let embedded: Vec<(Vec<usize>, Vec<Vec<f32>>)> = stream::iter(batches)
            .map(|batch| {
                let texts: Vec<String> = batch.iter().map(|&i| chunks[i].text.clone()).collect();
                async move {
                    let out = self.embedder.embed(&texts).await?;
                    Ok::<_, Error>((batch, out))
                }
            })
            .buffered(self.options.embed_concurrency)
            .try_collect()
            .await?;

        let dims = self.index.config().dimension;
        for (batch, out) in embedded {
            if out.len() != batch.len() {
                return Err(Error::embedding(
                    "embed",
                    format!("requested {} vectors, got {}", batch.len(), out.len()),
                ));
            }
            for (i, mut vector) in batch.into_iter().zip(out) {
                if vector.len() != dims {
                    return Err(Error::embedding(
                        "embed",
                        format!(
                            "chunk '{}' embedded to {} dimensions, expected {dims}",
                            chunks[i].id,
                            vector.len()
                        ),
                    ));
                }
                if self.options.normalize_embeddings {
                    normalize(&mut vector);
                }
                vectors[i] = Some(vector);
            }
        }

        chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                let vector = vector.ok_or_else(|| {
                    Error::embedding("embed", format!("no vector produced for '{}'", chunk.id))
                })?;
                Ok(EmbeddedChunk { chunk, vector })
            })
            .collect()
    }

    /// Delete a document and all of its chunks. Returns false if the id is
    /// not registered.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        self.delete_if(id, |_| true).await
    }

    /// Delete several documents by id. A failure on one id is reported and
    /// the rest are still attempted.
    pub async fn delete_documents(&self, ids: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for id in ids {
            let result = self.delete_document(id).await;
            report.record(id, result);
        }
        report
    }

    /// Delete every document whose metadata matches `filter`.
    ///
    /// Each candidate is re-checked under its own lock, so a document
    /// re-indexed with non-matching metadata in the meantime survives.
    pub async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<DeleteReport> {
        if filter.is_empty() {
            return Err(Error::Validation(
                "refusing to delete with an empty filter".into(),
            ));
        }
        let candidates: Vec<String> = self
            .documents
            .read()
            .values()
            .filter(|d| filter.matches(&document_view(d)))
            .map(|d| d.id.clone())
            .collect();

        let mut report = DeleteReport::default();
        for id in candidates {
            let result = self
                .delete_if(&id, |d| filter.matches(&document_view(d)))
                .await;
            report.record(&id, result);
        }
        tracing::info!(
            deleted = report.deleted,
            failed = report.failed.len(),
            "deleted documents by filter"
        );
        Ok(report)
    }

    async fn delete_if<F>(&self, id: &str, predicate: F) -> Result<bool>
    where
        F: Fn(&Document) -> bool,
    {
        let lock = self.lock_document(id).await;
        let record = match self.get_document(id) {
            Some(record) if predicate(&record) => record,
            _ => return Ok(false),
        };

        let index = Arc::clone(&self.index);
        let documents = Arc::clone(&self.documents);
        let gate = Arc::clone(&self.commit_gate);
        let write = tokio::spawn(async move {
            let _lock = lock;
            let _gate = gate.read().await;
            index.delete_ids(&record.chunk_ids).await?;
            documents.write().remove(&record.id);
            tracing::info!(doc_id = %record.id, chunks = record.chunk_ids.len(), "deleted document");
            Ok::<_, Error>(())
        });
        write
            .await
            .map_err(|e| Error::index_write("delete_document", id, e))??;
        Ok(true)
    }

    async fn lock_document(&self, id: &str) -> DocumentLock {
        let mut lock = DocumentLock {
            table: Arc::clone(&self.locks),
            id: id.to_string(),
            guard: None,
        };
        let mutex = {
            let mut table = self.locks.lock();
            let slot = table.entry(id.to_string()).or_insert_with(|| LockSlot {
                mutex: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            Arc::clone(&slot.mutex)
        };
        lock.guard = Some(mutex.lock_owned().await);
        lock
    }
}

/// Write phase of an index operation.
async fn commit(
    index: Arc<dyn VectorIndex>,
    documents: DocumentMap,
    mut record: Document,
    embedded: Vec<EmbeddedChunk>,
    previous: Vec<EmbeddedChunk>,
    old_chunk_ids: Vec<String>,
) -> Result<Document> {
    let new_ids: HashSet<String> = record.chunk_ids.iter().cloned().collect();

    if let Err(err) = index.upsert(embedded).await {
        tracing::warn!(doc_id = %record.id, error = %err, "chunk upsert failed, restoring previous chunks");
        let old: HashSet<&String> = old_chunk_ids.iter().collect();
        let added: Vec<String> = new_ids.iter().filter(|id| !old.contains(id)).cloned().collect();
        if let Err(e) = index.delete_ids(&added).await {
            tracing::warn!(doc_id = %record.id, error = %e, "rollback delete failed");
        }
        if !previous.is_empty() {
            if let Err(e) = index.upsert(previous).await {
                tracing::warn!(doc_id = %record.id, error = %e, "rollback restore failed");
            }
        }
        return Err(err);
    }

    let orphans: Vec<String> = old_chunk_ids
        .into_iter()
        .filter(|id| !new_ids.contains(id))
        .collect();
    if !orphans.is_empty() {
        if let Err(err) = index.delete_ids(&orphans).await {
            // The orphans are still in the index, so the record keeps them.
            record.chunk_ids.extend(orphans);
            documents.write().insert(record.id.clone(), record);
            return Err(err);
        }
    }

    tracing::info!(
        doc_id = %record.id,
        chunks = record.chunk_ids.len(),
        "indexed document"
    );
    documents.write().insert(record.id.clone(), record.clone());
    Ok(record)
}

/// Document-level metadata used by filters: the record's metadata plus
/// `documentId` and `updatedAt`.
fn document_view(doc: &Document) -> Metadata {
    let mut view = doc.metadata.clone();
    view.extra
        .insert("documentId".into(), MetadataValue::from(doc.id.as_str()));
    view.extra
        .entry("updatedAt".into())
        .or_insert_with(|| MetadataValue::String(doc.updated_at.to_rfc3339()));
    view
}
