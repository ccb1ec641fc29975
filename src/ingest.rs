//! Ingestion coordination: the saga that keeps three stores consistent.
//!
//! Each attempt walks `Received → ContentStored → Extracted → Embedded →
//! Indexed → Committed`, recording progress in the catalog's ingestion
//! ledger and running compensating actions when a step fails. The ordering
//! rationale: the catalog row is the single source of truth for "this
//! document is queryable" and is written last, so a crash at any earlier
//! point leaves only orphans (blob, vectors, ledger row) that the
//! reconciliation sweep collects — never a half-visible document.
//!
//! Same-ID attempts are serialized through a per-document async mutex;
//! distinct documents ingest in parallel. Re-ingestion of an existing ID
//! builds the new version completely (extract, chunk, embed) before
//! touching the index, publishes the new vector set atomically, and swaps
//! the catalog row; the old version stays queryable throughout.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunker;
use crate::config::ChunkingConfig;
use crate::content::ContentStore;
use crate::catalog::MetadataCatalog;
use crate::embedding::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::extract;
use crate::index::VectorIndex;
use crate::models::{
    Chunk, ChunkId, DeclaredMetadata, Document, IngestState, IngestionRecord, IngestionStatus,
};

pub struct IngestionCoordinator {
    content: Arc<dyn ContentStore>,
    catalog: Arc<dyn MetadataCatalog>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<EmbeddingGateway>,
    chunking: ChunkingConfig,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl IngestionCoordinator {
    pub fn new(
        content: Arc<dyn ContentStore>,
        catalog: Arc<dyn MetadataCatalog>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<EmbeddingGateway>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            content,
            catalog,
            index,
            embedder,
            chunking,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize work on one document ID.
    async fn lock_document(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Ingest a new document. Returns the committed document's ID.
    ///
    /// Idempotent against retries: identical content + metadata resolves to
    /// the already-committed document instead of creating a second one, and
    /// a retry of a failed attempt reuses the failed attempt's ID.
    pub async fn ingest(&self, bytes: &[u8], metadata: &DeclaredMetadata) -> Result<Uuid> {
        validate(bytes, metadata)?;
        let dedup_hash = dedup_hash(bytes, metadata);

        if let Some(existing) = self.catalog.find_by_dedup_hash(&dedup_hash).await? {
            if existing.ingestion_status == IngestionStatus::Indexed {
                info!(id = %existing.id, "ingest skipped: identical document already committed");
                return Ok(existing.id);
            }
        }

        // A failed attempt for the same input left a ledger row; resume its ID
        // so the retry converges on one document.
        let doc_id = self
            .catalog
            .list_ingestions()
            .await?
            .into_iter()
            .find(|r| r.dedup_hash == dedup_hash)
            .map(|r| r.document_id)
            .unwrap_or_else(Uuid::new_v4);

        let lock = self.lock_document(doc_id).await;
        let _guard = lock.lock().await;

        // Re-check under the lock: a concurrent retry may have committed.
        if let Some(existing) = self.catalog.find_by_dedup_hash(&dedup_hash).await? {
            if existing.ingestion_status == IngestionStatus::Indexed {
                return Ok(existing.id);
            }
        }

        self.run_pipeline(doc_id, bytes, metadata, &dedup_hash, false)
            .await?;
        Ok(doc_id)
    }

    /// Re-ingest new content under an existing document ID (update).
    ///
    /// The old version remains fully queryable until the new one commits.
    pub async fn reingest(&self, id: Uuid, bytes: &[u8], metadata: &DeclaredMetadata) -> Result<()> {
        validate(bytes, metadata)?;
        let dedup_hash = dedup_hash(bytes, metadata);

        let lock = self.lock_document(id).await;
        let _guard = lock.lock().await;

        if self.catalog.get(id).await?.is_none() {
            return Err(Error::NotFound(format!("document {id}")));
        }

        self.run_pipeline(id, bytes, metadata, &dedup_hash, true).await
    }

    /// Delete a document from all three stores.
    ///
    /// Removal order is vectors → blob → catalog row: the authoritative
    /// metadata disappears last, so nothing can be attributed to a document
    /// that still has data lying around. Concurrent queries holding stale
    /// chunk IDs fail closed to not-found.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_document(id).await;
        let _guard = lock.lock().await;

        if self.catalog.get(id).await?.is_none() {
            return Err(Error::NotFound(format!("document {id}")));
        }

        let removed = self.index.delete_document(id).await?;
        self.content.delete(id).await?;
        self.catalog.delete(id).await?;
        self.catalog.remove_ingestion(id).await?;
        info!(%id, vectors_removed = removed, "document deleted");
        Ok(())
    }

    /// State of the most recent attempt for a document, if a ledger entry
    /// remains (committed attempts clear theirs).
    pub async fn attempt_state(&self, id: Uuid) -> Result<Option<IngestState>> {
        Ok(self.catalog.get_ingestion(id).await?.map(|r| r.state))
    }

    async fn mark(&self, id: Uuid, dedup_hash: &str, state: IngestState) -> Result<()> {
        let now = Utc::now();
        let existing = self.catalog.get_ingestion(id).await?;
        let record = IngestionRecord {
            document_id: id,
            dedup_hash: dedup_hash.to_string(),
            state,
            started_at: existing.map(|r| r.started_at).unwrap_or(now),
            updated_at: now,
        };
        self.catalog.upsert_ingestion(&record).await
    }

    /// The forward steps of the saga, with compensation on failure.
    async fn run_pipeline(
        &self,
        id: Uuid,
        bytes: &[u8],
        metadata: &DeclaredMetadata,
        dedup_hash: &str,
        is_update: bool,
    ) -> Result<()> {
        self.mark(id, dedup_hash, IngestState::Received).await?;

        // Received → ContentStored
        let storage_pointer = match self.content.put(id, metadata.doc_type, bytes).await {
            Ok(pointer) => pointer,
            Err(e) => {
                self.mark(id, dedup_hash, IngestState::Failed).await.ok();
                return Err(e);
            }
        };
        self.mark(id, dedup_hash, IngestState::ContentStored).await?;

        // ContentStored → Extracted
        let drafts = match extract::extract(bytes, metadata.doc_type)
            .and_then(|extracted| chunker::chunk(&extracted, &self.chunking))
        {
            Ok(drafts) => drafts,
            Err(e) => {
                self.abort_before_index(id, dedup_hash, is_update).await;
                return Err(e);
            }
        };
        self.mark(id, dedup_hash, IngestState::Extracted).await?;
        debug!(%id, chunks = drafts.len(), "document chunked");

        // Extracted → Embedded: every chunk's vector must exist before any
        // of them becomes visible in the index.
        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let vectors = match self.embedder.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                self.abort_before_index(id, dedup_hash, is_update).await;
                return Err(e);
            }
        };
        self.mark(id, dedup_hash, IngestState::Embedded).await?;

        // Embedded → Indexed: atomic all-or-nothing publish. Any vectors a
        // failed publish left behind are rolled back before reporting.
        if let Err(e) = self.index.publish_document(id, vectors).await {
            if !is_update {
                self.index.delete_document(id).await.ok();
            }
            self.abort_before_index(id, dedup_hash, is_update).await;
            return Err(e);
        }
        self.mark(id, dedup_hash, IngestState::Indexed).await?;

        // Indexed → Committed: the catalog row (with chunk rows and chunk
        // count) lands in one transaction; only now is the document visible.
        let date_added = match self.catalog.get(id).await? {
            Some(existing) => existing.date_added,
            None => Utc::now(),
        };
        let chunks: Vec<Chunk> = drafts
            .into_iter()
            .enumerate()
            .map(|(seq, d)| Chunk {
                id: ChunkId {
                    document_id: id,
                    seq: seq as u32,
                },
                text: d.text,
                anchor: d.anchor,
            })
            .collect();
        let doc = Document {
            id,
            title: metadata.title.clone(),
            author: metadata.author.clone(),
            publication_date: metadata.publication_date,
            doc_type: metadata.doc_type,
            date_added,
            storage_pointer,
            chunk_count: chunks.len() as u32,
            ingestion_status: IngestionStatus::Indexed,
            dedup_hash: dedup_hash.to_string(),
        };

        if let Err(e) = self.catalog.commit_document(&doc, &chunks).await {
            self.compensate_failed_commit(id, dedup_hash, is_update).await;
            return Err(e);
        }

        info!(%id, chunks = doc.chunk_count, update = is_update, "document committed");
        Ok(())
    }

    /// Compensation for failures after content was stored but before any
    /// vector was published: drop the orphan blob (fresh ingests only — an
    /// update's blob backs the still-committed old version) and mark the
    /// attempt failed.
    async fn abort_before_index(&self, id: Uuid, dedup_hash: &str, is_update: bool) {
        if !is_update {
            if let Err(e) = self.content.delete(id).await {
                warn!(%id, error = %e, "failed to remove orphan content blob");
            }
        }
        self.mark(id, dedup_hash, IngestState::Failed).await.ok();
    }

    /// Compensation for a failed final commit. Fresh ingest: unwind the
    /// index and blob. Update: the catalog still holds the old version but
    /// the index now holds the new vectors; rebuild the old vector set from
    /// the committed chunks so both stores agree again.
    async fn compensate_failed_commit(&self, id: Uuid, dedup_hash: &str, is_update: bool) {
        if !is_update {
            self.index.delete_document(id).await.ok();
            self.content.delete(id).await.ok();
            self.mark(id, dedup_hash, IngestState::Failed).await.ok();
            return;
        }

        let restored = async {
            let old_chunks = self.catalog.get_chunks(id).await?;
            let texts: Vec<String> = old_chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            self.index.publish_document(id, vectors).await
        }
        .await;
        if let Err(e) = restored {
            warn!(%id, error = %e, "could not restore prior vectors after failed update commit; repair sweep will reconcile");
        }
        self.mark(id, dedup_hash, IngestState::Failed).await.ok();
    }
}

fn validate(bytes: &[u8], metadata: &DeclaredMetadata) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::Validation("document content is empty".to_string()));
    }
    if metadata.title.trim().is_empty() {
        return Err(Error::Validation("title must not be empty".to_string()));
    }
    Ok(())
}

/// Content-identity hash over bytes and declared metadata.
fn dedup_hash(bytes: &[u8], metadata: &DeclaredMetadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update([0]);
    hasher.update(metadata.title.as_bytes());
    hasher.update([0]);
    hasher.update(metadata.author.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(
        metadata
            .publication_date
            .map(|d| d.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update([0]);
    hasher.update(metadata.doc_type.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::EmbeddingConfig;
    use crate::content::MemoryContentStore;
    use crate::embedding::{EmbeddingProvider, HashEmbeddings};
    use crate::index::{DistanceMetric, MemoryVectorIndex};
    use crate::models::DocumentType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metadata(title: &str) -> DeclaredMetadata {
        DeclaredMetadata {
            title: title.to_string(),
            author: Some("Smith".to_string()),
            publication_date: None,
            doc_type: DocumentType::Txt,
        }
    }

    struct Fixture {
        content: Arc<MemoryContentStore>,
        catalog: Arc<MemoryCatalog>,
        index: Arc<MemoryVectorIndex>,
        coordinator: IngestionCoordinator,
    }

    fn fixture_with_provider(provider: Arc<dyn EmbeddingProvider>) -> Fixture {
        let content = Arc::new(MemoryContentStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let index = Arc::new(MemoryVectorIndex::new(32, DistanceMetric::Cosine));
        let config = EmbeddingConfig {
            dims: 32,
            max_retries: 0,
            ..Default::default()
        };
        let embedder = Arc::new(EmbeddingGateway::new(provider, &config));
        let coordinator = IngestionCoordinator::new(
            content.clone(),
            catalog.clone(),
            index.clone(),
            embedder,
            ChunkingConfig {
                strategy: "recursive".to_string(),
                max_chars: 80,
                overlap_chars: 10,
            },
        );
        Fixture {
            content,
            catalog,
            index,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_provider(Arc::new(HashEmbeddings::new(32)))
    }

    const BODY: &[u8] = b"First paragraph about ingestion.\n\nSecond paragraph about indexing.\n\nThird paragraph about retrieval quality.";

    #[tokio::test]
    async fn successful_ingest_commits_all_three_stores() {
        let f = fixture();
        let id = f.coordinator.ingest(BODY, &metadata("Doc")).await.unwrap();

        let doc = f.catalog.get(id).await.unwrap().unwrap();
        assert_eq!(doc.ingestion_status, IngestionStatus::Indexed);
        assert!(doc.chunk_count > 0);
        assert_eq!(
            f.index.document_vector_count(id).await.unwrap(),
            doc.chunk_count as usize
        );
        assert!(f.content.exists(id).await.unwrap());
        // committed attempts leave no ledger entry
        assert!(f.coordinator.attempt_state(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identical_ingest_is_idempotent() {
        let f = fixture();
        let first = f.coordinator.ingest(BODY, &metadata("Doc")).await.unwrap();
        let second = f.coordinator.ingest(BODY, &metadata("Doc")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.catalog.all_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_rejects_before_any_store_write() {
        let f = fixture();
        let err = f.coordinator.ingest(b"", &metadata("Doc")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = f.coordinator.ingest(BODY, &metadata("  ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.catalog.all_ids().await.unwrap().is_empty());
        assert!(f.index.document_ids().await.unwrap().is_empty());
    }

    /// Provider that fails once the batch contains a poisoned text.
    struct FailOn {
        inner: HashEmbeddings,
        needle: String,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FailOn {
        fn model_name(&self) -> &str {
            "fail-on"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains(&self.needle)) {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(Error::EmbeddingQuotaExceeded("simulated".into()));
            }
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn embedding_failure_rolls_back_to_pre_ingestion_state() {
        let f = fixture_with_provider(Arc::new(FailOn {
            inner: HashEmbeddings::new(32),
            needle: "indexing".to_string(),
            failures: AtomicUsize::new(0),
        }));

        let err = f.coordinator.ingest(BODY, &metadata("Doc")).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingQuotaExceeded(_)));

        // no catalog row, no vectors, no orphan blob
        assert!(f.catalog.all_ids().await.unwrap().is_empty());
        assert!(f.index.document_ids().await.unwrap().is_empty());
        let ledger = f.catalog.list_ingestions().await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].state, IngestState::Failed);
        assert!(!f.content.exists(ledger[0].document_id).await.unwrap());
    }

    #[tokio::test]
    async fn retry_after_failure_commits_exactly_one_document() {
        let content = Arc::new(MemoryContentStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let index = Arc::new(MemoryVectorIndex::new(32, DistanceMetric::Cosine));
        let config = EmbeddingConfig {
            dims: 32,
            max_retries: 0,
            ..Default::default()
        };

        let failing = Arc::new(FailOn {
            inner: HashEmbeddings::new(32),
            needle: "indexing".to_string(),
            failures: AtomicUsize::new(0),
        });
        let coordinator = IngestionCoordinator::new(
            content.clone(),
            catalog.clone(),
            index.clone(),
            Arc::new(EmbeddingGateway::new(failing, &config)),
            ChunkingConfig {
                strategy: "recursive".to_string(),
                max_chars: 80,
                overlap_chars: 10,
            },
        );
        let failed_err = coordinator.ingest(BODY, &metadata("Doc")).await;
        assert!(failed_err.is_err());
        let failed_id = catalog.list_ingestions().await.unwrap()[0].document_id;

        // retry with a healthy provider over the same stores
        let coordinator = IngestionCoordinator::new(
            content,
            catalog.clone(),
            index,
            Arc::new(EmbeddingGateway::new(Arc::new(HashEmbeddings::new(32)), &config)),
            ChunkingConfig {
                strategy: "recursive".to_string(),
                max_chars: 80,
                overlap_chars: 10,
            },
        );
        let committed = coordinator.ingest(BODY, &metadata("Doc")).await.unwrap();

        assert_eq!(committed, failed_id, "retry should resume the failed attempt's ID");
        assert_eq!(catalog.all_ids().await.unwrap().len(), 1);
        assert!(catalog.list_ingestions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reingest_replaces_content_without_losing_the_document() {
        let f = fixture();
        let id = f.coordinator.ingest(BODY, &metadata("Doc")).await.unwrap();
        let before = f.catalog.get(id).await.unwrap().unwrap();

        let new_body = b"Replacement text about compaction.\n\nAnd a second paragraph on merging.";
        f.coordinator
            .reingest(id, new_body, &metadata("Doc v2"))
            .await
            .unwrap();

        let after = f.catalog.get(id).await.unwrap().unwrap();
        assert_eq!(after.title, "Doc v2");
        assert_eq!(after.date_added, before.date_added);
        assert_eq!(
            f.index.document_vector_count(id).await.unwrap(),
            after.chunk_count as usize
        );
        let chunks = f.catalog.get_chunks(id).await.unwrap();
        assert!(chunks[0].text.contains("Replacement"));
    }

    #[tokio::test]
    async fn reingest_unknown_id_is_not_found() {
        let f = fixture();
        let err = f
            .coordinator
            .reingest(Uuid::new_v4(), BODY, &metadata("Doc"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_all_traces() {
        let f = fixture();
        let id = f.coordinator.ingest(BODY, &metadata("Doc")).await.unwrap();

        f.coordinator.delete(id).await.unwrap();
        assert!(f.catalog.get(id).await.unwrap().is_none());
        assert_eq!(f.index.document_vector_count(id).await.unwrap(), 0);
        assert!(!f.content.exists(id).await.unwrap());

        let err = f.coordinator.delete(id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn distinct_documents_ingest_concurrently() {
        let f = Arc::new(fixture());
        let mut handles = Vec::new();
        for i in 0..8 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                let body = format!(
                    "Document number {i} first paragraph.\n\nSecond paragraph with shared words {i}."
                );
                f.coordinator
                    .ingest(body.as_bytes(), &metadata(&format!("Doc {i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(f.catalog.all_ids().await.unwrap().len(), 8);
    }
}
