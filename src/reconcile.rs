//! Reconciliation sweep: detect and repair cross-store drift.
//!
//! A crash mid-ingestion leaves orphans but never a half-visible document
//! (the catalog row is written last). Everything the sweep must clean is
//! reachable from durable state:
//!
//! - the ingestion ledger marks attempts that stored a blob or vectors and
//!   never committed (the ledger row is written before the blob, so every
//!   orphan blob has one);
//! - the vector index can be diffed against committed catalog rows to find
//!   orphan vectors;
//! - a committed document's `chunk_count` pins how many vectors the index
//!   must hold for it, so drift is detectable from the row alone.
//!
//! Violations are logged as consistency findings and repaired, never
//! silently ignored.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::MetadataCatalog;
use crate::content::ContentStore;
use crate::embedding::EmbeddingGateway;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::models::{IngestState, IngestionStatus};

/// What a sweep found and fixed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    /// Documents whose vectors had no committed catalog row; vectors removed.
    pub orphan_vector_documents: usize,
    /// Ledger rows for dead attempts, removed along with their blobs.
    pub stale_attempts_removed: usize,
    /// Orphan content blobs deleted.
    pub orphan_blobs_removed: usize,
    /// Committed documents whose vector count diverged from `chunk_count`;
    /// re-embedded from chunk rows and republished.
    pub vector_counts_repaired: usize,
    /// Committed documents whose content blob is missing. Not repairable
    /// without the original bytes; surfaced for the user.
    pub missing_blobs: Vec<Uuid>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_vector_documents == 0
            && self.stale_attempts_removed == 0
            && self.orphan_blobs_removed == 0
            && self.vector_counts_repaired == 0
            && self.missing_blobs.is_empty()
    }
}

/// Run one repair pass.
///
/// `stale_after` guards against collecting an attempt that is still making
/// progress: only ledger rows untouched for at least that long are treated
/// as dead.
pub async fn repair(
    content: &dyn ContentStore,
    catalog: &dyn MetadataCatalog,
    index: &dyn VectorIndex,
    embedder: &EmbeddingGateway,
    stale_after: Duration,
) -> Result<RepairReport> {
    let mut report = RepairReport::default();

    // Committed = catalog rows with indexed status; everything else in the
    // index or ledger is suspect.
    let mut committed: HashSet<Uuid> = HashSet::new();
    for id in catalog.all_ids().await? {
        if let Some(doc) = catalog.get(id).await? {
            if doc.ingestion_status == IngestionStatus::Indexed {
                committed.insert(id);
            }
        }
    }

    // Orphan vectors: indexed under a document id with no committed row.
    for id in index.document_ids().await? {
        if !committed.contains(&id) {
            let removed = index.delete_document(id).await?;
            warn!(%id, vectors = removed, "consistency violation: orphan vectors removed");
            report.orphan_vector_documents += 1;
        }
    }

    // Dead attempts: ledger rows that never reached a commit and are old
    // enough that no coordinator is still driving them.
    let cutoff = Utc::now() - stale_after;
    for record in catalog.list_ingestions().await? {
        if record.updated_at > cutoff && record.state != IngestState::Failed {
            continue;
        }
        if committed.contains(&record.document_id) {
            // A newer attempt committed this document; the marker is stale.
            catalog.remove_ingestion(record.document_id).await?;
            report.stale_attempts_removed += 1;
            continue;
        }
        if content.exists(record.document_id).await? {
            content.delete(record.document_id).await?;
            report.orphan_blobs_removed += 1;
        }
        index.delete_document(record.document_id).await?;
        catalog.remove_ingestion(record.document_id).await?;
        warn!(
            id = %record.document_id,
            state = record.state.as_str(),
            "consistency violation: dead ingestion attempt collected"
        );
        report.stale_attempts_removed += 1;
    }

    // Count drift: a committed row promises exactly chunk_count vectors.
    for &id in &committed {
        let Some(doc) = catalog.get(id).await? else {
            continue;
        };
        if !content.exists(id).await? {
            warn!(%id, "consistency violation: committed document has no content blob");
            report.missing_blobs.push(id);
        }
        let have = index.document_vector_count(id).await?;
        if have != doc.chunk_count as usize {
            warn!(
                %id,
                expected = doc.chunk_count,
                actual = have,
                "consistency violation: vector count drift; republishing from chunk rows"
            );
            let chunks = catalog.get_chunks(id).await?;
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            index.publish_document(id, vectors).await?;
            report.vector_counts_repaired += 1;
        }
    }

    if report.is_clean() {
        info!("repair sweep: no inconsistencies found");
    } else {
        info!(?report, "repair sweep completed with repairs");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::EmbeddingConfig;
    use crate::content::MemoryContentStore;
    use crate::embedding::HashEmbeddings;
    use crate::index::{DistanceMetric, MemoryVectorIndex};
    use crate::models::{
        Anchor, Chunk, ChunkId, Document, DocumentType, IngestionRecord,
    };
    use std::sync::Arc;

    struct Fixture {
        content: MemoryContentStore,
        catalog: MemoryCatalog,
        index: MemoryVectorIndex,
        embedder: EmbeddingGateway,
    }

    fn fixture() -> Fixture {
        let config = EmbeddingConfig {
            dims: 16,
            ..Default::default()
        };
        Fixture {
            content: MemoryContentStore::new(),
            catalog: MemoryCatalog::new(),
            index: MemoryVectorIndex::new(16, DistanceMetric::Cosine),
            embedder: EmbeddingGateway::new(Arc::new(HashEmbeddings::new(16)), &config),
        }
    }

    async fn run(f: &Fixture, stale_after: Duration) -> RepairReport {
        repair(&f.content, &f.catalog, &f.index, &f.embedder, stale_after)
            .await
            .unwrap()
    }

    async fn committed_doc(f: &Fixture, texts: &[&str]) -> Uuid {
        let id = Uuid::new_v4();
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(seq, t)| Chunk {
                id: ChunkId {
                    document_id: id,
                    seq: seq as u32,
                },
                text: t.to_string(),
                anchor: Anchor {
                    start: 0,
                    end: t.len(),
                    page: None,
                },
            })
            .collect();
        let vectors = f
            .embedder
            .embed(&texts.iter().map(|t| t.to_string()).collect::<Vec<_>>())
            .await
            .unwrap();
        f.index.publish_document(id, vectors).await.unwrap();
        f.content.put(id, DocumentType::Txt, b"bytes").await.unwrap();
        let doc = Document {
            id,
            title: "Doc".into(),
            author: None,
            publication_date: None,
            doc_type: DocumentType::Txt,
            date_added: Utc::now(),
            storage_pointer: "mem://x".into(),
            chunk_count: chunks.len() as u32,
            ingestion_status: IngestionStatus::Indexed,
            dedup_hash: id.to_string(),
        };
        f.catalog.commit_document(&doc, &chunks).await.unwrap();
        id
    }

    #[tokio::test]
    async fn clean_corpus_reports_clean() {
        let f = fixture();
        committed_doc(&f, &["alpha", "beta"]).await;
        let report = run(&f, Duration::zero()).await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn orphan_vectors_are_removed() {
        let f = fixture();
        let ghost = Uuid::new_v4();
        let vectors = f.embedder.embed(&["ghost".to_string()]).await.unwrap();
        f.index.publish_document(ghost, vectors).await.unwrap();

        let report = run(&f, Duration::zero()).await;
        assert_eq!(report.orphan_vector_documents, 1);
        assert_eq!(f.index.document_vector_count(ghost).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_attempt_blob_is_collected() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.content.put(id, DocumentType::Txt, b"orphan").await.unwrap();
        f.catalog
            .upsert_ingestion(&IngestionRecord {
                document_id: id,
                dedup_hash: "h".into(),
                state: IngestState::ContentStored,
                started_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = run(&f, Duration::zero()).await;
        assert_eq!(report.stale_attempts_removed, 1);
        assert_eq!(report.orphan_blobs_removed, 1);
        assert!(!f.content.exists(id).await.unwrap());
        assert!(f.catalog.get_ingestion(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_in_flight_attempt_is_left_alone() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.content.put(id, DocumentType::Txt, b"working").await.unwrap();
        f.catalog
            .upsert_ingestion(&IngestionRecord {
                document_id: id,
                dedup_hash: "h".into(),
                state: IngestState::Embedded,
                started_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = run(&f, Duration::hours(1)).await;
        assert_eq!(report.stale_attempts_removed, 0);
        assert!(f.content.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn failed_attempts_are_collected_regardless_of_age() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.catalog
            .upsert_ingestion(&IngestionRecord {
                document_id: id,
                dedup_hash: "h".into(),
                state: IngestState::Failed,
                started_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = run(&f, Duration::hours(1)).await;
        assert_eq!(report.stale_attempts_removed, 1);
    }

    #[tokio::test]
    async fn vector_count_drift_is_repaired_from_chunk_rows() {
        let f = fixture();
        let id = committed_doc(&f, &["alpha", "beta", "gamma"]).await;
        // simulate a lost vector set
        f.index.delete_document(id).await.unwrap();

        let report = run(&f, Duration::zero()).await;
        assert_eq!(report.vector_counts_repaired, 1);
        assert_eq!(f.index.document_vector_count(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_blob_is_surfaced_not_silently_ignored() {
        let f = fixture();
        let id = committed_doc(&f, &["alpha"]).await;
        f.content.delete(id).await.unwrap();

        let report = run(&f, Duration::zero()).await;
        assert_eq!(report.missing_blobs, vec![id]);
    }
}
