//! Vector index: chunk-id → embedding, with k-nearest-neighbor search.
//!
//! Exact scan is the implementation choice at personal-corpus scale
//! (thousands to low millions of chunks); the [`VectorIndex`] trait is the
//! seam where an approximate index could be swapped in, so callers must
//! treat results as approximate top-k.
//!
//! Visibility rules both backends uphold:
//! - [`publish_document`](VectorIndex::publish_document) makes a document's
//!   vectors visible atomically (one write-lock hold / one SQL transaction),
//!   replacing any prior vectors for that document. A concurrent reader sees
//!   the old set or the new set, never a mix.
//! - [`delete_document`](VectorIndex::delete_document) physically removes
//!   rows; no tombstones accumulate under add/remove cycles.
//! - `search` never returns vectors of a half-published document because
//!   there is no such state to observe.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::ChunkId;

/// Similarity metric applied by `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    InnerProduct,
}

impl DistanceMetric {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" => Ok(DistanceMetric::InnerProduct),
            other => Err(Error::Validation(format!("unknown distance metric: {other}"))),
        }
    }

    /// Score two equal-length vectors; higher is closer.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::InnerProduct => dot(a, b),
            DistanceMetric::Cosine => {
                let denom = norm(a) * norm(b);
                if denom <= f32::EPSILON {
                    0.0
                } else {
                    dot(a, b) / denom
                }
            }
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Abstract similarity index over chunk vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Configured vector dimensionality.
    fn dims(&self) -> usize;

    /// Insert a single vector. Idempotent: re-inserting the same chunk id
    /// with an equal vector is a no-op; a conflicting vector for an existing
    /// id is a consistency error (chunks are immutable — replacement goes
    /// through `publish_document`).
    async fn insert(&self, chunk_id: ChunkId, vector: Vec<f32>) -> Result<()>;

    /// Atomically replace all vectors for a document with `vectors`, where
    /// position i holds chunk sequence i. All-or-nothing visibility.
    async fn publish_document(&self, document_id: Uuid, vectors: Vec<Vec<f32>>) -> Result<()>;

    /// Remove all vectors belonging to a document. Returns the number
    /// removed; no-op (0) if none exist.
    async fn delete_document(&self, document_id: Uuid) -> Result<usize>;

    /// Up to `k` nearest neighbors of `query`, ordered by score descending
    /// (ties broken by document id, then sequence, for determinism). When
    /// `candidates` is present the scan is restricted to those documents.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        candidates: Option<&HashSet<Uuid>>,
    ) -> Result<Vec<(ChunkId, f32)>>;

    /// Number of vectors stored for a document (repair sweeps compare this
    /// against the catalog's chunk count).
    async fn document_vector_count(&self, document_id: Uuid) -> Result<usize>;

    /// All document ids with at least one vector.
    async fn document_ids(&self) -> Result<Vec<Uuid>>;
}

fn check_dims(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

fn rank_hits(mut hits: Vec<(ChunkId, f32)>, k: usize) -> Vec<(ChunkId, f32)> {
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    hits.truncate(k);
    hits
}

// ============ In-memory backend ============

/// Brute-force in-memory index behind a `RwLock`.
///
/// Readers proceed concurrently; a writer's publish or delete becomes
/// visible in one step when the write lock is released.
pub struct MemoryVectorIndex {
    dims: usize,
    metric: DistanceMetric,
    vectors: RwLock<HashMap<Uuid, BTreeMap<u32, Vec<f32>>>>,
}

impl MemoryVectorIndex {
    pub fn new(dims: usize, metric: DistanceMetric) -> Self {
        Self {
            dims,
            metric,
            vectors: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn insert(&self, chunk_id: ChunkId, vector: Vec<f32>) -> Result<()> {
        check_dims(self.dims, &vector)?;
        let mut store = self.vectors.write().unwrap();
        let doc = store.entry(chunk_id.document_id).or_default();
        if let Some(existing) = doc.get(&chunk_id.seq) {
            if *existing == vector {
                return Ok(());
            }
            return Err(Error::Consistency(format!(
                "conflicting vector for existing chunk {chunk_id}"
            )));
        }
        doc.insert(chunk_id.seq, vector);
        Ok(())
    }

    async fn publish_document(&self, document_id: Uuid, vectors: Vec<Vec<f32>>) -> Result<()> {
        for vector in &vectors {
            check_dims(self.dims, vector)?;
        }
        let entries: BTreeMap<u32, Vec<f32>> = vectors
            .into_iter()
            .enumerate()
            .map(|(seq, v)| (seq as u32, v))
            .collect();
        self.vectors.write().unwrap().insert(document_id, entries);
        Ok(())
    }

    async fn delete_document(&self, document_id: Uuid) -> Result<usize> {
        Ok(self
            .vectors
            .write()
            .unwrap()
            .remove(&document_id)
            .map_or(0, |doc| doc.len()))
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        candidates: Option<&HashSet<Uuid>>,
    ) -> Result<Vec<(ChunkId, f32)>> {
        check_dims(self.dims, query)?;
        let store = self.vectors.read().unwrap();
        let mut hits = Vec::new();
        for (&document_id, doc) in store.iter() {
            if let Some(allowed) = candidates {
                if !allowed.contains(&document_id) {
                    continue;
                }
            }
            for (&seq, vector) in doc.iter() {
                hits.push((
                    ChunkId { document_id, seq },
                    self.metric.score(query, vector),
                ));
            }
        }
        Ok(rank_hits(hits, k))
    }

    async fn document_vector_count(&self, document_id: Uuid) -> Result<usize> {
        Ok(self
            .vectors
            .read()
            .unwrap()
            .get(&document_id)
            .map_or(0, |doc| doc.len()))
    }

    async fn document_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.vectors.read().unwrap().keys().copied().collect())
    }
}

// ============ SQLite backend ============

/// Vector index persisted as little-endian `f32` BLOBs in SQLite.
///
/// Shares the catalog's database file; each document's vectors are replaced
/// in one transaction so readers see whole versions only.
pub struct SqliteVectorIndex {
    dims: usize,
    metric: DistanceMetric,
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub async fn open(pool: SqlitePool, dims: usize, metric: DistanceMetric) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                document_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                dims INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                PRIMARY KEY (document_id, seq)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { dims, metric, pool })
    }
}

/// Encode a vector as little-endian `f32` bytes.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a vector, validating its length.
pub fn blob_to_vector(blob: &[u8], dims: usize) -> Result<Vec<f32>> {
    if blob.len() != dims * 4 {
        return Err(Error::Consistency(format!(
            "embedding blob has {} bytes, expected {}",
            blob.len(),
            dims * 4
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn insert(&self, chunk_id: ChunkId, vector: Vec<f32>) -> Result<()> {
        check_dims(self.dims, &vector)?;
        let blob = vector_to_blob(&vector);

        let existing: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM vectors WHERE document_id = ? AND seq = ?")
                .bind(chunk_id.document_id.to_string())
                .bind(chunk_id.seq as i64)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(existing) = existing {
            if existing == blob {
                return Ok(());
            }
            return Err(Error::Consistency(format!(
                "conflicting vector for existing chunk {chunk_id}"
            )));
        }

        sqlx::query("INSERT INTO vectors (document_id, seq, dims, embedding) VALUES (?, ?, ?, ?)")
            .bind(chunk_id.document_id.to_string())
            .bind(chunk_id.seq as i64)
            .bind(self.dims as i64)
            .bind(blob)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn publish_document(&self, document_id: Uuid, vectors: Vec<Vec<f32>>) -> Result<()> {
        for vector in &vectors {
            check_dims(self.dims, vector)?;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE document_id = ?")
            .bind(document_id.to_string())
            .execute(&mut *tx)
            .await?;
        for (seq, vector) in vectors.iter().enumerate() {
            sqlx::query(
                "INSERT INTO vectors (document_id, seq, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(document_id.to_string())
            .bind(seq as i64)
            .bind(self.dims as i64)
            .bind(vector_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: Uuid) -> Result<usize> {
        let result = sqlx::query("DELETE FROM vectors WHERE document_id = ?")
            .bind(document_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        candidates: Option<&HashSet<Uuid>>,
    ) -> Result<Vec<(ChunkId, f32)>> {
        check_dims(self.dims, query)?;

        let rows = sqlx::query("SELECT document_id, seq, embedding FROM vectors WHERE dims = ?")
            .bind(self.dims as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::new();
        for row in &rows {
            let document_id: String = row.get("document_id");
            let document_id = Uuid::parse_str(&document_id)
                .map_err(|e| Error::Storage(format!("malformed uuid in index: {e}")))?;
            if let Some(allowed) = candidates {
                if !allowed.contains(&document_id) {
                    continue;
                }
            }
            let seq: i64 = row.get("seq");
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vector(&blob, self.dims)?;
            hits.push((
                ChunkId {
                    document_id,
                    seq: seq as u32,
                },
                self.metric.score(query, &vector),
            ));
        }
        Ok(rank_hits(hits, k))
    }

    async fn document_vector_count(&self, document_id: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE document_id = ?")
            .bind(document_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn document_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT DISTINCT document_id FROM vectors")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("document_id");
                Uuid::parse_str(&id).map_err(|e| Error::Storage(format!("malformed uuid: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn unit(dims: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[hot] = 1.0;
        v
    }

    #[tokio::test]
    async fn insert_is_idempotent_for_equal_vectors() {
        let index = MemoryVectorIndex::new(4, DistanceMetric::Cosine);
        let id = ChunkId {
            document_id: Uuid::new_v4(),
            seq: 0,
        };
        index.insert(id, unit(4, 1)).await.unwrap();
        index.insert(id, unit(4, 1)).await.unwrap();
        assert_eq!(index.document_vector_count(id.document_id).await.unwrap(), 1);

        let err = index.insert(id, unit(4, 2)).await.unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let index = MemoryVectorIndex::new(4, DistanceMetric::Cosine);
        let id = ChunkId {
            document_id: Uuid::new_v4(),
            seq: 0,
        };
        let err = index.insert(id, vec![1.0; 3]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        let err = index.search(&[1.0; 5], 3, None).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_with_deterministic_ties() {
        let index = MemoryVectorIndex::new(4, DistanceMetric::Cosine);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        index
            .publish_document(doc_a, vec![unit(4, 0), unit(4, 1)])
            .await
            .unwrap();
        index.publish_document(doc_b, vec![unit(4, 0)]).await.unwrap();

        let hits = index.search(&unit(4, 0), 10, None).await.unwrap();
        assert_eq!(hits.len(), 3);
        // the two exact matches tie at 1.0 and order by (doc id, seq)
        assert!(hits[0].1 > 0.99 && hits[1].1 > 0.99);
        assert!(hits[0].0 < hits[1].0);
        assert!(hits[2].1 < 0.01);
    }

    #[tokio::test]
    async fn candidate_filter_restricts_scan() {
        let index = MemoryVectorIndex::new(4, DistanceMetric::Cosine);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        index.publish_document(doc_a, vec![unit(4, 0)]).await.unwrap();
        index.publish_document(doc_b, vec![unit(4, 0)]).await.unwrap();

        let only_b: HashSet<Uuid> = [doc_b].into_iter().collect();
        let hits = index.search(&unit(4, 0), 10, Some(&only_b)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.document_id, doc_b);
    }

    #[tokio::test]
    async fn publish_replaces_prior_version_atomically() {
        let index = MemoryVectorIndex::new(4, DistanceMetric::Cosine);
        let doc = Uuid::new_v4();
        index
            .publish_document(doc, vec![unit(4, 0), unit(4, 1), unit(4, 2)])
            .await
            .unwrap();
        index.publish_document(doc, vec![unit(4, 3)]).await.unwrap();

        assert_eq!(index.document_vector_count(doc).await.unwrap(), 1);
        let hits = index.search(&unit(4, 0), 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 < 0.01);
    }

    #[tokio::test]
    async fn delete_is_a_real_removal() {
        let index = MemoryVectorIndex::new(4, DistanceMetric::Cosine);
        let doc = Uuid::new_v4();
        index
            .publish_document(doc, vec![unit(4, 0), unit(4, 1)])
            .await
            .unwrap();

        assert_eq!(index.delete_document(doc).await.unwrap(), 2);
        assert_eq!(index.delete_document(doc).await.unwrap(), 0);
        assert!(index.search(&unit(4, 0), 10, None).await.unwrap().is_empty());
        assert!(index.document_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inner_product_metric_scores_unnormalized_vectors() {
        let index = MemoryVectorIndex::new(2, DistanceMetric::InnerProduct);
        let doc = Uuid::new_v4();
        index
            .publish_document(doc, vec![vec![2.0, 0.0], vec![0.5, 0.0]])
            .await
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits[0].0.seq, 0);
        assert!((hits[0].1 - 2.0).abs() < 1e-6);
    }

    #[test]
    fn blob_round_trip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        let blob = vector_to_blob(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vector(&blob, 4).unwrap(), v);
        assert!(matches!(
            blob_to_vector(&blob, 3),
            Err(Error::Consistency(_))
        ));
    }

    #[tokio::test]
    async fn sqlite_index_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("index.db")).await.unwrap();
        let index = SqliteVectorIndex::open(pool, 4, DistanceMetric::Cosine)
            .await
            .unwrap();

        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        index
            .publish_document(doc_a, vec![unit(4, 0), unit(4, 1)])
            .await
            .unwrap();
        index.publish_document(doc_b, vec![unit(4, 2)]).await.unwrap();

        let hits = index.search(&unit(4, 1), 2, None).await.unwrap();
        assert_eq!(hits[0].0, ChunkId { document_id: doc_a, seq: 1 });

        let only_b: HashSet<Uuid> = [doc_b].into_iter().collect();
        let hits = index.search(&unit(4, 2), 5, Some(&only_b)).await.unwrap();
        assert_eq!(hits.len(), 1);

        assert_eq!(index.delete_document(doc_a).await.unwrap(), 2);
        assert_eq!(index.document_vector_count(doc_a).await.unwrap(), 0);
        assert_eq!(index.document_ids().await.unwrap(), vec![doc_b]);
    }

    #[tokio::test]
    async fn sqlite_insert_idempotence() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("index.db")).await.unwrap();
        let index = SqliteVectorIndex::open(pool, 4, DistanceMetric::Cosine)
            .await
            .unwrap();
        let id = ChunkId {
            document_id: Uuid::new_v4(),
            seq: 7,
        };
        index.insert(id, unit(4, 3)).await.unwrap();
        index.insert(id, unit(4, 3)).await.unwrap();
        assert_eq!(index.document_vector_count(id.document_id).await.unwrap(), 1);
        assert!(matches!(
            index.insert(id, unit(4, 0)).await,
            Err(Error::Consistency(_))
        ));
    }
}
