//! Relational metadata catalog.
//!
//! The catalog is the single source of truth for "this document is
//! queryable": a document row with `ingestion_status = indexed` is written
//! (together with its chunk rows) in one transaction, as the final step of
//! ingestion. It also owns the ingestion ledger — durable progress markers
//! for in-flight attempts that the reconciliation sweep garbage-collects
//! after a crash.
//!
//! Two backends implement the [`MetadataCatalog`] trait: [`SqliteCatalog`]
//! (sqlx, WAL journal) and [`MemoryCatalog`] for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    Anchor, Chunk, ChunkId, Document, DocumentFilter, DocumentType, IngestState, IngestionRecord,
    IngestionStatus, PublicationDate,
};

/// Mutable-field patch for [`MetadataCatalog::update_metadata`].
///
/// `Some` sets the field; `None` leaves it untouched. Content-derived fields
/// (chunk count, storage pointer, status) are not patchable — they only
/// change through re-ingestion.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publication_date: Option<PublicationDate>,
}

/// Abstract relational store for document metadata, chunk records, and the
/// ingestion ledger.
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    /// Atomically commit a document row and its chunk rows, replacing any
    /// prior version, and clear the document's ingestion ledger entry.
    ///
    /// This is the single visibility point: before this call returns the
    /// document (old version or nothing) is what queries see; after, the
    /// new version.
    async fn commit_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()>;

    /// Fetch a document row by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Document>>;

    /// Find a committed document with the given dedup hash.
    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<Document>>;

    /// List indexed documents matching a filter, ordered by `date_added`
    /// descending then ID, with pagination.
    async fn list(&self, filter: &DocumentFilter, limit: u32, offset: u32) -> Result<Vec<Document>>;

    /// Patch mutable metadata fields. Returns the updated row.
    async fn update_metadata(&self, id: Uuid, patch: &MetadataPatch) -> Result<Document>;

    /// Delete a document row and its chunks. Returns false if absent.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Fetch a single chunk record.
    async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>>;

    /// Fetch all chunk records for a document, ordered by sequence.
    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>>;

    /// All document IDs present in the catalog (any status).
    async fn all_ids(&self) -> Result<Vec<Uuid>>;

    /// Insert or update an ingestion ledger entry.
    async fn upsert_ingestion(&self, record: &IngestionRecord) -> Result<()>;

    /// Fetch the ledger entry for a document, if any.
    async fn get_ingestion(&self, document_id: Uuid) -> Result<Option<IngestionRecord>>;

    /// Remove the ledger entry for a document.
    async fn remove_ingestion(&self, document_id: Uuid) -> Result<()>;

    /// All ledger entries (the repair sweep walks these).
    async fn list_ingestions(&self) -> Result<Vec<IngestionRecord>>;
}

// ============ SQLite backend ============

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// Wrap a pool and ensure the schema exists.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let catalog = Self { pool };
        catalog.migrate().await?;
        Ok(catalog)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT,
                publication_date TEXT,
                doc_type TEXT NOT NULL,
                date_added INTEGER NOT NULL,
                storage_pointer TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                ingestion_status TEXT NOT NULL,
                dedup_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                document_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                page INTEGER,
                PRIMARY KEY (document_id, seq),
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingestions (
                document_id TEXT PRIMARY KEY,
                dedup_hash TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_author ON documents(author)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_doc_type ON documents(doc_type)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_date_added ON documents(date_added DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_dedup_hash ON documents(dedup_hash)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Storage(format!("malformed uuid '{s}': {e}")))
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let doc_type: String = row.get("doc_type");
    let status: String = row.get("ingestion_status");
    let publication_date: Option<String> = row.get("publication_date");
    let publication_date = publication_date
        .as_deref()
        .map(PublicationDate::parse)
        .transpose()?;
    let date_added: i64 = row.get("date_added");
    let chunk_count: i64 = row.get("chunk_count");

    Ok(Document {
        id: parse_uuid(&id)?,
        title: row.get("title"),
        author: row.get("author"),
        publication_date,
        doc_type: DocumentType::parse(&doc_type)?,
        date_added: ts_to_datetime(date_added),
        storage_pointer: row.get("storage_pointer"),
        chunk_count: chunk_count as u32,
        ingestion_status: IngestionStatus::parse(&status)?,
        dedup_hash: row.get("dedup_hash"),
    })
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let document_id: String = row.get("document_id");
    let seq: i64 = row.get("seq");
    let start: i64 = row.get("start_offset");
    let end: i64 = row.get("end_offset");
    let page: Option<i64> = row.get("page");
    Ok(Chunk {
        id: ChunkId {
            document_id: parse_uuid(&document_id)?,
            seq: seq as u32,
        },
        text: row.get("text"),
        anchor: Anchor {
            start: start as usize,
            end: end as usize,
            page: page.map(|p| p as u32),
        },
    })
}

#[async_trait]
impl MetadataCatalog for SqliteCatalog {
    async fn commit_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, title, author, publication_date, doc_type, date_added,
                                   storage_pointer, chunk_count, ingestion_status, dedup_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                publication_date = excluded.publication_date,
                doc_type = excluded.doc_type,
                storage_pointer = excluded.storage_pointer,
                chunk_count = excluded.chunk_count,
                ingestion_status = excluded.ingestion_status,
                dedup_hash = excluded.dedup_hash
            "#,
        )
        .bind(doc.id.to_string())
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(doc.publication_date.map(|d| d.to_string()))
        .bind(doc.doc_type.as_str())
        .bind(doc.date_added.timestamp())
        .bind(&doc.storage_pointer)
        .bind(doc.chunk_count as i64)
        .bind(doc.ingestion_status.as_str())
        .bind(&doc.dedup_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc.id.to_string())
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (document_id, seq, text, start_offset, end_offset, page)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id.document_id.to_string())
            .bind(chunk.id.seq as i64)
            .bind(&chunk.text)
            .bind(chunk.anchor.start as i64)
            .bind(chunk.anchor.end as i64)
            .bind(chunk.anchor.page.map(|p| p as i64))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM ingestions WHERE document_id = ?")
            .bind(doc.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE dedup_hash = ? LIMIT 1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list(&self, filter: &DocumentFilter, limit: u32, offset: u32) -> Result<Vec<Document>> {
        // Author and type compile to SQL; publication-date ranges are
        // evaluated in Rust because the column mixes YYYY and YYYY-MM-DD.
        let mut sql =
            String::from("SELECT * FROM documents WHERE ingestion_status = 'indexed'");
        if filter.author.is_some() {
            sql.push_str(" AND author = ?");
        }
        if filter.doc_type.is_some() {
            sql.push_str(" AND doc_type = ?");
        }
        sql.push_str(" ORDER BY date_added DESC, id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(ref author) = filter.author {
            query = query.bind(author);
        }
        if let Some(doc_type) = filter.doc_type {
            query = query.bind(doc_type.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = row_to_document(row)?;
            if filter.matches(&doc) {
                docs.push(doc);
            }
        }

        let start = (offset as usize).min(docs.len());
        let end = (start + limit as usize).min(docs.len());
        Ok(docs[start..end].to_vec())
    }

    async fn update_metadata(&self, id: Uuid, patch: &MetadataPatch) -> Result<Document> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let mut doc = match row.as_ref().map(row_to_document).transpose()? {
            Some(doc) => doc,
            None => return Err(Error::NotFound(format!("document {id}"))),
        };

        if let Some(ref title) = patch.title {
            doc.title = title.clone();
        }
        if let Some(ref author) = patch.author {
            doc.author = Some(author.clone());
        }
        if let Some(date) = patch.publication_date {
            doc.publication_date = Some(date);
        }

        sqlx::query(
            "UPDATE documents SET title = ?, author = ?, publication_date = ? WHERE id = ?",
        )
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(doc.publication_date.map(|d| d.to_string()))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(doc)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE document_id = ? AND seq = ?")
            .bind(chunk_id.document_id.to_string())
            .bind(chunk_id.seq as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY seq ASC")
            .bind(document_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn all_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM documents")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                parse_uuid(&id)
            })
            .collect()
    }

    async fn upsert_ingestion(&self, record: &IngestionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestions (document_id, dedup_hash, state, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                dedup_hash = excluded.dedup_hash,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.document_id.to_string())
        .bind(&record.dedup_hash)
        .bind(record.state.as_str())
        .bind(record.started_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ingestion(&self, document_id: Uuid) -> Result<Option<IngestionRecord>> {
        let row = sqlx::query("SELECT * FROM ingestions WHERE document_id = ?")
            .bind(document_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let id: String = row.get("document_id");
            let state: String = row.get("state");
            let started_at: i64 = row.get("started_at");
            let updated_at: i64 = row.get("updated_at");
            Ok(IngestionRecord {
                document_id: parse_uuid(&id)?,
                dedup_hash: row.get("dedup_hash"),
                state: IngestState::parse(&state)?,
                started_at: ts_to_datetime(started_at),
                updated_at: ts_to_datetime(updated_at),
            })
        })
        .transpose()
    }

    async fn remove_ingestion(&self, document_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM ingestions WHERE document_id = ?")
            .bind(document_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_ingestions(&self) -> Result<Vec<IngestionRecord>> {
        let rows = sqlx::query("SELECT * FROM ingestions ORDER BY started_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.get("document_id");
                let state: String = row.get("state");
                let started_at: i64 = row.get("started_at");
                let updated_at: i64 = row.get("updated_at");
                Ok(IngestionRecord {
                    document_id: parse_uuid(&id)?,
                    dedup_hash: row.get("dedup_hash"),
                    state: IngestState::parse(&state)?,
                    started_at: ts_to_datetime(started_at),
                    updated_at: ts_to_datetime(updated_at),
                })
            })
            .collect()
    }
}

// ============ In-memory backend ============

/// In-memory catalog for tests and throwaway corpora.
#[derive(Default)]
pub struct MemoryCatalog {
    docs: RwLock<HashMap<Uuid, Document>>,
    chunks: RwLock<HashMap<Uuid, Vec<Chunk>>>,
    ledger: RwLock<HashMap<Uuid, IngestionRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataCatalog for MemoryCatalog {
    async fn commit_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        // Lock ordering: docs → chunks → ledger, held together so a
        // concurrent reader sees the old version or the new one, not a mix.
        let mut docs = self.docs.write().unwrap();
        let mut chunk_map = self.chunks.write().unwrap();
        let mut ledger = self.ledger.write().unwrap();
        docs.insert(doc.id, doc.clone());
        chunk_map.insert(doc.id, chunks.to_vec());
        ledger.remove(&doc.id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.docs.read().unwrap().get(&id).cloned())
    }

    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<Document>> {
        Ok(self
            .docs
            .read()
            .unwrap()
            .values()
            .find(|d| d.dedup_hash == hash)
            .cloned())
    }

    async fn list(&self, filter: &DocumentFilter, limit: u32, offset: u32) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap();
        let mut matching: Vec<Document> = docs
            .values()
            .filter(|d| d.ingestion_status == IngestionStatus::Indexed && filter.matches(d))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.date_added
                .cmp(&a.date_added)
                .then_with(|| a.id.cmp(&b.id))
        });
        let start = (offset as usize).min(matching.len());
        let end = (start + limit as usize).min(matching.len());
        Ok(matching[start..end].to_vec())
    }

    async fn update_metadata(&self, id: Uuid, patch: &MetadataPatch) -> Result<Document> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("document {id}")))?;
        if let Some(ref title) = patch.title {
            doc.title = title.clone();
        }
        if let Some(ref author) = patch.author {
            doc.author = Some(author.clone());
        }
        if let Some(date) = patch.publication_date {
            doc.publication_date = Some(date);
        }
        Ok(doc.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut docs = self.docs.write().unwrap();
        let mut chunks = self.chunks.write().unwrap();
        chunks.remove(&id);
        Ok(docs.remove(&id).is_some())
    }

    async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>> {
        Ok(self
            .chunks
            .read()
            .unwrap()
            .get(&chunk_id.document_id)
            .and_then(|chunks| chunks.iter().find(|c| c.id.seq == chunk_id.seq).cloned()))
    }

    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        Ok(self
            .chunks
            .read()
            .unwrap()
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn all_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.docs.read().unwrap().keys().copied().collect())
    }

    async fn upsert_ingestion(&self, record: &IngestionRecord) -> Result<()> {
        self.ledger
            .write()
            .unwrap()
            .insert(record.document_id, record.clone());
        Ok(())
    }

    async fn get_ingestion(&self, document_id: Uuid) -> Result<Option<IngestionRecord>> {
        Ok(self.ledger.read().unwrap().get(&document_id).cloned())
    }

    async fn remove_ingestion(&self, document_id: Uuid) -> Result<()> {
        self.ledger.write().unwrap().remove(&document_id);
        Ok(())
    }

    async fn list_ingestions(&self) -> Result<Vec<IngestionRecord>> {
        let mut records: Vec<IngestionRecord> =
            self.ledger.read().unwrap().values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}
