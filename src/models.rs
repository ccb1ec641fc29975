//! Core data models used throughout sourcebase.
//!
//! These types represent the documents, chunks, and search results that flow
//! through the ingestion and retrieval pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Docx,
    Html,
    Txt,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Docx => "docx",
            DocumentType::Html => "html",
            DocumentType::Txt => "txt",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(DocumentType::Pdf),
            "docx" => Ok(DocumentType::Docx),
            "html" | "htm" => Ok(DocumentType::Html),
            "txt" | "text" => Ok(DocumentType::Txt),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a document in the catalog.
///
/// Only `Indexed` documents are visible to search; the catalog row carrying
/// this status is written last during ingestion, so a document is never
/// half-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Pending,
    Indexed,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Indexed => "indexed",
            IngestionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(IngestionStatus::Pending),
            "indexed" => Ok(IngestionStatus::Indexed),
            "failed" => Ok(IngestionStatus::Failed),
            other => Err(Error::Storage(format!("unknown ingestion status: {other}"))),
        }
    }
}

/// Publication date declared by the user: a bare year or a full date.
///
/// Stored as `YYYY` or `YYYY-MM-DD` text; ordered chronologically so date
/// range filters work across both forms (a bare year sorts as January 1st).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublicationDate {
    Year(i32),
    Date(NaiveDate),
}

impl PublicationDate {
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(PublicationDate::Date(date));
        }
        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(PublicationDate::Year(year));
            }
        }
        Err(Error::Validation(format!(
            "publication date must be YYYY or YYYY-MM-DD, got '{s}'"
        )))
    }

    /// Earliest calendar day this value can denote, used for ordering.
    pub fn sort_key(&self) -> NaiveDate {
        match self {
            PublicationDate::Year(y) => {
                NaiveDate::from_ymd_opt(*y, 1, 1).unwrap_or(NaiveDate::MIN)
            }
            PublicationDate::Date(d) => *d,
        }
    }
}

impl std::fmt::Display for PublicationDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicationDate::Year(y) => write!(f, "{y:04}"),
            PublicationDate::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl PartialOrd for PublicationDate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicationDate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // a bare year sorts just before a full date on the same day, keeping
        // the ordering consistent with equality
        self.sort_key().cmp(&other.sort_key()).then_with(|| {
            match (self, other) {
                (PublicationDate::Year(_), PublicationDate::Date(_)) => std::cmp::Ordering::Less,
                (PublicationDate::Date(_), PublicationDate::Year(_)) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            }
        })
    }
}

/// Metadata declared by the user at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredMetadata {
    pub title: String,
    pub author: Option<String>,
    pub publication_date: Option<PublicationDate>,
    pub doc_type: DocumentType,
}

/// Catalog row for an ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub author: Option<String>,
    pub publication_date: Option<PublicationDate>,
    pub doc_type: DocumentType,
    pub date_added: DateTime<Utc>,
    /// Weak reference into the content store; resolved by the store, never
    /// dereferenced directly.
    pub storage_pointer: String,
    pub chunk_count: u32,
    pub ingestion_status: IngestionStatus,
    /// SHA-256 over content bytes + declared metadata; makes retried
    /// ingestion of identical input resolve to the same committed document.
    pub dedup_hash: String,
}

/// Identity of a chunk: owning document plus contiguous sequence number.
///
/// Sequence numbers start at 0 and define citation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub document_id: Uuid,
    pub seq: u32,
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.document_id, self.seq)
    }
}

/// Positional locator tying a chunk back to the extracted text.
///
/// `start`/`end` are byte offsets into the document's extracted text;
/// `page` is present when the source format carries page boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub start: usize,
    pub end: usize,
    pub page: Option<u32>,
}

/// A chunk of a document's extracted text, the unit of embedding and
/// citation. Created only during ingestion; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    pub anchor: Anchor,
}

/// Filter predicates over catalog metadata.
///
/// `date_from`/`date_to` bound the publication date; documents without one
/// are excluded when either bound is set.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub author: Option<String>,
    pub doc_type: Option<DocumentType>,
    pub date_from: Option<PublicationDate>,
    pub date_to: Option<PublicationDate>,
}

impl DocumentFilter {
    pub fn is_empty(&self) -> bool {
        self.author.is_none()
            && self.doc_type.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }

    /// Evaluate the predicate against a document (used by the memory
    /// catalog; the sqlite catalog compiles it to SQL).
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(ref author) = self.author {
            if doc.author.as_deref() != Some(author.as_str()) {
                return false;
            }
        }
        if let Some(doc_type) = self.doc_type {
            if doc.doc_type != doc_type {
                return false;
            }
        }
        if self.date_from.is_some() || self.date_to.is_some() {
            let Some(pub_date) = doc.publication_date else {
                return false;
            };
            if let Some(from) = self.date_from {
                if pub_date < from {
                    return false;
                }
            }
            if let Some(to) = self.date_to {
                if pub_date > to {
                    return false;
                }
            }
        }
        true
    }
}

/// A search result produced by a query. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub document_id: Uuid,
    pub score: f32,
    pub rank: usize,
    pub title: String,
    pub snippet: String,
    pub anchor: Anchor,
    pub author: Option<String>,
    pub date_added: DateTime<Utc>,
}

/// A resolved citation attached to a chat answer.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    /// The `[n]` marker the model used.
    pub marker: u32,
    pub document_id: Uuid,
    pub title: String,
    pub chunk_seq: u32,
    pub anchor: Anchor,
    pub snippet: String,
}

/// Answer returned by the RAG orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Progress of one document-ingestion attempt through the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Received,
    ContentStored,
    Extracted,
    Embedded,
    Indexed,
    Committed,
    Failed,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Received => "received",
            IngestState::ContentStored => "content_stored",
            IngestState::Extracted => "extracted",
            IngestState::Embedded => "embedded",
            IngestState::Indexed => "indexed",
            IngestState::Committed => "committed",
            IngestState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "received" => Ok(IngestState::Received),
            "content_stored" => Ok(IngestState::ContentStored),
            "extracted" => Ok(IngestState::Extracted),
            "embedded" => Ok(IngestState::Embedded),
            "indexed" => Ok(IngestState::Indexed),
            "committed" => Ok(IngestState::Committed),
            "failed" => Ok(IngestState::Failed),
            other => Err(Error::Storage(format!("unknown ingest state: {other}"))),
        }
    }
}

/// Durable ledger entry for an in-flight ingestion attempt.
///
/// Removed when the attempt commits; a row left behind marks work the
/// reconciliation sweep must garbage-collect.
#[derive(Debug, Clone)]
pub struct IngestionRecord {
    pub document_id: Uuid,
    pub dedup_hash: String,
    pub state: IngestState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publication_date_parses_both_forms() {
        assert_eq!(
            PublicationDate::parse("2020").unwrap(),
            PublicationDate::Year(2020)
        );
        assert_eq!(
            PublicationDate::parse("2021-06-15").unwrap(),
            PublicationDate::Date(NaiveDate::from_ymd_opt(2021, 6, 15).unwrap())
        );
        assert!(PublicationDate::parse("June 2020").is_err());
    }

    #[test]
    fn publication_date_ordering_spans_forms() {
        let year = PublicationDate::parse("2020").unwrap();
        let date = PublicationDate::parse("2020-03-01").unwrap();
        let later = PublicationDate::parse("2021").unwrap();
        assert!(year < date);
        assert!(date < later);
    }

    #[test]
    fn filter_excludes_undated_docs_when_date_bound_set() {
        let doc = Document {
            id: Uuid::new_v4(),
            title: "t".into(),
            author: Some("Smith".into()),
            publication_date: None,
            doc_type: DocumentType::Txt,
            date_added: Utc::now(),
            storage_pointer: "p".into(),
            chunk_count: 1,
            ingestion_status: IngestionStatus::Indexed,
            dedup_hash: "h".into(),
        };
        let filter = DocumentFilter {
            date_from: Some(PublicationDate::Year(2019)),
            ..Default::default()
        };
        assert!(!filter.matches(&doc));

        let author_only = DocumentFilter {
            author: Some("Smith".into()),
            ..Default::default()
        };
        assert!(author_only.matches(&doc));
    }

    #[test]
    fn doc_type_round_trip() {
        for t in [
            DocumentType::Pdf,
            DocumentType::Docx,
            DocumentType::Html,
            DocumentType::Txt,
        ] {
            assert_eq!(DocumentType::parse(t.as_str()).unwrap(), t);
        }
        assert!(DocumentType::parse("epub").is_err());
    }
}
