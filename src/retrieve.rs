//! Hybrid retrieval: metadata pre-filtering composed with vector search.
//!
//! The pipeline for one query:
//! 1. embed the query;
//! 2. when filters are present, resolve the matching document-ID set from
//!    the catalog first so semantic ranking never scans excluded documents;
//! 3. over-fetch candidates from the vector index (`top_k × overfetch`);
//! 4. resolve each hit against the catalog, dropping anything that no
//!    longer maps to an indexed document and chunk (fail closed: a stale
//!    hit under concurrent delete is not-found, not an error);
//! 5. keep at most `max_chunks_per_doc` best chunks per document;
//! 6. re-rank and truncate to `top_k`.
//!
//! Ordering is deterministic: score descending, then earlier chunk
//! sequence, then document recency, then document ID.
//!
//! The whole operation runs under `retrieval.timeout_ms`; when the deadline
//! passes a `RetrievalTimeout` is returned instead of blocking (provider
//! calls already in flight finish in the background and are discarded).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::catalog::MetadataCatalog;
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::models::{Document, DocumentFilter, IngestionStatus, SearchResult};

/// Longest snippet attached to a result or citation.
const SNIPPET_CHARS: usize = 240;

pub async fn retrieve(
    catalog: &dyn MetadataCatalog,
    index: &dyn VectorIndex,
    embedder: &EmbeddingGateway,
    query: &str,
    filter: &DocumentFilter,
    top_k: usize,
    params: &RetrievalConfig,
) -> Result<Vec<SearchResult>> {
    let deadline = Duration::from_millis(params.timeout_ms);
    match tokio::time::timeout(
        deadline,
        retrieve_inner(catalog, index, embedder, query, filter, top_k, params),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::RetrievalTimeout {
            elapsed_ms: params.timeout_ms,
        }),
    }
}

async fn retrieve_inner(
    catalog: &dyn MetadataCatalog,
    index: &dyn VectorIndex,
    embedder: &EmbeddingGateway,
    query: &str,
    filter: &DocumentFilter,
    top_k: usize,
    params: &RetrievalConfig,
) -> Result<Vec<SearchResult>> {
    if query.trim().is_empty() || top_k == 0 {
        return Ok(Vec::new());
    }

    let query_vec = embedder.embed_one(query).await?;

    // Pre-filter: narrow the index scan to documents the metadata predicate
    // admits. An empty candidate set short-circuits the semantic stage.
    let candidates: Option<HashSet<Uuid>> = if filter.is_empty() {
        None
    } else {
        let docs = catalog.list(filter, u32::MAX, 0).await?;
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        Some(docs.into_iter().map(|d| d.id).collect())
    };

    let overfetch = top_k.saturating_mul(params.overfetch).max(top_k);
    let hits = index
        .search(&query_vec, overfetch, candidates.as_ref())
        .await?;

    // Resolve hits against the catalog. Documents are fetched once each;
    // unresolvable hits (deleted or not-yet-committed documents, stale
    // chunk IDs after an update) are dropped.
    let mut doc_cache: HashMap<Uuid, Option<Document>> = HashMap::new();
    let mut per_doc: HashMap<Uuid, Vec<SearchResult>> = HashMap::new();

    for (chunk_id, score) in hits {
        let doc = match doc_cache.get(&chunk_id.document_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = catalog.get(chunk_id.document_id).await?;
                doc_cache.insert(chunk_id.document_id, fetched.clone());
                fetched
            }
        };
        let Some(doc) = doc else {
            debug!(%chunk_id, "dropping hit: document no longer exists");
            continue;
        };
        if doc.ingestion_status != IngestionStatus::Indexed || !filter.matches(&doc) {
            continue;
        }
        let Some(chunk) = catalog.get_chunk(chunk_id).await? else {
            debug!(%chunk_id, "dropping hit: stale chunk id");
            continue;
        };

        per_doc.entry(doc.id).or_default().push(SearchResult {
            chunk_id,
            document_id: doc.id,
            score,
            rank: 0,
            title: doc.title.clone(),
            snippet: snippet(&chunk.text),
            anchor: chunk.anchor,
            author: doc.author.clone(),
            date_added: doc.date_added,
        });
    }

    // Per-document cap so one document cannot dominate the evidence set.
    let mut results: Vec<SearchResult> = Vec::new();
    for (_, mut doc_results) in per_doc {
        doc_results.sort_by(compare_results);
        doc_results.truncate(params.max_chunks_per_doc);
        results.extend(doc_results);
    }

    results.sort_by(compare_results);
    results.truncate(top_k);
    for (i, result) in results.iter_mut().enumerate() {
        result.rank = i + 1;
    }
    Ok(results)
}

/// Score descending; ties broken by earlier chunk sequence, then document
/// recency, then document ID.
fn compare_results(a: &SearchResult, b: &SearchResult) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.chunk_id.seq.cmp(&b.chunk_id.seq))
        .then_with(|| b.date_added.cmp(&a.date_added))
        .then_with(|| a.document_id.cmp(&b.document_id))
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}
