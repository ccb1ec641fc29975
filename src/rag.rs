//! RAG orchestration: grounded prompt construction, LLM completion, and
//! citation resolution.
//!
//! Each retrieved chunk enters the prompt under a numbered `[n]` marker.
//! After completion, markers the model used are mapped back to
//! document/chunk/anchor triples. A marker that does not correspond to a
//! supplied chunk is dropped with a logged warning, never invented: the
//! citation list only ever points at passages that were actually in the
//! prompt.

use std::time::Duration;

use tracing::{debug, warn};

use crate::catalog::MetadataCatalog;
use crate::config::{LlmConfig, RetrievalConfig};
use crate::embedding::EmbeddingGateway;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::llm::LlmProvider;
use crate::models::{ChatAnswer, Citation, DocumentFilter, SearchResult};
use crate::retrieve;

/// Answer a question over the corpus with citations.
#[allow(clippy::too_many_arguments)]
pub async fn chat(
    catalog: &dyn MetadataCatalog,
    index: &dyn VectorIndex,
    embedder: &EmbeddingGateway,
    llm: &dyn LlmProvider,
    llm_config: &LlmConfig,
    question: &str,
    filter: &DocumentFilter,
    top_k: usize,
    params: &RetrievalConfig,
) -> Result<ChatAnswer> {
    let evidence = retrieve::retrieve(catalog, index, embedder, question, filter, top_k, params)
        .await?;

    if evidence.is_empty() {
        // Nothing to ground an answer in; never hand the model a blank
        // context to improvise over.
        return Ok(ChatAnswer {
            answer: "No relevant passages were found in the corpus for this question.".to_string(),
            citations: Vec::new(),
        });
    }

    let prompt = build_prompt(question, &evidence);
    debug!(chunks = evidence.len(), model = llm.model_name(), "requesting completion");

    let answer = complete_with_retry(llm, llm_config, &prompt).await?;
    let citations = resolve_citations(&answer, &evidence);

    Ok(ChatAnswer { answer, citations })
}

/// Build the grounded prompt with one `[n]` marker per evidence chunk.
pub fn build_prompt(question: &str, evidence: &[SearchResult]) -> String {
    let mut prompt = String::from(
        "You are answering questions about a personal document corpus. \
         Use only the numbered context passages below. Cite every claim \
         with the marker of the passage that supports it, in square \
         brackets, e.g. [2]. If the passages do not contain the answer, \
         say so.\n\nContext:\n",
    );
    for (i, result) in evidence.iter().enumerate() {
        let location = match result.anchor.page {
            Some(page) => format!("\"{}\", p. {}", result.title, page),
            None => format!("\"{}\"", result.title),
        };
        prompt.push_str(&format!("[{}] {}: {}\n\n", i + 1, location, result.snippet));
    }
    prompt.push_str(&format!("Question: {question}\n\nAnswer:"));
    prompt
}

async fn complete_with_retry(
    llm: &dyn LlmProvider,
    config: &LlmConfig,
    prompt: &str,
) -> Result<String> {
    let mut last_err = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
        match llm.complete(prompt).await {
            Ok(answer) => return Ok(answer),
            Err(e) if e.is_transient() => {
                debug!(attempt, error = %e, "transient completion failure");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| crate::error::Error::Llm("completion failed".into())))
}

/// Map the `[n]` markers the model used back to citations, in order of
/// first use. Markers outside the supplied range are dropped with a
/// warning.
pub fn resolve_citations(answer: &str, evidence: &[SearchResult]) -> Vec<Citation> {
    let mut citations = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for marker in cited_markers(answer) {
        if !seen.insert(marker) {
            continue;
        }
        match evidence.get((marker as usize).wrapping_sub(1)) {
            Some(result) => citations.push(Citation {
                marker,
                document_id: result.document_id,
                title: result.title.clone(),
                chunk_seq: result.chunk_id.seq,
                anchor: result.anchor,
                snippet: result.snippet.clone(),
            }),
            None => {
                warn!(marker, supplied = evidence.len(), "model cited an unknown passage marker");
            }
        }
    }
    citations
}

/// Scan answer text for `[n]` markers.
fn cited_markers(answer: &str) -> Vec<u32> {
    let mut markers = Vec::new();
    let bytes = answer.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b']' {
                if let Ok(n) = answer[i + 1..j].parse::<u32>() {
                    markers.push(n);
                }
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Anchor, ChunkId};
    use chrono::Utc;
    use uuid::Uuid;

    fn result(seq: u32, title: &str, snippet: &str) -> SearchResult {
        SearchResult {
            chunk_id: ChunkId {
                document_id: Uuid::new_v4(),
                seq,
            },
            document_id: Uuid::new_v4(),
            score: 0.9,
            rank: seq as usize + 1,
            title: title.to_string(),
            snippet: snippet.to_string(),
            anchor: Anchor {
                start: 0,
                end: snippet.len(),
                page: Some(1),
            },
            author: None,
            date_added: Utc::now(),
        }
    }

    #[test]
    fn markers_are_scanned_in_order() {
        assert_eq!(cited_markers("see [2] and [1], also [2]"), vec![2, 1, 2]);
        assert_eq!(cited_markers("no markers here"), Vec::<u32>::new());
        assert_eq!(cited_markers("[12] works, [x] does not, [3"), vec![12]);
    }

    #[test]
    fn citations_resolve_in_first_use_order_without_duplicates() {
        let evidence = vec![
            result(0, "Alpha", "first passage"),
            result(1, "Beta", "second passage"),
        ];
        let citations = resolve_citations("claim [2], more [1], again [2]", &evidence);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].marker, 2);
        assert_eq!(citations[0].title, "Beta");
        assert_eq!(citations[1].marker, 1);
        assert_eq!(citations[1].title, "Alpha");
    }

    #[test]
    fn unknown_markers_are_dropped_not_fabricated() {
        let evidence = vec![result(0, "Alpha", "only passage")];
        let citations = resolve_citations("supported [1], invented [7], zero [0]", &evidence);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].marker, 1);
    }

    #[test]
    fn prompt_contains_markers_question_and_snippets() {
        let evidence = vec![
            result(0, "Alpha", "solar output peaked"),
            result(1, "Beta", "grid storage lagged"),
        ];
        let prompt = build_prompt("what happened to solar?", &evidence);
        assert!(prompt.contains("[1] \"Alpha\", p. 1: solar output peaked"));
        assert!(prompt.contains("[2] \"Beta\""));
        assert!(prompt.contains("Question: what happened to solar?"));
    }
}
