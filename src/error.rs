//! Error taxonomy for the sourcebase engine.
//!
//! Library APIs return [`Error`]; the CLI wraps it in `anyhow` for context.
//! Every variant maps to a stable machine-readable kind via [`Error::kind`],
//! so callers (and the excluded API layer) can branch without string
//! matching. Rules the variants encode:
//!
//! - `Validation` / `UnsupportedFormat` are rejected before any store is
//!   touched.
//! - `EmbeddingProvider` and `Llm` are surfaced only after the retry budget
//!   is exhausted; `EmbeddingQuotaExceeded` is never retried.
//! - `NotFound` is an expected outcome under concurrent delete, not a fault.
//! - `RetrievalTimeout` is returned instead of blocking past the deadline.
//! - `Consistency` marks detected cross-store drift (orphan vectors,
//!   mismatched chunk counts); the repair sweep logs and fixes it.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input rejected before any store was touched.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Document format the extractor set does not handle.
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    /// Corrupt or unreadable document content.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Embedding provider failed after the retry budget was exhausted.
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// Provider-side quota exhaustion; fatal for the current batch.
    #[error("embedding quota exceeded: {0}")]
    EmbeddingQuotaExceeded(String),

    /// Vector length differs from the index's configured dimensionality.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// LLM completion failed after retries.
    #[error("llm provider error: {0}")]
    Llm(String),

    /// Referenced document or chunk no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// Query deadline elapsed before the operation completed.
    #[error("retrieval timed out after {elapsed_ms}ms")]
    RetrievalTimeout { elapsed_ms: u64 },

    /// Cross-store invariant violation detected.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// Underlying storage failure (filesystem or SQL).
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::Extraction(_) => "extraction",
            Error::EmbeddingProvider(_) => "embedding_provider",
            Error::EmbeddingQuotaExceeded(_) => "embedding_quota_exceeded",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::Llm(_) => "llm",
            Error::NotFound(_) => "not_found",
            Error::RetrievalTimeout { .. } => "retrieval_timeout",
            Error::Consistency(_) => "consistency",
            Error::Storage(_) => "storage",
        }
    }

    /// True for failures worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::EmbeddingProvider(_) | Error::Llm(_) | Error::RetrievalTimeout { .. }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(e.to_string())
        } else {
            Error::Storage(e.to_string())
        }
    }
}
