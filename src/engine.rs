//! Engine: the explicitly owned composition root.
//!
//! [`Engine::open`] wires the configured backends (content store, catalog,
//! vector index, embedding and LLM providers) into one owned value with a
//! defined lifecycle: open the corpus, serve operations, [`Engine::close`].
//! The coordinator and orchestrators receive their stores by reference from
//! here; nothing in the crate reaches for shared state ambiently.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{MemoryCatalog, MetadataCatalog, MetadataPatch, SqliteCatalog};
use crate::config::Config;
use crate::content::{ContentStore, FsContentStore, MemoryContentStore};
use crate::db;
use crate::embedding::{self, EmbeddingGateway};
use crate::error::{Error, Result};
use crate::index::{DistanceMetric, MemoryVectorIndex, SqliteVectorIndex, VectorIndex};
use crate::ingest::IngestionCoordinator;
use crate::llm::{self, LlmProvider};
use crate::models::{
    ChatAnswer, Chunk, DeclaredMetadata, Document, DocumentFilter, IngestState, SearchResult,
};
use crate::rag;
use crate::reconcile::{self, RepairReport};
use crate::retrieve;

/// Ledger entries older than this are treated as dead by [`Engine::repair`].
const STALE_ATTEMPT_AGE_MINUTES: i64 = 60;

pub struct Engine {
    config: Config,
    content: Arc<dyn ContentStore>,
    catalog: Arc<dyn MetadataCatalog>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<EmbeddingGateway>,
    llm: Option<Box<dyn LlmProvider>>,
    coordinator: IngestionCoordinator,
    pool: Option<SqlitePool>,
}

impl Engine {
    /// Open the corpus with the backends named in the configuration.
    pub async fn open(config: Config) -> Result<Engine> {
        let content: Arc<dyn ContentStore> = match config.storage.backend.as_str() {
            "filesystem" => Arc::new(FsContentStore::new(config.storage.root.clone())),
            "memory" => Arc::new(MemoryContentStore::new()),
            other => return Err(Error::Validation(format!("unknown storage backend: {other}"))),
        };

        let needs_pool =
            config.catalog.backend == "sqlite" || config.index.backend == "sqlite";
        let pool = if needs_pool {
            Some(db::connect(&config.catalog.path).await?)
        } else {
            None
        };

        let catalog: Arc<dyn MetadataCatalog> = match config.catalog.backend.as_str() {
            "sqlite" => Arc::new(SqliteCatalog::open(pool.clone().unwrap()).await?),
            "memory" => Arc::new(MemoryCatalog::new()),
            other => return Err(Error::Validation(format!("unknown catalog backend: {other}"))),
        };

        let metric = DistanceMetric::parse(&config.index.metric)?;
        let dims = config.embedding.dims;
        let index: Arc<dyn VectorIndex> = match config.index.backend.as_str() {
            "sqlite" => {
                Arc::new(SqliteVectorIndex::open(pool.clone().unwrap(), dims, metric).await?)
            }
            "memory" => Arc::new(MemoryVectorIndex::new(dims, metric)),
            other => return Err(Error::Validation(format!("unknown index backend: {other}"))),
        };

        let provider = embedding::create_provider(&config.embedding)?;
        if provider.dims() != index.dims() {
            return Err(Error::Validation(format!(
                "embedding dims ({}) differ from index dims ({})",
                provider.dims(),
                index.dims()
            )));
        }
        let embedder = Arc::new(EmbeddingGateway::new(provider, &config.embedding));
        let llm = llm::create_provider(&config.llm)?;

        let coordinator = IngestionCoordinator::new(
            content.clone(),
            catalog.clone(),
            index.clone(),
            embedder.clone(),
            config.chunking.clone(),
        );

        info!(
            storage = %config.storage.backend,
            catalog = %config.catalog.backend,
            index = %config.index.backend,
            embedding = %config.embedding.provider,
            "corpus opened"
        );

        Ok(Engine {
            config,
            content,
            catalog,
            index,
            embedder,
            llm,
            coordinator,
            pool,
        })
    }

    /// Install a custom LLM provider, replacing the configured one.
    ///
    /// The seam for callers embedding the engine with their own completion
    /// backend; the built-in providers cover openai and ollama.
    pub fn with_llm_provider(mut self, provider: Box<dyn LlmProvider>) -> Self {
        self.llm = Some(provider);
        self
    }

    /// Ingest a new document; returns its ID.
    pub async fn ingest(&self, bytes: &[u8], metadata: &DeclaredMetadata) -> Result<Uuid> {
        self.coordinator.ingest(bytes, metadata).await
    }

    /// Replace an existing document's content and declared metadata.
    pub async fn reingest(
        &self,
        id: Uuid,
        bytes: &[u8],
        metadata: &DeclaredMetadata,
    ) -> Result<()> {
        self.coordinator.reingest(id, bytes, metadata).await
    }

    /// Delete a document from all stores.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.coordinator.delete(id).await
    }

    /// Fetch a document's metadata row.
    pub async fn get(&self, id: Uuid) -> Result<Document> {
        self.catalog
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {id}")))
    }

    /// Fetch a document's chunk records in citation order.
    pub async fn get_chunks(&self, id: Uuid) -> Result<Vec<Chunk>> {
        self.get(id).await?;
        self.catalog.get_chunks(id).await
    }

    /// Fetch a document's raw content bytes.
    pub async fn get_content(&self, id: Uuid) -> Result<Vec<u8>> {
        self.get(id).await?;
        self.content.get(id).await
    }

    /// List indexed documents, newest first.
    pub async fn list(
        &self,
        filter: &DocumentFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Document>> {
        self.catalog.list(filter, limit, offset).await
    }

    /// Patch mutable metadata fields without re-ingestion.
    pub async fn update_metadata(&self, id: Uuid, patch: &MetadataPatch) -> Result<Document> {
        self.catalog.update_metadata(id, patch).await
    }

    /// Semantic search with optional metadata pre-filtering.
    pub async fn search(
        &self,
        query: &str,
        filter: &DocumentFilter,
        top_k: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        retrieve::retrieve(
            self.catalog.as_ref(),
            self.index.as_ref(),
            &self.embedder,
            query,
            filter,
            top_k.unwrap_or(self.config.retrieval.top_k),
            &self.config.retrieval,
        )
        .await
    }

    /// Answer a question over the corpus with citations.
    pub async fn chat(
        &self,
        question: &str,
        filter: &DocumentFilter,
        top_k: Option<usize>,
    ) -> Result<ChatAnswer> {
        let llm = self
            .llm
            .as_deref()
            .ok_or_else(|| Error::Validation("llm provider is disabled".to_string()))?;
        rag::chat(
            self.catalog.as_ref(),
            self.index.as_ref(),
            &self.embedder,
            llm,
            &self.config.llm,
            question,
            filter,
            top_k.unwrap_or(self.config.retrieval.top_k),
            &self.config.retrieval,
        )
        .await
    }

    /// Run a reconciliation sweep over all three stores.
    pub async fn repair(&self) -> Result<RepairReport> {
        reconcile::repair(
            self.content.as_ref(),
            self.catalog.as_ref(),
            self.index.as_ref(),
            &self.embedder,
            chrono::Duration::minutes(STALE_ATTEMPT_AGE_MINUTES),
        )
        .await
    }

    /// State of the last ingestion attempt for a document, if one is still
    /// recorded (committed attempts clear their marker).
    pub async fn ingestion_state(&self, id: Uuid) -> Result<Option<IngestState>> {
        self.coordinator.attempt_state(id).await
    }

    /// Flush and release the underlying stores.
    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
        info!("corpus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentType;

    fn memory_config() -> Config {
        toml::from_str(
            r#"
            [storage]
            backend = "memory"
            root = "/unused"

            [catalog]
            backend = "memory"
            path = "/unused.db"

            [index]
            backend = "memory"

            [chunking]
            max_chars = 200
            overlap_chars = 20
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn open_serve_close_lifecycle() {
        let engine = Engine::open(memory_config()).await.unwrap();
        let metadata = DeclaredMetadata {
            title: "Lifecycle".into(),
            author: None,
            publication_date: None,
            doc_type: DocumentType::Txt,
        };
        let id = engine
            .ingest(b"Some body text for the lifecycle test.", &metadata)
            .await
            .unwrap();
        assert_eq!(engine.get(id).await.unwrap().title, "Lifecycle");
        engine.close().await;
    }

    #[tokio::test]
    async fn chat_requires_an_enabled_llm() {
        let engine = Engine::open(memory_config()).await.unwrap();
        let err = engine
            .chat("anything", &DocumentFilter::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
