use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub index: IndexConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

/// Content store backend selection.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `"filesystem"` or `"memory"`.
    #[serde(default = "default_fs_backend")]
    pub backend: String,
    /// Root directory for document blobs (filesystem backend).
    pub root: PathBuf,
}

/// Metadata catalog backend selection.
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    /// `"sqlite"` or `"memory"`.
    #[serde(default = "default_sqlite_backend")]
    pub backend: String,
    /// SQLite database path (sqlite backend).
    pub path: PathBuf,
}

/// Vector index backend selection.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"sqlite"` (vectors persisted next to the catalog) or `"memory"`.
    #[serde(default = "default_sqlite_backend")]
    pub backend: String,
    /// `"cosine"` or `"dot"`.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_sqlite_backend(),
            metric: default_metric(),
        }
    }
}

fn default_fs_backend() -> String {
    "filesystem".to_string()
}
fn default_sqlite_backend() -> String {
    "sqlite".to_string()
}
fn default_metric() -> String {
    "cosine".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// `"recursive"` (paragraph-first) or `"fixed"` (sliding window).
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_strategy() -> String {
    "recursive".to_string()
}
fn default_max_chars() -> usize {
    2800
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"`, `"ollama"`, or `"hash"` (deterministic, offline).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"openai"`, `"ollama"`, or `"disabled"`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Candidate over-fetch multiplier applied to `top_k` before
    /// per-document deduplication.
    #[serde(default = "default_overfetch")]
    pub overfetch: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            overfetch: default_overfetch(),
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_overfetch() -> usize {
    4
}
fn default_query_timeout_ms() -> u64 {
    15_000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.storage.backend.as_str() {
        "filesystem" | "memory" => {}
        other => anyhow::bail!("Unknown storage backend: '{}'. Must be filesystem or memory.", other),
    }
    match config.catalog.backend.as_str() {
        "sqlite" | "memory" => {}
        other => anyhow::bail!("Unknown catalog backend: '{}'. Must be sqlite or memory.", other),
    }
    match config.index.backend.as_str() {
        "sqlite" | "memory" => {}
        other => anyhow::bail!("Unknown index backend: '{}'. Must be sqlite or memory.", other),
    }
    match config.index.metric.as_str() {
        "cosine" | "dot" => {}
        other => anyhow::bail!("Unknown distance metric: '{}'. Must be cosine or dot.", other),
    }

    match config.chunking.strategy.as_str() {
        "recursive" | "fixed" => {}
        other => anyhow::bail!("Unknown chunking strategy: '{}'. Must be recursive or fixed.", other),
    }
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or hash.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if (config.embedding.provider == "openai" || config.embedding.provider == "ollama")
        && config.embedding.model.is_none()
    {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!("llm.model must be specified when provider is '{}'", config.llm.provider);
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_chunks_per_doc == 0 {
        anyhow::bail!("retrieval.max_chunks_per_doc must be >= 1");
    }
    if config.retrieval.overfetch == 0 {
        anyhow::bail!("retrieval.overfetch must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
[storage]
root = "./data/blobs"

[catalog]
path = "./data/sourcebase.db"

[chunking]
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.storage.backend, "filesystem");
        assert_eq!(config.catalog.backend, "sqlite");
        assert_eq!(config.index.backend, "sqlite");
        assert_eq!(config.index.metric, "cosine");
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.dims, 384);
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.max_chunks_per_doc, 3);
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let bad = format!("{MINIMAL}max_chars = 100\noverlap_chars = 100\n");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn network_embedding_requires_model() {
        let bad = format!("{MINIMAL}\n[embedding]\nprovider = \"openai\"\n");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn unknown_metric_rejected() {
        let bad = format!("{MINIMAL}\n[index]\nmetric = \"euclidean\"\n");
        assert!(parse(&bad).is_err());
    }
}
