//! Embedding provider abstraction and the gateway that fronts it.
//!
//! Concrete providers:
//! - **[`OpenAiEmbeddings`]** — `POST /v1/embeddings`, keyed by `OPENAI_API_KEY`.
//! - **[`OllamaEmbeddings`]** — a local Ollama instance's `/api/embed` endpoint.
//! - **[`HashEmbeddings`]** — deterministic token-bucket vectors; no network,
//!   usable offline and in tests.
//!
//! [`EmbeddingGateway`] wraps a provider with the pipeline-facing behavior:
//! batching up to `embedding.batch_size`, a content-hash cache so re-ingesting
//! an edited document does not re-embed unchanged chunks, and bounded
//! exponential backoff (1s, 2s, 4s, ... capped at 2^5) for transient
//! provider errors. Quota errors are surfaced immediately and never retried.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// A backend capable of embedding a batch of texts.
///
/// `embed_batch` performs a single attempt; retry policy lives in the
/// gateway. Error contract: transient failures (network, 429 rate limits,
/// 5xx) surface as [`Error::EmbeddingProvider`]; provider-side quota
/// exhaustion as [`Error::EmbeddingQuotaExceeded`]; malformed requests as
/// [`Error::Validation`] (not retried).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed one batch, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Build a provider from configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbeddings::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAiEmbeddings::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbeddings::new(config)?)),
        other => Err(Error::Validation(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

// ============ Gateway ============

/// Thin gateway in front of an [`EmbeddingProvider`]: batching, caching,
/// retry. All pipeline code embeds through this type.
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_retries: u32,
    cache: RwLock<HashMap<[u8; 32], Vec<f32>>>,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed texts, returning vectors in input order.
    ///
    /// Cache hits are served locally; misses go to the provider in batches.
    /// Any batch failing after the retry budget fails the whole call — the
    /// caller never sees a partially embedded input.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<[u8; 32]> = texts.iter().map(|t| content_key(t)).collect();

        let mut results: Vec<Option<Vec<f32>>> = {
            let cache = self.cache.read().unwrap();
            keys.iter().map(|k| cache.get(k).cloned()).collect()
        };

        let miss_indices: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.is_none().then_some(i))
            .collect();

        for batch in miss_indices.chunks(self.batch_size) {
            let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.embed_with_retry(&batch_texts).await?;
            if vectors.len() != batch_texts.len() {
                return Err(Error::EmbeddingProvider(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch_texts.len()
                )));
            }
            let mut cache = self.cache.write().unwrap();
            for (&i, vector) in batch.iter().zip(vectors.into_iter()) {
                if vector.len() != self.provider.dims() {
                    return Err(Error::DimensionMismatch {
                        expected: self.provider.dims(),
                        actual: vector.len(),
                    });
                }
                cache.insert(keys[i], vector.clone());
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or_default()).collect())
    }

    /// Embed a single query text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingProvider("empty embedding response".to_string()))
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            match self.provider.embed_batch(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() => {
                    tracing::debug!(attempt, error = %e, "transient embedding failure");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::EmbeddingProvider("embedding failed after retries".into())))
    }
}

fn content_key(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

// ============ Hash provider ============

/// Deterministic, offline embedding provider.
///
/// Each lowercase whitespace token is hashed into a signed bucket; the
/// accumulated vector is L2-normalized. Texts sharing vocabulary land near
/// each other, identical texts embed identically.
pub struct HashEmbeddings {
    dims: usize,
}

impl HashEmbeddings {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.split_whitespace() {
            let token: String = token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let h = u64::from_le_bytes(digest[..8].try_into().unwrap());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn model_name(&self) -> &str {
        "hash-bucket"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

// ============ OpenAI provider ============

pub struct OpenAiEmbeddings {
    model: String,
    dims: usize,
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Validation("embedding.model required for openai".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Validation("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::EmbeddingProvider(e.to_string()))?;
        Ok(Self {
            model,
            dims: config.dims,
            client,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::EmbeddingProvider(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::EmbeddingProvider(e.to_string()))?;
            return parse_openai_embeddings(&json);
        }

        let body_text = response.text().await.unwrap_or_default();
        classify_http_failure(status, &body_text)
    }
}

fn parse_openai_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::EmbeddingProvider("missing data array in response".into()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::EmbeddingProvider("missing embedding in response".into()))?;
        embeddings.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(embeddings)
}

/// Map an HTTP failure to the error taxonomy: quota exhaustion is fatal,
/// rate limits and server errors are transient, other client errors are not
/// worth retrying.
fn classify_http_failure<T>(status: reqwest::StatusCode, body: &str) -> Result<T> {
    if status.as_u16() == 429 && body.contains("insufficient_quota") {
        return Err(Error::EmbeddingQuotaExceeded(body.to_string()));
    }
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(Error::EmbeddingProvider(format!("{status}: {body}")));
    }
    Err(Error::Validation(format!(
        "embedding request rejected ({status}): {body}"
    )))
}

// ============ Ollama provider ============

pub struct OllamaEmbeddings {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Validation("embedding.model required for ollama".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::EmbeddingProvider(e.to_string()))?;
        Ok(Self {
            model,
            dims: config.dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::EmbeddingProvider(format!(
                    "ollama connection error (is it running at {}?): {e}",
                    self.url
                ))
            })?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::EmbeddingProvider(e.to_string()))?;
            let embeddings = json
                .get("embeddings")
                .and_then(|e| e.as_array())
                .ok_or_else(|| Error::EmbeddingProvider("missing embeddings array".into()))?;
            return embeddings
                .iter()
                .map(|embedding| {
                    embedding
                        .as_array()
                        .ok_or_else(|| Error::EmbeddingProvider("embedding is not an array".into()))
                        .map(|values| {
                            values
                                .iter()
                                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                                .collect()
                        })
                })
                .collect();
        }

        let body_text = response.text().await.unwrap_or_default();
        classify_http_failure(status, &body_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway(dims: usize) -> EmbeddingGateway {
        let config = EmbeddingConfig {
            dims,
            ..Default::default()
        };
        EmbeddingGateway::new(Arc::new(HashEmbeddings::new(dims)), &config)
    }

    #[tokio::test]
    async fn hash_embeddings_are_deterministic_and_normalized() {
        let gw = gateway(64);
        let a = gw.embed_one("the capital of france").await.unwrap();
        let b = gw.embed_one("the capital of france").await.unwrap();
        assert_eq!(a, b);
        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_vocabulary_scores_higher_than_disjoint() {
        let gw = gateway(128);
        let query = gw.embed_one("rust memory safety").await.unwrap();
        let related = gw.embed_one("memory safety in rust programs").await.unwrap();
        let unrelated = gw.embed_one("banana smoothie recipe").await.unwrap();

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[tokio::test]
    async fn embed_preserves_input_order() {
        let gw = gateway(32);
        let texts: Vec<String> = (0..10).map(|i| format!("text number {i}")).collect();
        let vectors = gw.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 10);
        for (i, text) in texts.iter().enumerate() {
            assert_eq!(vectors[i], gw.embed_one(text).await.unwrap());
        }
    }

    struct CountingProvider {
        inner: HashEmbeddings,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn cache_avoids_re_embedding_identical_text() {
        let provider = Arc::new(CountingProvider {
            inner: HashEmbeddings::new(16),
            calls: AtomicUsize::new(0),
        });
        let config = EmbeddingConfig {
            dims: 16,
            ..Default::default()
        };
        let gw = EmbeddingGateway::new(provider.clone(), &config);

        let texts = vec!["same text".to_string(), "other text".to_string()];
        gw.embed(&texts).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        gw.embed(&texts).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    struct QuotaProvider;

    #[async_trait]
    impl EmbeddingProvider for QuotaProvider {
        fn model_name(&self) -> &str {
            "quota"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::EmbeddingQuotaExceeded("insufficient_quota".into()))
        }
    }

    #[tokio::test]
    async fn quota_errors_are_not_retried() {
        let config = EmbeddingConfig {
            dims: 8,
            max_retries: 5,
            ..Default::default()
        };
        let gw = EmbeddingGateway::new(Arc::new(QuotaProvider), &config);
        // with retries this would sleep for seconds; an immediate error
        // shows the quota path short-circuits
        let started = std::time::Instant::now();
        let err = gw.embed_one("text").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingQuotaExceeded(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn http_classification() {
        let quota = classify_http_failure::<()>(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "{\"error\":{\"code\":\"insufficient_quota\"}}",
        )
        .unwrap_err();
        assert!(matches!(quota, Error::EmbeddingQuotaExceeded(_)));

        let rate = classify_http_failure::<()>(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down")
            .unwrap_err();
        assert!(rate.is_transient());

        let server =
            classify_http_failure::<()>(reqwest::StatusCode::BAD_GATEWAY, "oops").unwrap_err();
        assert!(server.is_transient());

        let client =
            classify_http_failure::<()>(reqwest::StatusCode::BAD_REQUEST, "bad").unwrap_err();
        assert!(!client.is_transient());
    }
}
