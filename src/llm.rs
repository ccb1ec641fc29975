//! LLM completion capability.
//!
//! The engine only needs one operation from a language model: turn a
//! grounded prompt into answer text. [`LlmProvider`] is that narrow
//! contract; the RAG orchestrator owns retry and deadline policy, so
//! providers perform a single attempt and classify failures (transient
//! network/5xx/429 as [`Error::Llm`], request rejection as
//! [`Error::Validation`]).

use std::time::Duration;

use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier used in logs.
    fn model_name(&self) -> &str;

    /// Generate a completion for the prompt. Single attempt.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Build a provider from configuration. `"disabled"` yields `None`: the
/// engine serves ingestion and search without a chat surface.
pub fn create_provider(config: &LlmConfig) -> Result<Option<Box<dyn LlmProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Box::new(OpenAiChat::new(config)?))),
        "ollama" => Ok(Some(Box::new(OllamaChat::new(config)?))),
        other => Err(Error::Validation(format!("unknown llm provider: {other}"))),
    }
}

// ============ OpenAI provider ============

pub struct OpenAiChat {
    model: String,
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Validation("llm.model required for openai".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Validation("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Llm(e.to_string()))?;
        Ok(Self {
            model,
            client,
            api_key,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value =
                response.json().await.map_err(|e| Error::Llm(e.to_string()))?;
            return json
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| Error::Llm("missing message content in response".into()));
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(Error::Llm(format!("{status}: {body_text}")))
        } else {
            Err(Error::Validation(format!(
                "completion request rejected ({status}): {body_text}"
            )))
        }
    }
}

// ============ Ollama provider ============

pub struct OllamaChat {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Validation("llm.model required for ollama".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Llm(e.to_string()))?;
        Ok(Self { model, url, client })
    }
}

#[async_trait]
impl LlmProvider for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::Llm(format!(
                    "ollama connection error (is it running at {}?): {e}",
                    self.url
                ))
            })?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value =
                response.json().await.map_err(|e| Error::Llm(e.to_string()))?;
            return json
                .get("response")
                .and_then(|r| r.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| Error::Llm("missing response field".into()));
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(Error::Llm(format!("{status}: {body_text}")))
        } else {
            Err(Error::Validation(format!(
                "completion request rejected ({status}): {body_text}"
            )))
        }
    }
}
