//! `OpenAI`-shaped HTTP embedding client.

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Embedding client over the `OpenAI` embeddings REST endpoint.
///
/// Holds a single long-lived, connection-pooled client (§4.1 mandates
/// connection reuse rather than one-shot connections per call).
pub struct HttpEmbedder {
    api_key: String,
    endpoint: String,
    model: String,
    dimensions: usize,
    max_retries: u32,
    backoff_ms: Vec<u64>,
    client: reqwest::blocking::Client,
}

impl HttpEmbedder {
    /// Default model, matching the reference adapter's choice of a
    /// Matryoshka-truncatable model for configurable output dimensions.
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-large";

    /// Default endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.openai.com/v1/embeddings";

    /// Builds an embedder from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if no API key is configured.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_ref()
            .map(|key| secrecy::ExposeSecret::expose_secret(key).to_string())
            .ok_or_else(|| Error::ConfigError("embedding API key not set".to_string()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!("failed to build embedding HTTP client: {err}");
                reqwest::blocking::Client::new()
            });

        Ok(Self {
            api_key,
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
            dimensions: config.dimensions,
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms.clone(),
            client,
        })
    }

    fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let payload = EmbeddingsRequest {
            model: self.model.clone(),
            input: texts.iter().map(|t| (*t).to_string()).collect(),
            dimensions: self.dimensions,
        };

        let mut attempt = 0;
        loop {
            let outcome = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .map_err(|e| Error::EmbeddingError(e.to_string()))
                .and_then(|response| {
                    let status = response.status();
                    if status.is_success() {
                        response
                            .json::<EmbeddingsResponse>()
                            .map_err(|e| Error::EmbeddingError(format!("invalid response: {e}")))
                    } else {
                        Err(Error::EmbeddingError(format!(
                            "embedding API returned status {status}"
                        )))
                    }
                });

            match outcome {
                Ok(mut body) => {
                    metrics::counter!("embedding_requests_total", "status" => "ok").increment(1);
                    body.data.sort_by_key(|entry| entry.index);
                    return Ok(body.data.into_iter().map(|entry| entry.embedding).collect());
                },
                Err(err) if attempt < self.max_retries as usize => {
                    tracing::warn!(attempt, error = %err, "embedding request failed, retrying");
                    metrics::counter!("embedding_requests_total", "status" => "error").increment(1);
                    std::thread::sleep(self.backoff_for_attempt(attempt));
                    attempt += 1;
                },
                Err(err) => {
                    metrics::counter!("embedding_requests_total", "status" => "error").increment(1);
                    return Err(err);
                },
            }
        }
    }
}

impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.request(&[text])?.into_iter().next().unwrap_or_default())
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest {
    model: String,
    input: Vec<String>,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}
