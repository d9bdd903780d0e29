//! Embedding provider abstraction.
//!
//! The pipeline only orchestrates upsert/delete around embeddings; the
//! actual inference is behind [`EmbeddingProvider`]:
//! - **openai** — calls the OpenAI embeddings API with retry and backoff.
//! - **hash** — deterministic offline vectors; useful for tests and for
//!   running the pipeline without credentials.
//! - **disabled** — fails loudly on any embed call.
//!
//! Also provides the vector utilities used by the sqlite-backed store:
//! [`vec_to_blob`], [`blob_to_vec`], [`cosine_similarity`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate the provider selected by the config.
///
/// The OpenAI provider reads `OPENAI_API_KEY` here, once; a missing key is
/// a startup error, not a runtime one.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow!("OPENAI_API_KEY is required for the openai provider"))?;
            Ok(Arc::new(OpenAiProvider {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(config.timeout_secs))
                    .build()?,
                api_key,
                model: config
                    .model
                    .clone()
                    .ok_or_else(|| anyhow!("embedding.model is required"))?,
                dims: config.dims.unwrap_or(0),
                max_retries: config.max_retries,
            }))
        }
        "hash" => Ok(Arc::new(HashProvider {
            dims: config.dims.unwrap_or(64),
        })),
        "disabled" => Ok(Arc::new(DisabledProvider)),
        other => bail!("Unknown embedding provider: {other}"),
    }
}

// ============ OpenAI ============

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut attempt: u32 = 0;
        loop {
            let result = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let retryable = match result {
                Ok(response) if response.status().is_success() => {
                    let parsed: OpenAiResponse = response.json().await?;
                    return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                }
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        format!("OpenAI returned {status}")
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        bail!("OpenAI embeddings request failed with {status}: {text}");
                    }
                }
                Err(err) => format!("OpenAI request error: {err}"),
            };

            if attempt >= self.max_retries {
                bail!("OpenAI embeddings failed after {attempt} retries: {retryable}");
            }
            let delay = Duration::from_secs(1 << attempt.min(5));
            warn!(attempt, backoff_secs = delay.as_secs(), "{retryable}, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

// ============ Hash (offline) ============

/// Deterministic vectors derived from a SHA-256 of the text. No semantic
/// meaning, but stable across runs, which is all dedup needs.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let digest = Sha256::digest(text.as_bytes());
                (0..self.dims)
                    .map(|i| {
                        let byte = digest[i % digest.len()];
                        (byte as f32 / 255.0) * 2.0 - 1.0
                    })
                    .collect()
            })
            .collect())
    }
}

// ============ Disabled ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Vector utilities ============

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
