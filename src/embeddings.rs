// Embedding client: turns memory text into vectors for `vec_memory`.
//
// Talks to an OpenAI-compatible embeddings endpoint. The observer provider
// and the embedding provider are configured independently — a device can
// run a local LLM for observation parsing and a hosted embeddings API, or
// vice versa.

use crate::config::Config;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub dim: usize,
    pub batch_size: usize,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl EmbedderConfig {
    pub fn from_config(config: &Config) -> Self {
        EmbedderConfig {
            base_url: config
                .embeddings_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: config
                .embeddings_model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            api_key: config.embeddings_api_key.clone(),
            dim: crate::db::schema::EMBEDDING_DIM,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

pub struct Embedder {
    client: reqwest::Client,
    config: EmbedderConfig,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl Embedder {
    pub fn new(config: EmbedderConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Embedder { client, config })
    }

    /// Embed a single string. Convenience wrapper over `embed_batch`.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors.pop().ok_or_else(|| Error::Other("embeddings API returned no vectors".into()))
    }

    /// Embed a batch of strings, chunking to `config.batch_size` and
    /// retrying transient failures with exponential backoff.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size.max(1)) {
            out.extend(self.embed_chunk(chunk).await?);
        }
        Ok(out)
    }

    async fn embed_chunk(&self, chunk: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": chunk,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = &self.config.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: EmbeddingsResponse = resp.json().await?;
                    return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                }
                Ok(resp) if resp.status().is_server_error() && attempt < self.config.max_retries => {
                    tracing::warn!(status = %resp.status(), attempt, "embeddings request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(Error::RetryableTransient(format!(
                        "embeddings request failed: {status} {text}"
                    )));
                }
                Err(e) if attempt < self.config.max_retries => {
                    tracing::warn!(error = %e, attempt, "embeddings request error, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => return Err(Error::Http(e)),
            }
        }
    }
}

/// Deterministic content chunker: splits `title + body` into fixed-size
/// character windows with a small overlap, so incremental re-embedding can
/// skip chunks whose hash is unchanged.
pub fn chunk_content(title: &str, body: &str, chunk_chars: usize, overlap: usize) -> Vec<String> {
    let full = format!("{title}\n\n{body}");
    let chars: Vec<char> = full.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let step = chunk_chars.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

pub fn content_hash(chunk: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(chunk.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_content_splits_long_text_with_overlap() {
        let body = "a".repeat(250);
        let chunks = chunk_content("t", &body, 100, 20);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn chunk_content_single_chunk_for_short_text() {
        let chunks = chunk_content("title", "short body", 1000, 50);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let a = content_hash("hello");
        let b = content_hash("hello");
        let c = content_hash("hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
