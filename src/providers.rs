//! Embedding backends and the retry loop around them.
//!
//! | `embedding.provider` | Backend |
//! |----------------------|---------|
//! | `"hash"` | [`HashingEmbedder`], offline feature hashing (default) |
//! | `"openai"` | [`OpenAiEmbedder`], `POST {url}/embeddings` |
//! | `"ollama"` | [`OllamaEmbedder`], `POST {url}/api/embed` |
//! | `"local"` | `LocalEmbedder`, fastembed (needs `--features local-embeddings`) |
//!
//! Backends make exactly one attempt per call and classify failures:
//! - HTTP 429 and 5xx, network errors → [`EmbedError::Transient`]
//! - any other HTTP error, malformed responses → [`EmbedError::Fatal`]
//!
//! [`embed_with_retry`] retries transient failures with exponential
//! backoff: `backoff_base_ms × 2^(attempt-1)`, exponent capped at 5.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use resource_index_core::embedding::{EmbedError, Embedder, HashingEmbedder};

use crate::config::{EmbeddingConfig, DEFAULT_HASH_DIMS};
use crate::error::EngineError;

/// Build the embedder named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashingEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed `texts`, retrying transient failures up to `config.max_retries`
/// times. Returns [`EngineError::Cancelled`] as soon as `cancel` fires,
/// including while sleeping between attempts.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    config: &EmbeddingConfig,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>, EngineError> {
    let mut attempt: u32 = 0;
    loop {
        let result = tokio::select! {
            r = embedder.embed_batch(texts) => r,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        match result {
            Ok(vectors) => {
                check_shape(&vectors, texts.len(), embedder.dims())?;
                return Ok(vectors);
            }
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = backoff_delay(config.backoff_base_ms, attempt);
                tracing::warn!(
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "embedding failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(5);
    Duration::from_millis(base_ms.saturating_mul(1 << exp))
}

fn check_shape(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<(), EmbedError> {
    if vectors.len() != expected {
        return Err(EmbedError::Fatal(format!(
            "backend returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbedError::Fatal(format!(
            "backend returned a {}-dimensional vector, expected {}",
            bad.len(),
            dims
        )));
    }
    Ok(())
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Send a JSON request and classify the outcome.
async fn post_json(
    request: reqwest::RequestBuilder,
    backend: &str,
) -> Result<Value, EmbedError> {
    let response = request
        .send()
        .await
        .map_err(|e| EmbedError::Transient(format!("{backend} request failed: {e}")))?;
    let status = response.status();

    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| EmbedError::Fatal(format!("{backend} returned invalid JSON: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    let msg = format!("{backend} API error {status}: {body}");
    if status.as_u16() == 429 || status.is_server_error() {
        Err(EmbedError::Transient(msg))
    } else {
        Err(EmbedError::Fatal(msg))
    }
}

fn parse_vector(value: &Value, backend: &str) -> Result<Vec<f32>, EmbedError> {
    value
        .as_array()
        .ok_or_else(|| {
            EmbedError::Fatal(format!("Invalid {backend} response: embedding is not an array"))
        })
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ OpenAI ============

/// OpenAI-compatible embeddings API. Reads `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json(request, "OpenAI").await?;
        parse_openai_response(&json)
    }
}

/// `data[].embedding`, reordered by `data[].index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Fatal("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| EmbedError::Fatal("Invalid OpenAI response: missing embedding".into()))?;
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// A local Ollama server (`ollama pull nomic-embed-text` first).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);
        let json = post_json(request, "Ollama").await?;

        json.get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                EmbedError::Fatal("Invalid Ollama response: missing embeddings array".into())
            })?
            .iter()
            .map(|v| parse_vector(v, "Ollama"))
            .collect()
    }
}

// ============ Local (fastembed) ============

/// In-process ONNX inference through fastembed. The model is downloaded
/// on first use and kept loaded afterwards.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    model: fastembed::EmbeddingModel,
    dims: usize,
    batch_size: usize,
    loaded: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (model, default_dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        };
        Ok(Self {
            model_name,
            model,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            loaded: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let loaded = self.loaded.clone();
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                let init = fastembed::InitOptions::new(model).with_show_download_progress(false);
                let embedding = fastembed::TextEmbedding::try_new(init).map_err(|e| {
                    EmbedError::Fatal(format!("Failed to initialize local embedding model: {e}"))
                })?;
                *guard = Some(embedding);
            }
            let Some(embedding) = guard.as_mut() else {
                return Err(EmbedError::Fatal("local embedding model unavailable".into()));
            };
            embedding
                .embed(texts, Some(batch_size))
                .map_err(|e| EmbedError::Fatal(format!("Local embedding failed: {e}")))
        })
        .await
        .map_err(|e| EmbedError::Fatal(format!("local embedding task failed: {e}")))?
    }
}
