//! Embedding provider: hosted embeddings with a deterministic offline
//! fallback.
//!
//! The online backend batches texts to an OpenAI-style `/embeddings`
//! endpoint with one retry per batch; a batch that still fails is replaced
//! by offline vectors for that batch only, so one bad batch never sinks a
//! whole call. The offline backend hashes `(model, text)` into a
//! pseudo-embedding and L2-normalizes it — identical inputs produce
//! bit-identical vectors across process restarts, which keeps the system
//! testable (and cacheable) without network access.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::StageError;

/// Fixed pause before the single retry of a failed online batch.
const RETRY_BACKOFF: Duration = Duration::from_millis(300);

/// Stand-in token for empty or whitespace-only input.
const EMPTY_PLACEHOLDER: &str = "[empty]";

enum Backend {
    Offline,
    Online {
        client: reqwest::Client,
        api_key: String,
        base_url: String,
    },
}

pub struct EmbeddingProvider {
    backend: Backend,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    /// (model, text) → vector. Append-only; entries are immutable once
    /// written, so a race to compute the same key twice is harmless.
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let backend = match config.provider.as_str() {
            "offline" => Backend::Offline,
            "openai" => {
                let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
                if api_key.is_empty() {
                    warn!("OPENAI_API_KEY not set; falling back to offline embeddings");
                    Backend::Offline
                } else {
                    let client = reqwest::Client::builder()
                        .timeout(Duration::from_secs(config.timeout_secs))
                        .build()?;
                    Backend::Online {
                        client,
                        api_key,
                        base_url: config.base_url.clone(),
                    }
                }
            }
            other => anyhow::bail!("Unknown embedding provider: {}", other),
        };

        Ok(Self {
            backend,
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// A provider that never touches the network; used by tests and by
    /// ingestion tooling running without credentials.
    pub fn offline(model: &str, dims: usize) -> Self {
        Self {
            backend: Backend::Offline,
            model: model.to_string(),
            dims,
            batch_size: 64,
            max_retries: 1,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed a batch of texts. Output has the same length and order as the
    /// input. Never fails: online batches that exhaust their retry fall
    /// back to offline vectors for just that batch.
    pub async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            match &self.backend {
                Backend::Offline => out.extend(self.offline_batch(batch)),
                Backend::Online {
                    client,
                    api_key,
                    base_url,
                } => match self.online_batch(client, api_key, base_url, batch).await {
                    Ok(vectors) => out.extend(vectors),
                    Err(e) => {
                        warn!(error = %e, "embedding batch failed; substituting offline vectors");
                        out.extend(self.offline_batch(batch));
                    }
                },
            }
        }
        out
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Vec<f32> {
        let texts = [text.to_string()];
        let mut vectors = self.embed(&texts).await;
        vectors.pop().unwrap_or_else(|| self.offline_vector(text))
    }

    fn offline_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.offline_vector(t)).collect()
    }

    fn offline_vector(&self, text: &str) -> Vec<f32> {
        let key = format!("{}\u{1f}{}", self.model, text);
        if let Ok(cache) = self.cache.read() {
            if let Some(v) = cache.get(&key) {
                return v.clone();
            }
        }
        let vector = pseudo_embedding(&self.model, text, self.dims);
        if let Ok(mut cache) = self.cache.write() {
            cache.entry(key).or_insert_with(|| vector.clone());
        }
        vector
    }

    async fn online_batch(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        base_url: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, StageError> {
        // Hosted endpoints reject empty strings; coerce them the same way
        // the offline hasher does.
        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| {
                if t.trim().is_empty() {
                    EMPTY_PLACEHOLDER
                } else {
                    t.as_str()
                }
            })
            .collect();
        let body = json!({
            "model": self.model,
            "input": inputs,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }

            let resp = client
                .post(format!("{}/embeddings", base_url))
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| StageError::Embedding(e.to_string()))?;
                        let vectors = parse_embedding_response(&json)?;
                        if vectors.len() != texts.len() {
                            return Err(StageError::Embedding(format!(
                                "provider returned {} vectors for {} inputs",
                                vectors.len(),
                                texts.len()
                            )));
                        }
                        return Ok(vectors);
                    }
                    let detail = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(StageError::Embedding(format!(
                            "provider error {}: {}",
                            status, detail
                        )));
                        continue;
                    }
                    // Non-retryable client error.
                    return Err(StageError::Embedding(format!(
                        "provider error {}: {}",
                        status, detail
                    )));
                }
                Err(e) => {
                    last_err = Some(StageError::Embedding(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| StageError::Embedding("embedding failed after retry".to_string())))
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, StageError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| StageError::Embedding("response missing data array".to_string()))?;

    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| StageError::Embedding("response item missing embedding".to_string()))?;
        vectors.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(vectors)
}

/// Deterministic pseudo-embedding: sha-256 over (model, text, block index)
/// yields eight lanes per digest, mapped into [-1, 1] and L2-normalized.
/// No process state is involved, so the same inputs always reproduce the
/// same vector.
fn pseudo_embedding(model: &str, text: &str, dims: usize) -> Vec<f32> {
    let trimmed = text.trim();
    let seed_text = if trimmed.is_empty() {
        EMPTY_PLACEHOLDER
    } else {
        trimmed
    };

    let mut values = Vec::with_capacity(dims);
    let blocks = dims.div_ceil(8);
    for block in 0..blocks as u32 {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0x1f]);
        hasher.update(seed_text.as_bytes());
        hasher.update([0x1f]);
        hasher.update(block.to_le_bytes());
        let digest = hasher.finalize();
        for lane in digest.chunks_exact(4) {
            if values.len() == dims {
                break;
            }
            let raw = u32::from_le_bytes([lane[0], lane[1], lane[2], lane[3]]);
            values.push(((raw as f64 / u32::MAX as f64) * 2.0 - 1.0) as f32);
        }
    }

    let norm = values.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for v in &mut values {
            *v = (*v as f64 / norm) as f32;
        }
    }
    values
}

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing partial lanes are
/// ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in [-1, 1]; 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }
    (dot / denom) as f32
}
