// Mnemos: Embedding Providers
//
// The engine only *calls* an embedding model; it never hosts one.
// `EmbeddingProvider` is the seam. Two implementations ship:
//   OllamaEmbedder:  Ollama /api/embed, legacy /api/embeddings, then the
//                    OpenAI-compatible /v1/embeddings
//   HashingEmbedder: deterministic feature hashing, no network (offline
//                    operation and tests)
//
// Every call goes through `embed_checked`, which applies the timeout,
// normalizes to unit length, and enforces the store's dimension.

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::atoms::error::{EngineError, EngineResult};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Dimensionality this provider produces.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Build the configured provider.
pub fn build_provider(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(config)),
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
    }
}

/// Embed with a timeout, then normalize and check dimensionality.
/// Provider failures and timeouts both surface as `EmbeddingUnavailable`.
pub async fn embed_checked(
    provider: &dyn EmbeddingProvider,
    text: &str,
    expected_dim: usize,
    timeout: Duration,
) -> EngineResult<Vec<f32>> {
    let raw = match tokio::time::timeout(timeout, provider.embed(text)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e @ EngineError::DimensionMismatch { .. })) => return Err(e),
        Ok(Err(e)) => {
            warn!("[mnemos:embed] Provider {} failed: {}", provider.model_name(), e);
            return Err(EngineError::EmbeddingUnavailable(e.to_string()));
        }
        Err(_) => {
            warn!(
                "[mnemos:embed] Provider {} timed out after {:?}",
                provider.model_name(),
                timeout
            );
            return Err(EngineError::EmbeddingUnavailable(format!(
                "timed out after {} ms",
                timeout.as_millis()
            )));
        }
    };
    if raw.len() != expected_dim {
        return Err(EngineError::DimensionMismatch {
            expected: expected_dim,
            actual: raw.len(),
        });
    }
    normalize(raw)
}

/// Scale to unit length. A zero or non-finite vector cannot be compared.
pub fn normalize(mut v: Vec<f32>) -> EngineResult<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        return Err(EngineError::EmbeddingUnavailable(
            "provider returned a zero or non-finite vector".into(),
        ));
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(v)
}

/// Cosine similarity; on unit vectors this is the dot product, but norms
/// are recomputed so centroids and raw vectors compare correctly too.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Ollama / OpenAI-compatible HTTP client
// ═════════════════════════════════════════════════════════════════════════════

pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

fn parse_vector(arr: &[Value]) -> Vec<f32> {
    arr.iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        OllamaEmbedder {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
        }
    }

    /// POST /api/embed { model, input } → { embeddings: [[f32...]] }
    /// then legacy POST /api/embeddings { model, prompt } → { embedding: [...] }
    async fn embed_ollama(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.base_url);
        let result = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await;

        if let Ok(resp) = result {
            let status = resp.status();
            if status.is_success() {
                if let Ok(v) = resp.json::<Value>().await {
                    if let Some(first) = v["embeddings"]
                        .as_array()
                        .and_then(|e| e.first())
                        .and_then(|e| e.as_array())
                    {
                        let vec = parse_vector(first);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                    if let Some(single) = v["embedding"].as_array() {
                        let vec = parse_vector(single);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                }
            } else {
                let body = resp.text().await.unwrap_or_default();
                if status.as_u16() == 404 && body.contains("model") {
                    return Err(EngineError::EmbeddingUnavailable(format!(
                        "model '{}' not found",
                        self.model
                    )));
                }
                info!("[mnemos:embed] /api/embed returned {}, trying legacy endpoint", status);
            }
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::EmbeddingUnavailable(format!(
                "Ollama embed returned {}",
                resp.status()
            )));
        }
        let v: Value = resp.json().await?;
        let vec = v["embedding"]
            .as_array()
            .map(|a| parse_vector(a))
            .unwrap_or_default();
        if vec.is_empty() {
            return Err(EngineError::EmbeddingUnavailable(
                "no 'embedding' array in Ollama response".into(),
            ));
        }
        Ok(vec)
    }

    /// POST /v1/embeddings { model, input } → { data: [{ embedding }] }
    async fn embed_openai(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::EmbeddingUnavailable(format!(
                "OpenAI-compatible embed returned {}",
                resp.status()
            )));
        }
        let v: Value = resp.json().await?;
        let vec = v["data"][0]["embedding"]
            .as_array()
            .map(|a| parse_vector(a))
            .unwrap_or_default();
        if vec.is_empty() {
            return Err(EngineError::EmbeddingUnavailable(
                "no 'data[0].embedding' array in response".into(),
            ));
        }
        Ok(vec)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let ollama_err = match self.embed_ollama(text).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        match self.embed_openai(text).await {
            Ok(v) => Ok(v),
            Err(openai_err) => Err(EngineError::EmbeddingUnavailable(format!(
                "Ollama: {} | OpenAI: {}",
                ollama_err, openai_err
            ))),
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Deterministic hashing embedder
// ═════════════════════════════════════════════════════════════════════════════

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "am", "do", "does", "did", "i",
    "me", "my", "mine", "you", "your", "it", "its", "of", "to", "in", "on", "at", "for", "and",
    "or", "but", "what", "which", "who", "how", "that", "this", "with", "as", "by", "from", "s",
];

/// Lower-cased content tokens: stopwords dropped, trailing plural `s` stripped.
pub fn content_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| {
            if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
                t[..t.len() - 1].to_string()
            } else {
                t.to_string()
            }
        })
        .collect()
}

/// Feature-hashing bag of words. Texts sharing content words land close
/// together; identical texts embed identically.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn accumulate(&self, feature: &str, weight: f32, out: &mut [f32]) {
        let digest = Sha256::digest(feature.as_bytes());
        let bucket = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) as usize
            % self.dimension;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        out[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimension];
        let tokens = content_tokens(text);
        for tok in &tokens {
            self.accumulate(tok, 1.0, &mut v);
        }
        if tokens.is_empty() {
            // Stopword-only text still needs a stable, non-zero vector.
            self.accumulate(&text.to_lowercase(), 1.0, &mut v);
        }
        Ok(v)
    }
}
