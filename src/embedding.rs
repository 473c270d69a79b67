//! Text Embedding
//!
//! Batch embedding over the backend's HTTP API, plus the vector math the
//! example index relies on. Embeddings are produced in one request per batch
//! and L2-normalized by the caller so inner product equals cosine similarity.

use crate::error::{MedSqlError, Result};
use async_trait::async_trait;
use tracing::debug;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// Source of text embeddings.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

/// Embedding client using the Ollama embed API.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl TextEmbedder for OllamaEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Embedding {} texts with model {}", texts.len(), self.model);

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| MedSqlError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MedSqlError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MedSqlError::Embedding(format!("Failed to parse embedding response: {}", e)))?;

        let rows = response_json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| MedSqlError::Embedding("No embeddings in response".to_string()))?;

        let mut embeddings = Vec::with_capacity(rows.len());
        for row in rows {
            let vector: Embedding = row
                .as_array()
                .ok_or_else(|| MedSqlError::Embedding("Malformed embedding row".to_string()))?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            embeddings.push(vector);
        }

        if embeddings.len() != texts.len() {
            return Err(MedSqlError::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }
}

/// Scale a vector to unit length so inner product equals cosine similarity.
/// Zero vectors are left untouched.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Inner product of two equal-length vectors; 0.0 on dimension mismatch.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
