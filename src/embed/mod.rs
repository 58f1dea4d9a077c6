use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::error::IndexError;

pub type Embedding = Vec<f32>;

/// Text-to-vector seam. The production implementation talks to an
/// OpenAI-compatible embeddings endpoint; tests substitute deterministic
/// stubs.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, preserving input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;
    fn model_name(&self) -> &str;
}

/// HTTP client for `POST {base}/v1/embeddings`. Requests are split into
/// fixed-size batches client-side; errors propagate so the caller decides
/// retry policy.
pub struct HttpEmbedder {
    agent: ureq::Agent,
    base_url: String,
    model: String,
    api_key: String,
    batch_size: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Embedding,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: &str, batch_size: usize) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(60)))
            .build()
            .into();
        // Tolerate base URLs given with or without the /v1 suffix.
        let base_url = base_url.trim_end_matches('/').trim_end_matches("/v1").to_string();
        Self {
            agent,
            base_url,
            model: model.to_string(),
            api_key: api_key.to_string(),
            batch_size: batch_size.max(1),
        }
    }

    fn embed_batch(&self, batch: &[String]) -> Result<Vec<Embedding>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": batch });

        let mut request = self.agent.post(&url);
        if !self.api_key.is_empty() {
            request = request.header("authorization", format!("Bearer {}", self.api_key));
        }

        let mut response = request
            .send_json(&body)
            .map_err(|e| IndexError::Embedding(e.to_string()))
            .context("embedding request failed")?;

        let parsed: EmbeddingsResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| IndexError::Embedding(e.to_string()))
            .context("parsing embedding response")?;

        let mut items = parsed.data;
        items.sort_by_key(|item| item.index);
        if items.len() != batch.len() {
            return Err(IndexError::Embedding(format!(
                "expected {} vectors, got {}",
                batch.len(),
                items.len()
            ))
            .into());
        }
        Ok(items.into_iter().map(|item| item.embedding).collect())
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            debug!(batch = i, size = batch.len(), model = %self.model, "embedding batch");
            out.extend(self.embed_batch(batch)?);
        }
        Ok(out)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
