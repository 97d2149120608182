// Embedding providers for the retrieval core
// The Embedder capability is consumed by vector and intent pipelines; this
// module supplies an OpenAI-compatible HTTP provider, a deterministic local
// provider used as fallback and in tests, and a caching service wrapper.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::contracts::Embedder;

/// Configuration for embedding providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderType,
    pub model_name: String,
    pub dimension: usize,
    pub max_batch_size: usize,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::Local,
            model_name: "local-hash-v1".to_string(),
            dimension: 384,
            max_batch_size: 32,
            api_base: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderType {
    Local,
    Http,
}

/// Deterministic local embedding provider.
///
/// Produces a stable vector derived from token hashes, normalized to unit
/// length. No model quality is implied; the point is a dependable embedding
/// for fallback operation and tests, where identical text must always yield
/// the identical vector.
#[derive(Debug)]
pub struct HashEmbedder {
    model_name: String,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_name: "local-hash-v1".to_string(),
            dimension,
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let mut hash: u64 = 1469598103934665603;
            for byte in token.as_bytes() {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in vector.iter_mut() {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.embed(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// OpenAI-compatible HTTP embedding provider.
#[derive(Debug)]
pub struct HttpEmbedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
    api_base: String,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            config,
            client,
            api_base,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| anyhow!("No embedding returned"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        #[derive(Serialize)]
        struct EmbeddingRequest<'a> {
            input: &'a [String],
            model: &'a str,
            encoding_format: &'static str,
        }

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }

        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
            index: usize,
        }

        let request = EmbeddingRequest {
            input: texts,
            model: &self.config.model_name,
            encoding_format: "float",
        };

        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.json(&request).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Embedding API error: {error_text}"));
        }

        let embedding_response: EmbeddingResponse = response.json().await?;

        // Sort by index to restore input order
        let mut sorted = embedding_response.data;
        sorted.sort_by_key(|d| d.index);

        Ok(sorted.into_iter().map(|d| d.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}

/// Embedding service that wraps a provider with a query cache.
pub struct EmbeddingService {
    provider: Arc<dyn Embedder>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn Embedder>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        {
            let cache = self.cache.read().await;
            if let Some(embedding) = cache.get(text) {
                return Ok(embedding.clone());
            }
        }

        let embedding = self.provider.embed_query(text).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(text.to_string(), embedding.clone());
        }

        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.provider.embed_batch(texts).await
    }

    fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    fn model_name(&self) -> &str {
        self.provider.model_name()
    }
}

/// Build an embedder from the application config's `embedding` section.
///
/// The preferred provider is tried first; on failure the deterministic local
/// provider is substituted with a log, so intent pipelines can still
/// initialize when the remote embedding service is down.
pub fn create_embedder(config: &AppConfig, preferred: Option<&str>) -> Arc<dyn Embedder> {
    let provider = preferred
        .map(|p| p.to_string())
        .or_else(|| config.embedding.provider.clone());

    match provider.as_deref() {
        Some("local") | None => Arc::new(HashEmbedder::new(384)),
        Some(name) => {
            let embedding_config = EmbeddingConfig {
                provider: EmbeddingProviderType::Http,
                model_name: name.to_string(),
                ..Default::default()
            };
            match HttpEmbedder::new(embedding_config) {
                Ok(http) => Arc::new(EmbeddingService::new(Arc::new(http))),
                Err(error) => {
                    warn!("Failed to initialize embedding provider '{name}': {error}");
                    info!("Falling back to deterministic local embedding provider");
                    Arc::new(HashEmbedder::new(384))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic() -> Result<()> {
        let embedder = HashEmbedder::new(64);
        let first = embedder.embed_query("orders from John Smith").await?;
        let second = embedder.embed_query("orders from John Smith").await?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_embedder_empty_query_yields_empty_vector() -> Result<()> {
        let embedder = HashEmbedder::new(64);
        let embedding = embedder.embed_query("   ").await?;
        assert!(embedding.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_embedder_unit_norm() -> Result<()> {
        let embedder = HashEmbedder::new(128);
        let embedding = embedder.embed_query("customer lifetime value").await?;
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[tokio::test]
    async fn test_embedding_service_caches_queries() -> Result<()> {
        let service = EmbeddingService::new(Arc::new(HashEmbedder::new(32)));
        let first = service.embed_query("hello world").await?;
        let second = service.embed_query("hello world").await?;
        assert_eq!(first, second);
        assert_eq!(service.cache_size().await, 1);

        service.clear_cache().await;
        assert_eq!(service.cache_size().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_preserves_order() -> Result<()> {
        let embedder = HashEmbedder::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let batch = embedder.embed_batch(&texts).await?;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed_query("alpha").await?);
        assert_eq!(batch[1], embedder.embed_query("beta").await?);
        Ok(())
    }
}
