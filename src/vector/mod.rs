// Vector retriever pipeline
// One pipeline over pluggable backends: embed the query, run the backend
// KNN search, convert backend scores to [0, 1] confidence, shape through
// the document adapter, filter, sort, truncate.

pub mod chroma;
pub mod elasticsearch;
pub mod milvus;
pub mod pinecone;
pub mod qdrant;
pub mod redis;

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::DatasourceConfig;
use crate::contracts::{ApiKeyResolver, DocumentAdapter, Embedder, Retriever};
use crate::errors::{is_dimension_mismatch, RetrievalError};
use crate::types::{sort_by_confidence, ContextItem, QueryOptions, VectorHit};

/// Driver contract for vector stores.
///
/// Backends return raw hits carrying either a distance or a similarity
/// score; `convert_score` maps whichever is present into a [0, 1]
/// confidence using the store's metric semantics.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Confirm the collection exists, creating it when `auto_create` is set
    /// and the backend supports it. Absence maps to `CollectionNotFound`.
    async fn ensure_collection(&self, name: &str, auto_create: bool) -> Result<()>;

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>>;

    /// Map a raw hit to similarity in [0, 1]. The default is the sigmoid
    /// distance fallback; score-returning backends pass scores through.
    fn convert_score(&self, hit: &VectorHit, datasource: &DatasourceConfig) -> f32 {
        if let Some(score) = hit.score {
            return score.clamp(0.0, 1.0);
        }
        match hit.distance {
            Some(distance) => 1.0 / (1.0 + distance / datasource.distance_scaling_factor),
            None => 0.0,
        }
    }
}

struct RetrieverState {
    initialized: bool,
    collection: Option<String>,
}

/// Retriever over any `VectorBackend`.
pub struct VectorRetriever {
    backend: Arc<dyn VectorBackend>,
    datasource_name: String,
    datasource: DatasourceConfig,
    adapter: Arc<dyn DocumentAdapter>,
    embedder: Option<Arc<dyn Embedder>>,
    api_keys: Option<Arc<dyn ApiKeyResolver>>,
    state: RwLock<RetrieverState>,
}

impl VectorRetriever {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        datasource_name: impl Into<String>,
        datasource: DatasourceConfig,
        adapter: Arc<dyn DocumentAdapter>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            backend,
            datasource_name: datasource_name.into(),
            datasource,
            adapter,
            embedder,
            api_keys: None,
            state: RwLock::new(RetrieverState {
                initialized: false,
                collection: None,
            }),
        }
    }

    pub fn with_api_key_resolver(mut self, resolver: Arc<dyn ApiKeyResolver>) -> Self {
        self.api_keys = Some(resolver);
        self
    }

    /// The document adapter, for callers that want the direct-answer
    /// shortcut on already-retrieved context.
    pub fn adapter(&self) -> Arc<dyn DocumentAdapter> {
        self.adapter.clone()
    }

    /// Resolution order: explicit option, API-key binding, datasource
    /// default. Unresolvable is an error.
    async fn resolve_collection(&self, options: &QueryOptions) -> Result<String> {
        if let Some(collection) = &options.collection {
            return Ok(collection.clone());
        }
        if let Some(api_key) = &options.api_key {
            if let Some(resolver) = &self.api_keys {
                if let Some(collection) = resolver.resolve_collection(api_key).await? {
                    return Ok(collection);
                }
            }
        }
        if let Some(collection) = &self.datasource.collection {
            return Ok(collection.clone());
        }

        error!(
            "No collection available for {}; configure a default or pass one per request",
            self.datasource_name
        );
        bail!(RetrievalError::NoCollection)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if !self.state.read().await.initialized {
            self.initialize().await?;
        }
        Ok(())
    }

    fn effective_threshold(&self) -> f32 {
        self.datasource
            .confidence_threshold
            .max(self.datasource.relevance_threshold)
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn initialize(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.initialized {
            return Ok(());
        }
        self.backend.connect().await?;
        state.initialized = true;
        debug!("Initialized {} vector retriever", self.datasource_name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.initialized {
            return Ok(());
        }
        state.initialized = false;
        self.backend.close().await
    }

    async fn set_collection(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            bail!(RetrievalError::CollectionNotFound(String::new()));
        }
        self.backend
            .ensure_collection(name, self.datasource.auto_create_collection)
            .await?;
        self.state.write().await.collection = Some(name.to_string());
        debug!("{} bound to collection '{name}'", self.datasource_name);
        Ok(())
    }

    async fn get_relevant_context(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ContextItem>> {
        self.ensure_initialized().await?;

        let collection = self.resolve_collection(options).await?;
        self.set_collection(&collection).await?;

        let Some(embedder) = &self.embedder else {
            warn!("Embeddings are disabled, no vector search can be performed");
            return Ok(Vec::new());
        };

        let embedding = match embedder.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                error!("Failed to embed query: {err}");
                return Ok(Vec::new());
            }
        };
        if embedding.is_empty() {
            error!("Received empty embedding, cannot perform vector search");
            return Ok(Vec::new());
        }

        debug!(
            "Generated {}-dimensional embedding for query",
            embedding.len()
        );

        let hits = match self
            .backend
            .search(&collection, &embedding, self.datasource.max_results)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                let message = err.to_string();
                if is_dimension_mismatch(&message) {
                    let expected = expected_dimension_from_error(&message, embedding.len());
                    error!(
                        "Embedding dimension mismatch on '{collection}': query vector has {} dimensions, collection expects {}",
                        embedding.len(),
                        expected
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "a different count".to_string())
                    );
                } else {
                    error!("Vector search failed on {}: {message}", self.backend.name());
                }
                return Ok(Vec::new());
            }
        };

        debug!("Vector search returned {} results", hits.len());

        let threshold = self.effective_threshold();
        let mut items = Vec::new();
        for hit in &hits {
            let confidence = self.backend.convert_score(hit, &self.datasource);
            if confidence < threshold {
                debug!("Rejected result with confidence {confidence:.4} (threshold {threshold})");
                continue;
            }

            let mut item = self.adapter.format_document(&hit.document, &hit.metadata);
            item.confidence = confidence;
            item.metadata
                .insert("source".to_string(), Value::String(self.datasource_name.clone()));
            item.metadata
                .insert("collection".to_string(), Value::String(collection.clone()));
            item.metadata
                .insert("similarity".to_string(), Value::from(confidence as f64));
            if let Some(distance) = hit.distance {
                item.metadata
                    .insert("distance".to_string(), Value::from(distance as f64));
            }
            items.push(item);
        }

        sort_by_confidence(&mut items);
        let mut items = self.adapter.apply_domain_filtering(items, query);
        items.truncate(self.datasource.return_results);

        debug!("Retrieved {} relevant context items", items.len());
        Ok(items)
    }
}

/// Pull the expected dimension out of backend error text: the first number
/// that differs from the query's own dimension.
fn expected_dimension_from_error(message: &str, query_dimension: usize) -> Option<usize> {
    static NUMBER: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));
    NUMBER
        .find_iter(message)
        .filter_map(|m| m.as_str().parse::<usize>().ok())
        .find(|&n| n != query_dimension && n > 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GenericAdapter;
    use crate::embeddings::HashEmbedder;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticBackend {
        hits: Vec<VectorHit>,
        connects: AtomicUsize,
        fail_search: Option<String>,
    }

    impl StaticBackend {
        fn with_hits(hits: Vec<VectorHit>) -> Self {
            Self {
                hits,
                connects: AtomicUsize::new(0),
                fail_search: None,
            }
        }
    }

    #[async_trait]
    impl VectorBackend for StaticBackend {
        fn name(&self) -> &str {
            "static"
        }
        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn ensure_collection(&self, name: &str, _auto_create: bool) -> Result<()> {
            if name == "missing" {
                bail!(RetrievalError::CollectionNotFound(name.to_string()));
            }
            Ok(())
        }
        async fn search(
            &self,
            _collection: &str,
            _embedding: &[f32],
            top_k: usize,
        ) -> Result<Vec<VectorHit>> {
            if let Some(message) = &self.fail_search {
                bail!("{}", message.clone());
            }
            Ok(self.hits.iter().take(top_k).cloned().collect())
        }
    }

    fn hit(document: &str, score: f32) -> VectorHit {
        VectorHit {
            document: document.to_string(),
            metadata: Map::new(),
            distance: None,
            score: Some(score),
        }
    }

    fn retriever(backend: StaticBackend, datasource: DatasourceConfig) -> VectorRetriever {
        VectorRetriever::new(
            Arc::new(backend),
            "static",
            datasource,
            Arc::new(GenericAdapter::new(0.0)),
            Some(Arc::new(HashEmbedder::new(16))),
        )
    }

    fn datasource(confidence: f32, returns: usize) -> DatasourceConfig {
        DatasourceConfig {
            confidence_threshold: confidence,
            relevance_threshold: 0.0,
            return_results: returns,
            collection: Some("docs".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pipeline_filters_sorts_truncates() -> Result<()> {
        let backend = StaticBackend::with_hits(vec![
            hit("low", 0.2),
            hit("best", 0.9),
            hit("mid", 0.6),
            hit("good", 0.8),
        ]);
        let retriever = retriever(backend, datasource(0.5, 2));

        let items = retriever
            .get_relevant_context("query", &QueryOptions::default())
            .await?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "best");
        assert_eq!(items[1].content, "good");
        assert!(items[0].confidence >= items[1].confidence);
        assert_eq!(items[0].metadata_str("source"), Some("static"));
        assert_eq!(items[0].metadata_str("collection"), Some("docs"));
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_lazy() -> Result<()> {
        let backend = Arc::new(StaticBackend::with_hits(vec![hit("a", 0.9)]));
        let retriever = VectorRetriever::new(
            backend.clone(),
            "static",
            datasource(0.5, 3),
            Arc::new(GenericAdapter::new(0.0)),
            Some(Arc::new(HashEmbedder::new(16))),
        );

        retriever.initialize().await?;
        retriever.initialize().await?;
        // Lazy path: the query initializes nothing further
        retriever
            .get_relevant_context("q", &QueryOptions::default())
            .await?;
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_collection_propagates() {
        let backend = StaticBackend::with_hits(vec![]);
        let retriever = retriever(backend, datasource(0.5, 3));

        let result = retriever
            .get_relevant_context("q", &QueryOptions::with_collection("missing"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_collection_resolution_fails() {
        let backend = StaticBackend::with_hits(vec![]);
        let mut ds = datasource(0.5, 3);
        ds.collection = None;
        let retriever = retriever(backend, ds);

        let result = retriever
            .get_relevant_context("q", &QueryOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_returns_empty() -> Result<()> {
        let mut backend = StaticBackend::with_hits(vec![]);
        backend.fail_search =
            Some("Vector dimension 16 does not match collection dimensionality 384".to_string());
        let retriever = retriever(backend, datasource(0.5, 3));

        let items = retriever
            .get_relevant_context("q", &QueryOptions::default())
            .await?;
        assert!(items.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_backend_error_returns_empty() -> Result<()> {
        let mut backend = StaticBackend::with_hits(vec![]);
        backend.fail_search = Some("connection refused".to_string());
        let retriever = retriever(backend, datasource(0.5, 3));

        let items = retriever
            .get_relevant_context("q", &QueryOptions::default())
            .await?;
        assert!(items.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_embeddings_yield_empty() -> Result<()> {
        let backend = StaticBackend::with_hits(vec![hit("a", 0.9)]);
        let retriever = VectorRetriever::new(
            Arc::new(backend),
            "static",
            datasource(0.5, 3),
            Arc::new(GenericAdapter::new(0.0)),
            None,
        );

        let items = retriever
            .get_relevant_context("q", &QueryOptions::default())
            .await?;
        assert!(items.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_query_embedding_yields_empty() -> Result<()> {
        let backend = StaticBackend::with_hits(vec![hit("a", 0.9)]);
        let retriever = retriever(backend, datasource(0.5, 3));

        // HashEmbedder yields an empty vector for whitespace-only queries
        let items = retriever
            .get_relevant_context("   ", &QueryOptions::default())
            .await?;
        assert!(items.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_threshold_one_keeps_only_perfect_scores() -> Result<()> {
        let backend = StaticBackend::with_hits(vec![hit("perfect", 1.0), hit("close", 0.999)]);
        let retriever = retriever(backend, datasource(1.0, 5));

        let items = retriever
            .get_relevant_context("q", &QueryOptions::default())
            .await?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "perfect");
        Ok(())
    }

    #[test]
    fn test_expected_dimension_parsing() {
        assert_eq!(
            expected_dimension_from_error("query dim 16 expected 384", 16),
            Some(384)
        );
        assert_eq!(expected_dimension_from_error("no numbers here", 16), None);
    }
}
