// Capability contracts for the retrieval core
// Every seam between the core and its collaborators is a trait here:
// retrievers, embedders, inference providers, document adapters, and the
// external services (API keys, adapter management) the core consumes.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::types::{ContextItem, QueryOptions, TemplateMatch};

/// The sole query surface of the core.
///
/// # Preconditions
/// - `initialize` has been called, or the implementation initializes lazily
///   on first use.
///
/// # Postconditions
/// - `get_relevant_context` returns items sorted by descending confidence,
///   truncated to the datasource's `return_results`.
/// - Every returned item carries `metadata.source` and `metadata.collection`.
/// - A retriever instance is safe to invoke from multiple concurrent callers.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Connect and validate the backend. Idempotent: a second call after a
    /// successful first is a no-op.
    async fn initialize(&self) -> Result<()>;

    /// Release the backend handle. Safe on uninitialized instances and must
    /// release connections exactly once.
    async fn close(&self) -> Result<()>;

    /// Bind the retriever to a named logical container (vector collection,
    /// SQL table, search index). Fails with `CollectionNotFound` when the
    /// backend confirms absence; backends may auto-create when configured.
    async fn set_collection(&self, name: &str) -> Result<()>;

    /// Retrieve ranked context for a query.
    async fn get_relevant_context(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ContextItem>>;
}

/// Embedding capability consumed by vector and intent pipelines. Expected to
/// be internally safe for concurrent callers; instances are shared.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimension of the vectors this embedder produces.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// LLM inference capability consumed by the intent pipeline for parameter
/// fallback extraction and response generation. Shared, concurrency-safe.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Domain-aware document shaper. Adapters map raw backend payloads to
/// context items, optionally short-circuit to a direct answer, and apply
/// domain-specific filtering after ranking.
pub trait DocumentAdapter: Send + Sync {
    /// Shape a raw document and its metadata into a context item.
    /// Extracting `raw_document` from the result returns the input unchanged.
    fn format_document(&self, raw_doc: &str, metadata: &Map<String, Value>) -> ContextItem;

    /// Extract a direct answer from already-ranked context, if this domain
    /// supports one (the QA shortcut). Callers outside the core consume this.
    fn extract_direct_answer(&self, context: &[ContextItem]) -> Option<String>;

    /// Filter or rerank context items for the domain. Called after score
    /// sorting and before final truncation.
    fn apply_domain_filtering(&self, items: Vec<ContextItem>, query: &str) -> Vec<ContextItem>;
}

/// External collaborator that validates API keys and maps them to
/// collections. The core never interprets keys itself.
#[async_trait]
pub trait ApiKeyResolver: Send + Sync {
    /// Validate a key and return the collection it is bound to, if any.
    /// Invalid keys fail with `RetrievalError::InvalidApiKey`.
    async fn resolve_collection(&self, api_key: &str) -> Result<Option<String>>;
}

/// Capability exposed by intent retrievers to the composite router: template
/// store search plus delegated execution. The composite holds these as
/// non-owning references; lifetime belongs to the adapter manager.
#[async_trait]
pub trait IntentChild: Send + Sync {
    /// Search this child's template store with a pre-computed embedding.
    async fn search_templates(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<TemplateMatch>>;

    /// Execute the query through this child's full pipeline.
    async fn get_relevant_context(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ContextItem>>;
}

/// External manager that owns named adapters. The composite router resolves
/// children through it and must never close what it resolves.
#[async_trait]
pub trait AdapterManager: Send + Sync {
    async fn get_intent_child(&self, name: &str) -> Result<Option<Arc<dyn IntentChild>>>;
}
