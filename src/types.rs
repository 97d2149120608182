// Core value types shared across retrievers
// A ContextItem is the unit of output for every pipeline; metadata is an
// open JSON map so backends can attach driver-specific detail.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::templates::Template;

/// A single ranked context item returned by `get_relevant_context`.
///
/// Invariants:
/// - `confidence` is in [0, 1] and is the final ranking score.
/// - `metadata` carries `source` (datasource name) and `collection` for every
///   item produced by a pipeline.
/// - `raw_document` round-trips the backend's raw payload unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextItem {
    pub content: String,
    pub raw_document: String,
    pub metadata: Map<String, Value>,
    pub confidence: f32,
}

impl ContextItem {
    pub fn new(content: impl Into<String>, raw_document: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            raw_document: raw_document.into(),
            metadata: Map::new(),
            confidence: 0.0,
        }
    }

    /// Attach a metadata entry, replacing any existing value for the key.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Per-call options for `get_relevant_context`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// API key used to derive a collection through the external resolver.
    pub api_key: Option<String>,
    /// Explicit collection name; takes precedence over everything else.
    pub collection: Option<String>,
}

impl QueryOptions {
    pub fn with_collection(name: impl Into<String>) -> Self {
        Self {
            api_key: None,
            collection: Some(name.into()),
        }
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            collection: None,
        }
    }
}

/// A raw hit from a vector backend before score conversion and shaping.
/// Backends populate either `distance` or `score` depending on what the
/// store returns; `convert_score` maps it to a [0, 1] similarity.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub document: String,
    pub metadata: Map<String, Value>,
    pub distance: Option<f32>,
    pub score: Option<f32>,
}

/// A template matched against a query embedding, carrying its similarity and
/// the owning adapter when produced by a composite search.
#[derive(Debug, Clone)]
pub struct TemplateMatch {
    pub template_id: String,
    pub source_adapter: Option<String>,
    pub similarity: f32,
    pub template: Arc<Template>,
    pub embedding_text: String,
    pub boost_applied: f32,
}

impl TemplateMatch {
    pub fn new(template: Arc<Template>, similarity: f32, embedding_text: String) -> Self {
        Self {
            template_id: template.id.clone(),
            source_adapter: None,
            similarity,
            template,
            embedding_text,
            boost_applied: 0.0,
        }
    }
}

/// Sort context items by confidence, highest first. Ties keep insertion
/// order so deterministic backends produce deterministic output.
pub fn sort_by_confidence(items: &mut [ContextItem]) {
    items.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
