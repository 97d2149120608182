// Generic document adapter
// Plain pass-through shaping for document retrieval that is not QA-shaped.
// No direct answers; filtering is threshold-only.

use serde_json::{Map, Value};

use crate::contracts::DocumentAdapter;
use crate::types::{sort_by_confidence, ContextItem};

#[derive(Debug, Clone)]
pub struct GenericAdapter {
    pub confidence_threshold: f32,
}

impl Default for GenericAdapter {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
        }
    }
}

impl GenericAdapter {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold,
        }
    }

    pub fn from_config(config: &Value) -> Self {
        Self {
            confidence_threshold: config
                .get("confidence_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(0.3) as f32,
        }
    }
}

impl DocumentAdapter for GenericAdapter {
    fn format_document(&self, raw_doc: &str, metadata: &Map<String, Value>) -> ContextItem {
        let mut item = ContextItem::new(raw_doc, raw_doc);
        item.metadata = metadata.clone();

        if let Some(title) = metadata.get("title").and_then(Value::as_str) {
            item.metadata
                .insert("title".to_string(), Value::String(title.to_string()));
        }

        item
    }

    fn extract_direct_answer(&self, _context: &[ContextItem]) -> Option<String> {
        None
    }

    fn apply_domain_filtering(&self, items: Vec<ContextItem>, _query: &str) -> Vec<ContextItem> {
        let mut filtered: Vec<ContextItem> = items
            .into_iter()
            .filter(|item| item.confidence >= self.confidence_threshold)
            .collect();
        sort_by_confidence(&mut filtered);
        filtered
    }
}
