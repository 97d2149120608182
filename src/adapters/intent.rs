// Intent document adapter
// Owns the loaded domain configuration and template library for an intent
// retriever, and shapes SQL/HTTP result payloads into context items.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::contracts::DocumentAdapter;
use crate::domain::DomainConfig;
use crate::templates::{Template, TemplateLibrary};
use crate::types::ContextItem;

pub struct IntentAdapter {
    domain: Arc<DomainConfig>,
    templates: TemplateLibrary,
    pub confidence_threshold: f32,
}

impl IntentAdapter {
    /// Load domain config and one or more template libraries from disk.
    pub fn load(
        domain_config_path: Option<&Path>,
        template_library_paths: &[&Path],
        confidence_threshold: f32,
    ) -> Result<Self> {
        let domain = match domain_config_path {
            Some(path) => DomainConfig::from_path(path)
                .with_context(|| format!("loading domain config {}", path.display()))?,
            None => {
                warn!("No domain config supplied, intent adapter runs with an empty domain");
                DomainConfig::default()
            }
        };

        let mut templates = TemplateLibrary::new();
        for path in template_library_paths {
            let added = templates
                .merge_file(path)
                .with_context(|| format!("loading template library {}", path.display()))?;
            info!("Loaded {added} templates from {}", path.display());
        }

        Ok(Self {
            domain: Arc::new(domain),
            templates,
            confidence_threshold,
        })
    }

    /// Build from already-parsed parts (the in-process path and tests).
    pub fn from_parts(
        domain: DomainConfig,
        templates: TemplateLibrary,
        confidence_threshold: f32,
    ) -> Self {
        Self {
            domain: Arc::new(domain),
            templates,
            confidence_threshold,
        }
    }

    pub fn domain_config(&self) -> Arc<DomainConfig> {
        self.domain.clone()
    }

    pub fn template_by_id(&self, id: &str) -> Option<&Template> {
        self.templates.get(id)
    }

    pub fn all_templates(&self) -> &[Template] {
        self.templates.all()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }
}

impl DocumentAdapter for IntentAdapter {
    fn format_document(&self, raw_doc: &str, metadata: &Map<String, Value>) -> ContextItem {
        let mut item = ContextItem::new(raw_doc, raw_doc);
        item.metadata = metadata.clone();

        // Result rows travel in metadata; summarize them as the content
        if let Some(results) = metadata.get("results").and_then(Value::as_array) {
            item.content = match results.len() {
                0 => "No results found.".to_string(),
                1 => format_single_result(&results[0]),
                _ => format_multiple_results(results),
            };
        } else {
            item.content = raw_doc.to_string();
        }

        item
    }

    fn extract_direct_answer(&self, context: &[ContextItem]) -> Option<String> {
        let first = context.first()?;
        if first.confidence >= self.confidence_threshold && !first.content.is_empty() {
            Some(first.content.clone())
        } else {
            None
        }
    }

    fn apply_domain_filtering(&self, items: Vec<ContextItem>, _query: &str) -> Vec<ContextItem> {
        // Ranking happened during template selection; nothing to refine here
        items
    }
}

fn format_single_result(row: &Value) -> String {
    let Some(object) = row.as_object() else {
        return row.to_string();
    };
    object
        .iter()
        .map(|(key, value)| format!("{key}: {}", value_text(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_multiple_results(results: &[Value]) -> String {
    let mut lines = vec![format!("Found {} results:", results.len())];
    for (index, row) in results.iter().take(10).enumerate() {
        lines.push(format!("{}. {}", index + 1, format_single_result(row)));
    }
    if results.len() > 10 {
        lines.push(format!("... and {} more", results.len() - 10));
    }
    lines.join("\n")
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_fixtures::customer_order_domain;
    use serde_json::json;

    fn adapter() -> IntentAdapter {
        let mut templates = TemplateLibrary::new();
        templates.insert(Template {
            id: "orders_by_customer".to_string(),
            description: "Find orders".to_string(),
            ..Default::default()
        });
        IntentAdapter::from_parts(customer_order_domain(), templates, 0.75)
    }

    #[test]
    fn test_template_lookup() {
        let adapter = adapter();
        assert!(adapter.template_by_id("orders_by_customer").is_some());
        assert!(adapter.template_by_id("nope").is_none());
        assert_eq!(adapter.template_count(), 1);
    }

    #[test]
    fn test_format_document_with_results() {
        let adapter = adapter();
        let mut metadata = Map::new();
        metadata.insert(
            "results".to_string(),
            json!([{"id": 1, "total": 10.0}, {"id": 2, "total": 12.5}]),
        );

        let item = adapter.format_document("[]", &metadata);
        assert!(item.content.starts_with("Found 2 results:"));
        assert!(item.content.contains("id: 1"));
    }

    #[test]
    fn test_direct_answer_threshold() {
        let adapter = adapter();
        let item = ContextItem::new("the answer", "raw").with_confidence(0.9);
        assert_eq!(
            adapter.extract_direct_answer(&[item.clone()]),
            Some("the answer".to_string())
        );

        let low = item.with_confidence(0.2);
        assert_eq!(adapter.extract_direct_answer(&[low]), None);
    }
}
