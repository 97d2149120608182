// Template model for the intent pipeline
// Templates are declarative query patterns (SQL text, HTTP request spec, or
// query DSL) with typed parameters, NL examples, and semantic tags. They are
// loaded from YAML libraries in either list or map form and merged with
// last-id-wins semantics.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::domain::DomainConfig;

/// A declarative query template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nl_examples: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub semantic_tags: Option<SemanticTags>,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    /// SQL body, rendered by the template processor before execution.
    #[serde(default, alias = "sql")]
    pub sql_template: Option<String>,
    /// Query DSL body for search-engine backends.
    #[serde(default)]
    pub query_dsl: Option<Value>,
    /// HTTP request directive for HTTP intent backends.
    #[serde(default)]
    pub http_request: Option<HttpRequestSpec>,
    #[serde(default = "default_result_format")]
    pub result_format: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

fn default_result_format() -> String {
    "table".to_string()
}

/// Semantic tags describing what a template is about, used for embedding
/// text assembly and reranking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticTags {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub primary_entity: Option<String>,
    #[serde(default)]
    pub secondary_entity: Option<String>,
    #[serde(default)]
    pub qualifiers: Vec<String>,
}

/// A typed template parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    /// Data type: integer, decimal, string, boolean, date, enum.
    #[serde(default, alias = "type")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub semantic_type: Option<String>,
    #[serde(default)]
    pub allowed_values: Vec<String>,
    #[serde(default)]
    pub example: Option<String>,
    #[serde(default)]
    pub extraction_hints: Option<Value>,
}

impl TemplateParameter {
    pub fn type_name(&self) -> &str {
        self.data_type.as_deref().unwrap_or("string")
    }
}

/// HTTP request directive carried by HTTP intent templates. All string
/// fields are template-rendered before the request is issued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    #[serde(default = "default_http_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// A merged set of templates keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: Vec<Template>,
    by_id: HashMap<String, usize>,
}

/// YAML wire form: `templates` as a list, or as a map whose keys serve as
/// fallback ids.
#[derive(Deserialize)]
struct LibraryFile {
    #[serde(default)]
    templates: TemplatesSection,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TemplatesSection {
    List(Vec<Template>),
    Map(HashMap<String, Template>),
}

impl Default for TemplatesSection {
    fn default() -> Self {
        TemplatesSection::List(Vec::new())
    }
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single YAML library document and merge it in.
    pub fn merge_yaml(&mut self, text: &str) -> Result<usize> {
        let file: LibraryFile =
            serde_yaml::from_str(text).context("failed to parse template library")?;

        let templates = match file.templates {
            TemplatesSection::List(list) => list,
            TemplatesSection::Map(map) => map
                .into_iter()
                .map(|(key, mut template)| {
                    if template.id.is_empty() {
                        template.id = key;
                    }
                    template
                })
                .collect(),
        };

        let mut added = 0;
        for template in templates {
            if template.id.is_empty() {
                debug!("Skipping template without id: {}", template.description);
                continue;
            }
            self.insert(template);
            added += 1;
        }
        Ok(added)
    }

    pub fn merge_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let text = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read template library {}", path.as_ref().display())
        })?;
        self.merge_yaml(&text)
    }

    /// Insert a template; an existing id is replaced (last loaded wins).
    pub fn insert(&mut self, template: Template) {
        if let Some(&index) = self.by_id.get(&template.id) {
            self.templates[index] = template;
        } else {
            self.by_id
                .insert(template.id.clone(), self.templates.len());
            self.templates.push(template);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.by_id.get(id).map(|&index| &self.templates[index])
    }

    pub fn all(&self) -> &[Template] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Assemble the text a template is embedded under: description, examples,
/// tags, parameter names with underscores spaced, semantic tags, and the
/// primary entity's vocabulary synonyms when a domain config is supplied.
pub fn embedding_text(template: &Template, domain: Option<&DomainConfig>) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !template.description.is_empty() {
        parts.push(template.description.clone());
    }
    if !template.nl_examples.is_empty() {
        parts.push(template.nl_examples.join(" "));
    }
    if !template.tags.is_empty() {
        parts.push(template.tags.join(" "));
    }

    for parameter in &template.parameters {
        parts.push(parameter.name.replace('_', " "));
    }

    if let Some(tags) = &template.semantic_tags {
        if let Some(action) = &tags.action {
            parts.push(action.clone());
        }
        if let Some(primary) = &tags.primary_entity {
            parts.push(primary.clone());
            if let Some(domain) = domain {
                for synonym in domain.entity_synonyms(primary) {
                    parts.push(synonym.clone());
                }
            }
        }
        if let Some(secondary) = &tags.secondary_entity {
            parts.push(secondary.clone());
        }
        for qualifier in &tags.qualifiers {
            parts.push(qualifier.clone());
        }
    }

    parts.retain(|part| !part.trim().is_empty());
    parts.join(" ")
}

/// Flat metadata stored alongside a template's embedding in the store.
pub fn template_metadata(template: &Template) -> serde_json::Map<String, Value> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("template_id".to_string(), Value::String(template.id.clone()));
    metadata.insert(
        "description".to_string(),
        Value::String(template.description.clone()),
    );
    metadata.insert(
        "category".to_string(),
        Value::String(
            template
                .category
                .clone()
                .unwrap_or_else(|| "general".to_string()),
        ),
    );
    if let Some(tags) = &template.semantic_tags {
        if let Some(action) = &tags.action {
            metadata.insert("semantic_action".to_string(), Value::String(action.clone()));
        }
        if let Some(primary) = &tags.primary_entity {
            metadata.insert(
                "semantic_primary_entity".to_string(),
                Value::String(primary.clone()),
            );
        }
        if let Some(secondary) = &tags.secondary_entity {
            metadata.insert(
                "semantic_secondary_entity".to_string(),
                Value::String(secondary.clone()),
            );
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LIST_LIBRARY: &str = r#"
templates:
  - id: orders_by_customer
    description: Find orders for a customer by name
    nl_examples:
      - "orders from John Smith"
      - "show me orders for Jane Doe"
    tags: [orders, customer]
    semantic_tags:
      action: find
      primary_entity: customer
      secondary_entity: order
      qualifiers: [recent]
    parameters:
      - name: customer_name
        type: string
        required: true
    sql_template: "SELECT id, total FROM orders WHERE name LIKE {{ customer_name }}"
"#;

    const MAP_LIBRARY: &str = r#"
templates:
  refund_status:
    description: Check refund status
    result_format: summary
"#;

    #[test]
    fn test_list_form_parsing() -> Result<()> {
        let mut library = TemplateLibrary::new();
        assert_eq!(library.merge_yaml(LIST_LIBRARY)?, 1);

        let template = library.get("orders_by_customer").expect("template loaded");
        assert_eq!(template.parameters.len(), 1);
        assert_eq!(template.parameters[0].type_name(), "string");
        assert!(template.parameters[0].required);
        assert_eq!(template.result_format, "table");
        Ok(())
    }

    #[test]
    fn test_map_form_uses_key_as_fallback_id() -> Result<()> {
        let mut library = TemplateLibrary::new();
        library.merge_yaml(MAP_LIBRARY)?;
        let template = library.get("refund_status").expect("template loaded");
        assert_eq!(template.result_format, "summary");
        Ok(())
    }

    #[test]
    fn test_merge_last_id_wins() -> Result<()> {
        let mut library = TemplateLibrary::new();
        library.merge_yaml(LIST_LIBRARY)?;
        library.merge_yaml(
            r#"
templates:
  - id: orders_by_customer
    description: Replacement description
"#,
        )?;
        assert_eq!(library.len(), 1);
        assert_eq!(
            library.get("orders_by_customer").unwrap().description,
            "Replacement description"
        );
        Ok(())
    }

    #[test]
    fn test_embedding_text_contains_all_parts() -> Result<()> {
        let mut library = TemplateLibrary::new();
        library.merge_yaml(LIST_LIBRARY)?;
        let template = library.get("orders_by_customer").unwrap();

        let text = embedding_text(template, None);
        assert!(text.contains("Find orders for a customer by name"));
        assert!(text.contains("orders from John Smith"));
        assert!(text.contains("customer name"));
        assert!(text.contains("find"));
        assert!(text.contains("recent"));
        Ok(())
    }

    #[test]
    fn test_template_metadata_shape() -> Result<()> {
        let mut library = TemplateLibrary::new();
        library.merge_yaml(LIST_LIBRARY)?;
        let metadata = template_metadata(library.get("orders_by_customer").unwrap());
        assert_eq!(
            metadata.get("template_id").and_then(Value::as_str),
            Some("orders_by_customer")
        );
        assert_eq!(
            metadata.get("semantic_primary_entity").and_then(Value::as_str),
            Some("customer")
        );
        Ok(())
    }
}
