// Domain configuration for the intent pipeline
// A domain is described entirely by data: entities, fields, vocabulary, and
// semantic types. Extraction, validation, and response formatting are driven
// from this metadata without code changes per domain.

pub mod extraction;
pub mod response;
pub mod strategy;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Configuration for a domain field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub display_format: Option<String>,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub sortable: bool,
    #[serde(default)]
    pub aggregatable: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub validation_rules: ValidationRules,
    #[serde(default)]
    pub semantic_type: Option<String>,
    #[serde(default)]
    pub summary_priority: Option<i32>,
    #[serde(default)]
    pub extraction_pattern: Option<String>,
    #[serde(default)]
    pub extraction_hints: ExtractionHints,
}

fn default_data_type() -> String {
    "string".to_string()
}

/// Declarative validation rules applied to extracted parameter values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub pattern_description: Option<String>,
    #[serde(default)]
    pub allowed_values: Vec<Value>,
    #[serde(default)]
    pub required: bool,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self.min.is_none()
            && self.max.is_none()
            && self.min_length.is_none()
            && self.max_length.is_none()
            && self.pattern.is_none()
            && self.allowed_values.is_empty()
            && !self.required
    }
}

/// Hints that drive metadata-only extraction for a field or parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionHints {
    #[serde(default)]
    pub regex_patterns: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub relative_terms: Vec<String>,
    #[serde(default)]
    pub decimal_places: Option<u32>,
    #[serde(default = "default_value_group")]
    pub value_group: usize,
    #[serde(default)]
    pub look_for_quotes: bool,
    #[serde(default)]
    pub capitalization_required: bool,
    #[serde(default)]
    pub numeric_required: bool,
}

fn default_value_group() -> usize {
    1
}

impl ExtractionHints {
    pub fn is_empty(&self) -> bool {
        self.regex_patterns.is_empty()
            && self.patterns.is_empty()
            && self.formats.is_empty()
            && self.relative_terms.is_empty()
            && !self.look_for_quotes
            && !self.capitalization_required
            && !self.numeric_required
    }

    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Configuration for a domain entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub display_name_field: Option<String>,
    #[serde(default)]
    pub relationships: HashMap<String, Value>,
    #[serde(default)]
    pub searchable_fields: Vec<String>,
    #[serde(default)]
    pub common_filters: Vec<String>,
    #[serde(default)]
    pub default_sort_field: Option<String>,
    #[serde(default)]
    pub default_sort_order: Option<String>,
    #[serde(skip)]
    pub fields: HashMap<String, FieldConfig>,
}

/// Vocabulary: synonyms for entities and fields, plus action verbs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vocabulary {
    #[serde(default)]
    pub entity_synonyms: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub field_synonyms: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub action_verbs: HashMap<String, Vec<String>>,
}

/// Wire form of the domain YAML document.
#[derive(Debug, Clone, Default, Deserialize)]
struct DomainFile {
    #[serde(default)]
    domain_name: String,
    #[serde(default = "default_domain_type")]
    domain_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    entities: HashMap<String, EntityConfig>,
    #[serde(default)]
    fields: HashMap<String, HashMap<String, FieldConfig>>,
    #[serde(default)]
    vocabulary: Vocabulary,
    #[serde(default)]
    metrics: HashMap<String, Value>,
    #[serde(default)]
    aggregations: HashMap<String, Value>,
    #[serde(default)]
    business_rules: HashMap<String, Value>,
    #[serde(default)]
    semantic_types: HashMap<String, Value>,
}

fn default_domain_type() -> String {
    "generic".to_string()
}

/// Centralized domain configuration with unified access to metadata.
/// Entity insertion order is preserved for the primary-entity fallback.
#[derive(Debug, Clone, Default)]
pub struct DomainConfig {
    pub domain_name: String,
    pub domain_type: String,
    pub description: String,
    pub entities: HashMap<String, EntityConfig>,
    pub entity_order: Vec<String>,
    pub vocabulary: Vocabulary,
    pub metrics: HashMap<String, Value>,
    pub aggregations: HashMap<String, Value>,
    pub business_rules: HashMap<String, Value>,
    pub semantic_types: HashMap<String, Value>,
}

impl DomainConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: DomainFile =
            serde_yaml::from_str(text).context("failed to parse domain config")?;
        Ok(Self::from_file_form(file, text))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read domain config {}", path.as_ref().display()))?;
        Self::from_yaml(&text)
    }

    fn from_file_form(file: DomainFile, raw: &str) -> Self {
        // Entity order follows the document order of the `entities` map.
        let entity_order = entity_order_from_yaml(raw, &file.entities);

        let mut entities = file.entities;
        for (entity_name, entity) in entities.iter_mut() {
            entity.name = entity_name.clone();
            if let Some(entity_fields) = file.fields.get(entity_name) {
                for (field_name, field) in entity_fields {
                    let mut field = field.clone();
                    field.name = field_name.clone();
                    entity.fields.insert(field_name.clone(), field);
                }
            }
        }

        Self {
            domain_name: if file.domain_name.is_empty() {
                "unknown".to_string()
            } else {
                file.domain_name
            },
            domain_type: file.domain_type,
            description: file.description,
            entities,
            entity_order,
            vocabulary: file.vocabulary,
            metrics: file.metrics,
            aggregations: file.aggregations,
            business_rules: file.business_rules,
            semantic_types: file.semantic_types,
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.get(name)
    }

    pub fn field(&self, entity_name: &str, field_name: &str) -> Option<&FieldConfig> {
        self.entities
            .get(entity_name)
            .and_then(|entity| entity.fields.get(field_name))
    }

    /// Find a field configuration by name across all entities.
    pub fn find_field(&self, field_name: &str) -> Option<&FieldConfig> {
        self.entities
            .values()
            .find_map(|entity| entity.fields.get(field_name))
    }

    pub fn entity_synonyms(&self, entity_name: &str) -> &[String] {
        self.vocabulary
            .entity_synonyms
            .get(entity_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn field_synonyms(&self, field_name: &str) -> &[String] {
        self.vocabulary
            .field_synonyms
            .get(field_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn action_synonyms(&self, action: &str) -> &[String] {
        self.vocabulary
            .action_verbs
            .get(action)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The entity marked `entity_type: primary`, or the first declared one.
    pub fn primary_entity(&self) -> Option<&EntityConfig> {
        self.entities
            .values()
            .find(|entity| entity.entity_type.as_deref() == Some("primary"))
            .or_else(|| {
                self.entity_order
                    .first()
                    .and_then(|name| self.entities.get(name))
            })
    }

    pub fn secondary_entities(&self) -> Vec<&EntityConfig> {
        let primary_name = self.primary_entity().map(|entity| entity.name.clone());
        self.entity_order
            .iter()
            .filter(|name| Some((*name).clone()) != primary_name)
            .filter_map(|name| self.entities.get(name))
            .collect()
    }

    pub fn searchable_fields(&self) -> Vec<&FieldConfig> {
        self.entities
            .values()
            .flat_map(|entity| entity.fields.values())
            .filter(|field| field.searchable)
            .collect()
    }

    pub fn filterable_fields(&self) -> Vec<&FieldConfig> {
        self.entities
            .values()
            .flat_map(|entity| entity.fields.values())
            .filter(|field| field.filterable)
            .collect()
    }
}

/// Recover entity declaration order from the raw YAML document, since serde
/// maps do not preserve it. Unknown names are appended at the end.
fn entity_order_from_yaml(raw: &str, entities: &HashMap<String, EntityConfig>) -> Vec<String> {
    let mut order = Vec::new();
    if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(raw) {
        if let Some(mapping) = value.get("entities").and_then(|e| e.as_mapping()) {
            for key in mapping.keys() {
                if let Some(name) = key.as_str() {
                    if entities.contains_key(name) {
                        order.push(name.to_string());
                    }
                }
            }
        }
    }
    for name in entities.keys() {
        if !order.contains(name) {
            order.push(name.clone());
        }
    }
    order
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub const CUSTOMER_ORDER_DOMAIN: &str = r#"
domain_name: customer_orders
domain_type: retail
description: Customers and their orders
entities:
  customer:
    entity_type: primary
    table_name: customers
    primary_key: id
    display_name_field: name
    searchable_fields: [name, email, city]
  order:
    entity_type: transaction
    table_name: orders
    primary_key: id
fields:
  customer:
    id:
      data_type: integer
      searchable: true
    name:
      data_type: string
      searchable: true
      semantic_type: person_name
      extraction_hints:
        look_for_quotes: true
        capitalization_required: true
    email:
      data_type: string
      searchable: true
    city:
      data_type: string
      filterable: true
  order:
    id:
      data_type: integer
      searchable: true
    total:
      data_type: decimal
      filterable: true
      display_format: currency
      aggregatable: true
    order_date:
      data_type: date
      filterable: true
      display_format: date
    status:
      data_type: string
      filterable: true
      validation_rules:
        allowed_values: [pending, shipped, delivered]
vocabulary:
  entity_synonyms:
    customer: [client, buyer, shopper]
    order: [purchase, transaction]
  field_synonyms:
    total: [amount, price]
    city: [location, town]
  action_verbs:
    find: [show, list, get]
semantic_types:
  person_name:
    regex_patterns:
      - "from\\s+([A-Z][a-z]+(?:\\s+[A-Z][a-z]+)+)"
    patterns: [customer, client]
"#;

    pub fn customer_order_domain() -> DomainConfig {
        DomainConfig::from_yaml(CUSTOMER_ORDER_DOMAIN).expect("fixture domain parses")
    }
}
