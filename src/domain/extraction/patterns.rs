// Regex pattern construction for domain field extraction
// Patterns are compiled once per domain from field metadata and keyed by
// `entity.field` (range variants get an `_range` suffix).

use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

use crate::domain::{DomainConfig, FieldConfig};

/// Builds and holds the compiled extraction patterns for a domain.
pub struct PatternBuilder {
    patterns: HashMap<String, Regex>,
}

impl PatternBuilder {
    /// Compile all patterns for searchable/filterable fields in the domain.
    pub fn build(domain: &DomainConfig) -> Self {
        let mut patterns = HashMap::new();

        for (entity_name, entity) in &domain.entities {
            for (field_name, field) in &entity.fields {
                if !(field.searchable || field.filterable) {
                    continue;
                }
                let key = format!("{entity_name}.{field_name}");
                if let Some(pattern) = build_field_pattern(domain, entity_name, field) {
                    patterns.insert(key.clone(), pattern);
                }
                if matches!(field.data_type.as_str(), "integer" | "decimal") {
                    if let Some(range) = build_range_pattern(field) {
                        patterns.insert(format!("{key}_range"), range);
                    }
                }
            }
        }

        debug!("Compiled {} extraction patterns", patterns.len());
        Self { patterns }
    }

    pub fn get(&self, entity_name: &str, field_name: &str) -> Option<&Regex> {
        self.patterns.get(&format!("{entity_name}.{field_name}"))
    }

    pub fn get_range(&self, entity_name: &str, field_name: &str) -> Option<&Regex> {
        self.patterns
            .get(&format!("{entity_name}.{field_name}_range"))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn build_field_pattern(
    domain: &DomainConfig,
    entity_name: &str,
    field: &FieldConfig,
) -> Option<Regex> {
    let field_lower = field.name.to_lowercase();

    if field.data_type == "integer" && field_lower.contains("id") {
        return build_id_pattern(domain, entity_name);
    }
    if field.data_type == "string" && field.name == "email" {
        return compile(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b");
    }
    if field.data_type == "decimal" {
        return compile(r"\$?\s*(\d{1,3}(?:,\d{3})*(?:\.\d{1,2})?)");
    }
    if field.data_type == "integer" {
        return compile(r"\$?\s*(\d{1,3}(?:,\d{3})*)");
    }
    if field.data_type == "date" {
        return compile(r"(\d{4}-\d{2}-\d{2})|(\d{2}/\d{2}/\d{4})|(\d{2}-\d{2}-\d{4})");
    }
    if field.data_type == "string" && field_lower.contains("phone") {
        return compile(
            r"(\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4})|(\+?1?\s*\d{3}[-.\s]?\d{3}[-.\s]?\d{4})",
        );
    }

    None
}

/// `(entity|synonym...)\s*(?:id\s*)?(?:#|number|id)?\s*(\d+)`
fn build_id_pattern(domain: &DomainConfig, entity_name: &str) -> Option<Regex> {
    let mut names: Vec<String> = vec![regex::escape(entity_name)];
    for synonym in domain.entity_synonyms(entity_name) {
        names.push(regex::escape(synonym));
    }
    let alternatives = names.join("|");
    compile(&format!(
        r"({alternatives})\s*(?:id\s*)?(?:#|number|id)?\s*(\d+)"
    ))
}

fn build_range_pattern(field: &FieldConfig) -> Option<Regex> {
    let number = if field.data_type == "decimal" {
        r"(\d{1,3}(?:,\d{3})*(?:\.\d{1,2})?)"
    } else {
        r"(\d{1,3}(?:,\d{3})*)"
    };
    compile(&format!(
        r"between\s*\$?\s*{number}\s*and\s*\$?\s*{number}"
    ))
}

fn compile(pattern: &str) -> Option<Regex> {
    match regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
    {
        Ok(regex) => Some(regex),
        Err(error) => {
            debug!("Invalid extraction pattern '{pattern}' skipped: {error}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_fixtures::customer_order_domain;

    #[test]
    fn test_patterns_compiled_for_searchable_fields() {
        let domain = customer_order_domain();
        let builder = PatternBuilder::build(&domain);

        assert!(builder.get("customer", "id").is_some());
        assert!(builder.get("customer", "email").is_some());
        assert!(builder.get("order", "total").is_some());
        assert!(builder.get_range("order", "total").is_some());
        // name is a plain string with no dedicated pattern shape
        assert!(builder.get("customer", "name").is_none());
    }

    #[test]
    fn test_id_pattern_matches_entity_and_synonyms() {
        let domain = customer_order_domain();
        let builder = PatternBuilder::build(&domain);
        let pattern = builder.get("customer", "id").unwrap();

        let capture = pattern.captures("show customer #42 please").unwrap();
        assert_eq!(capture.get(2).unwrap().as_str(), "42");

        let capture = pattern.captures("details for client 7").unwrap();
        assert_eq!(capture.get(2).unwrap().as_str(), "7");
    }

    #[test]
    fn test_range_pattern() {
        let domain = customer_order_domain();
        let builder = PatternBuilder::build(&domain);
        let pattern = builder.get_range("order", "total").unwrap();

        let capture = pattern
            .captures("orders between $1,000 and $2,500.50")
            .unwrap();
        assert_eq!(capture.get(1).unwrap().as_str(), "1,000");
        assert_eq!(capture.get(2).unwrap().as_str(), "2,500.50");
    }
}
