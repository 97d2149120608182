// Value extraction from user queries
// Applies compiled patterns, range patterns, strategy hooks, and context
// clues (field synonyms) in order, then parses matches into typed values.

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::patterns::PatternBuilder;
use crate::domain::strategy::DomainStrategy;
use crate::domain::DomainConfig;
use crate::templates::TemplateParameter;

/// Extracts typed values from user queries using domain patterns.
pub struct ValueExtractor {
    domain: Arc<DomainConfig>,
    patterns: Arc<PatternBuilder>,
    strategy: Arc<dyn DomainStrategy>,
}

impl ValueExtractor {
    pub fn new(
        domain: Arc<DomainConfig>,
        patterns: Arc<PatternBuilder>,
        strategy: Arc<dyn DomainStrategy>,
    ) -> Self {
        Self {
            domain,
            patterns,
            strategy,
        }
    }

    /// Extract a value for a specific entity field from the query.
    pub fn extract_value(
        &self,
        query: &str,
        entity_name: &str,
        field_name: &str,
        data_type: &str,
    ) -> Option<Value> {
        // Ranges first: a bare numeric pattern would otherwise swallow the
        // lower bound of a "between X and Y" phrase
        if matches!(data_type, "integer" | "decimal") {
            if let Some(range) = self.extract_range(query, entity_name, field_name, data_type) {
                return Some(range);
            }
        }

        if let Some(pattern) = self.patterns.get(entity_name, field_name) {
            if let Some(value) = extract_with_pattern(query, pattern, data_type) {
                return Some(value);
            }
        }

        let param_context = self.field_param_context(entity_name, field_name, data_type);
        if let Some(value) = self
            .strategy
            .extract_domain_parameters(query, &param_context, &self.domain)
        {
            return Some(value);
        }

        self.extract_from_context(query, entity_name, field_name, data_type)
    }

    /// Extract `{min, max}` for a numeric field from a `between X and Y` phrase.
    fn extract_range(
        &self,
        query: &str,
        entity_name: &str,
        field_name: &str,
        data_type: &str,
    ) -> Option<Value> {
        let pattern = self.patterns.get_range(entity_name, field_name)?;
        let captures = pattern.captures(query)?;
        let min = parse_value(captures.get(1)?.as_str(), data_type)?;
        let max = parse_value(captures.get(2)?.as_str(), data_type)?;
        Some(json!({ "min": min, "max": max }))
    }

    /// Context-based extraction: `<synonym>[:=] value` or
    /// `<synonym> (is|equals?|of) value`.
    fn extract_from_context(
        &self,
        query: &str,
        entity_name: &str,
        field_name: &str,
        data_type: &str,
    ) -> Option<Value> {
        self.domain.field(entity_name, field_name)?;

        let mut terms = vec![field_name.to_string()];
        terms.extend(self.domain.field_synonyms(field_name).iter().cloned());

        for term in terms {
            let escaped = regex::escape(&term);
            let context_patterns = [
                format!(r"{escaped}\s*[:=]\s*([^\s,]+)"),
                format!(r"{escaped}\s+(?:is|equals?|of)\s+([^\s,]+)"),
            ];
            for pattern_str in &context_patterns {
                let Ok(pattern) = Regex::new(&format!("(?i){pattern_str}")) else {
                    continue;
                };
                if let Some(captures) = pattern.captures(query) {
                    if let Some(value) = parse_value(captures.get(1)?.as_str(), data_type) {
                        return Some(value);
                    }
                }
            }
        }

        None
    }

    /// Extract every possible `entity.field` value from the query in one pass.
    pub fn extract_all_values(&self, query: &str) -> std::collections::HashMap<String, Value> {
        let mut extracted = std::collections::HashMap::new();

        for (entity_name, entity) in &self.domain.entities {
            for (field_name, field) in &entity.fields {
                if !(field.searchable || field.filterable) {
                    continue;
                }
                if let Some(value) =
                    self.extract_value(query, entity_name, field_name, &field.data_type)
                {
                    extracted.insert(format!("{entity_name}.{field_name}"), value);
                }
            }
        }

        extracted
    }

    /// Extract a template parameter: the strategy first, then generic
    /// fallbacks for dates, enums, emails, and names.
    pub fn extract_template_parameter(
        &self,
        query: &str,
        parameter: &TemplateParameter,
    ) -> Option<Value> {
        if let Some(value) = self
            .strategy
            .extract_domain_parameters(query, parameter, &self.domain)
        {
            return Some(value);
        }
        extract_generic_parameter(query, parameter)
    }

    fn field_param_context(
        &self,
        entity_name: &str,
        field_name: &str,
        data_type: &str,
    ) -> TemplateParameter {
        let mut parameter = TemplateParameter {
            name: field_name.to_string(),
            data_type: Some(data_type.to_string()),
            entity: Some(entity_name.to_string()),
            field: Some(field_name.to_string()),
            ..Default::default()
        };
        if let Some(field) = self.domain.field(entity_name, field_name) {
            parameter.semantic_type = field.semantic_type.clone();
            if !field.extraction_hints.is_empty() {
                parameter.extraction_hints =
                    serde_json::to_value(&field.extraction_hints).ok();
            }
        }
        parameter
    }
}

/// Apply a compiled pattern; the last capture group carries the value.
pub fn extract_with_pattern(text: &str, pattern: &Regex, data_type: &str) -> Option<Value> {
    let captures = pattern.captures(text)?;
    let value_str = captures
        .iter()
        .skip(1)
        .flatten()
        .last()
        .map(|m| m.as_str())
        .unwrap_or_else(|| captures.get(0).map(|m| m.as_str()).unwrap_or(""));
    parse_value(value_str, data_type)
}

/// Generic extraction for common parameter shapes without domain metadata.
pub fn extract_generic_parameter(query: &str, parameter: &TemplateParameter) -> Option<Value> {
    let param_type = parameter.type_name();
    let name_lower = parameter.name.to_lowercase();

    if param_type == "date" {
        let date_patterns = [
            r"(\d{4}-\d{2}-\d{2})",
            r"(\d{2}/\d{2}/\d{4})",
            r"(\d{2}-\d{2}-\d{4})",
            r"((?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+\d{1,2}(?:st|nd|rd|th)?,?\s*\d{4})",
        ];
        for pattern_str in date_patterns {
            let Ok(pattern) = Regex::new(&format!("(?i){pattern_str}")) else {
                continue;
            };
            if let Some(m) = pattern.find(query) {
                return parse_value(m.as_str(), "date");
            }
        }
    }

    if param_type == "enum" && !parameter.allowed_values.is_empty() {
        let query_lower = query.to_lowercase();
        for allowed in &parameter.allowed_values {
            if query_lower.contains(&allowed.to_lowercase()) {
                return Some(Value::String(allowed.clone()));
            }
        }
    }

    if param_type == "string" {
        if name_lower.contains("email") {
            let pattern =
                Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").ok()?;
            if let Some(m) = pattern.find(query) {
                return Some(Value::String(m.as_str().to_string()));
            }
        }

        if name_lower.contains("name") {
            let quoted = Regex::new(r#""([^"]+)""#).ok()?;
            if let Some(captures) = quoted.captures(query) {
                return Some(Value::String(captures.get(1)?.as_str().to_string()));
            }
            // Consecutive capitalized words are the usual shape of a name
            let capitalized = Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").ok()?;
            if let Some(captures) = capitalized.captures(query) {
                return Some(Value::String(captures.get(1)?.as_str().to_string()));
            }
        }
    }

    None
}

/// Parse a matched string into the declared data type. Integers and decimals
/// strip `$` and `,`; dates normalize to ISO; strings trim whitespace and
/// matching outer quotes.
pub fn parse_value(value_str: &str, data_type: &str) -> Option<Value> {
    let trimmed = value_str.trim();
    if trimmed.is_empty() {
        return None;
    }

    match data_type.to_lowercase().as_str() {
        "integer" | "int" => {
            let clean = trimmed.replace(['$', ','], "");
            clean.trim().parse::<i64>().ok().map(Value::from)
        }
        "decimal" | "float" | "number" => {
            let clean = trimmed.replace(['$', ','], "");
            clean.trim().parse::<f64>().ok().map(Value::from)
        }
        "date" | "datetime" => Some(Value::String(
            parse_date(trimmed).unwrap_or_else(|| trimmed.to_string()),
        )),
        "boolean" | "bool" => parse_boolean(trimmed).map(Value::from),
        _ => {
            let mut clean = trimmed.to_string();
            if clean.len() >= 2 {
                let bytes = clean.as_bytes();
                let first = bytes[0] as char;
                let last = bytes[clean.len() - 1] as char;
                if first == last && (first == '"' || first == '\'') {
                    clean = clean[1..clean.len() - 1].to_string();
                }
            }
            Some(Value::String(clean))
        }
    }
}

/// Normalize a date string to `YYYY-MM-DD`. Accepts ISO, US, European, and
/// month-name forms; ambiguous day/month input resolves in listed order.
pub fn parse_date(date_str: &str) -> Option<String> {
    let cleaned = {
        let no_commas = date_str.replace(',', "");
        let pattern = Regex::new(r"(?i)(\d+)(st|nd|rd|th)").ok()?;
        pattern.replace_all(&no_commas, "$1").to_string()
    };

    let formats = [
        "%Y-%m-%d",
        "%m/%d/%Y",
        "%d-%m-%Y",
        "%d/%m/%Y",
        "%m-%d-%Y",
        "%B %d %Y",
        "%b %d %Y",
    ];

    for format in formats {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned.trim(), format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }

    debug!("Failed to normalize date '{date_str}'");
    None
}

pub fn parse_boolean(value_str: &str) -> Option<bool> {
    match value_str.to_lowercase().trim() {
        "true" | "yes" | "1" | "active" | "enabled" => Some(true),
        "false" | "no" | "0" | "inactive" | "disabled" => Some(false),
        _ => None,
    }
}
