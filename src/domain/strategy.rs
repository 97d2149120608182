// Domain strategies
// A strategy contributes domain-specific behavior to reranking, parameter
// extraction, and summary field prioritization. The generic strategy is
// driven entirely by `semantic_types` and `extraction_hints` metadata, so a
// new domain needs configuration, not code.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use super::extraction::values::parse_value;
use super::{DomainConfig, ExtractionHints, FieldConfig};
use crate::templates::{Template, TemplateParameter};

/// Capability set a domain strategy provides.
pub trait DomainStrategy: Send + Sync {
    /// Names (domain_name, domain_type, aliases) this strategy answers to.
    fn domain_names(&self) -> Vec<String>;

    /// Similarity boost for a template given the query, in [-0.3, 0.3].
    fn calculate_domain_boost(&self, template: &Template, query: &str) -> f32;

    /// Extract a parameter value using domain-specific knowledge.
    fn extract_domain_parameters(
        &self,
        query: &str,
        parameter: &TemplateParameter,
        domain: &DomainConfig,
    ) -> Option<Value>;

    /// Summary priority for a field, or 0 when the strategy has no opinion.
    fn summary_field_priority(&self, field_name: &str, field: Option<&FieldConfig>) -> i32;
}

/// Generic strategy built from declarative semantic metadata.
pub struct GenericDomainStrategy {
    domain: Arc<DomainConfig>,
    semantic_extractors: HashMap<String, SemanticExtractor>,
}

struct SemanticExtractor {
    regexes: Vec<Regex>,
    simple_patterns: Vec<String>,
    value_group: usize,
}

impl GenericDomainStrategy {
    pub fn new(domain: Arc<DomainConfig>) -> Self {
        let mut semantic_extractors = HashMap::new();

        for (semantic_type, config) in &domain.semantic_types {
            if let Some(extractor) = SemanticExtractor::from_config(config) {
                semantic_extractors.insert(semantic_type.clone(), extractor);
            }
        }

        Self {
            domain,
            semantic_extractors,
        }
    }

    fn extract_with_hints(
        &self,
        query: &str,
        hints: &ExtractionHints,
        param_type: &str,
    ) -> Option<Value> {
        for regex_pattern in &hints.regex_patterns {
            let Ok(regex) = Regex::new(&format!("(?i){regex_pattern}")) else {
                debug!("Invalid hint regex '{regex_pattern}' skipped");
                continue;
            };
            if let Some(captures) = regex.captures(query) {
                let value_str = captures
                    .get(hints.value_group)
                    .or_else(|| captures.get(0))
                    .map(|m| m.as_str())?;
                return parse_value(value_str, param_type);
            }
        }

        for pattern in &hints.patterns {
            let escaped = regex::escape(pattern);
            let Ok(regex) = Regex::new(&format!(r"(?i)\b{escaped}\b\s*[:=]?\s*([^\s,]+)")) else {
                continue;
            };
            if let Some(captures) = regex.captures(query) {
                return parse_value(captures.get(1)?.as_str(), param_type);
            }
        }

        if hints.look_for_quotes {
            let double = Regex::new(r#""([^"]+)""#).ok()?;
            let single = Regex::new(r"'([^']+)'").ok()?;
            let quoted = double.captures(query).or_else(|| single.captures(query));
            if let Some(captures) = quoted {
                if let Some(value) = parse_value(captures.get(1)?.as_str(), param_type) {
                    return Some(value);
                }
            }
        }

        if hints.capitalization_required {
            let capitalized = Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").ok()?;
            if let Some(captures) = capitalized.captures(query) {
                if let Some(value) = parse_value(captures.get(1)?.as_str(), param_type) {
                    return Some(value);
                }
            }
        }

        if hints.numeric_required {
            let numeric = Regex::new(r"\b\d+[\d,]*\b").ok()?;
            if let Some(m) = numeric.find(query) {
                return parse_value(m.as_str(), param_type);
            }
        }

        let query_lower = query.to_lowercase();
        for term in &hints.relative_terms {
            if query_lower.contains(&term.to_lowercase()) {
                return Some(Value::String(term.clone()));
            }
        }

        for format in &hints.formats {
            if let Some(matched) = find_formatted_value(query, format) {
                if let Some(value) = parse_value(&matched, param_type) {
                    return Some(value);
                }
            }
        }

        None
    }
}

impl SemanticExtractor {
    fn from_config(config: &Value) -> Option<Self> {
        let object = config.as_object()?;

        let regexes = object
            .get("regex_patterns")
            .and_then(Value::as_array)
            .map(|patterns| {
                patterns
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|pattern| {
                        match Regex::new(&format!("(?i){pattern}")) {
                            Ok(regex) => Some(regex),
                            Err(error) => {
                                debug!("Invalid semantic regex '{pattern}' skipped: {error}");
                                None
                            }
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let simple_patterns = object
            .get("patterns")
            .and_then(Value::as_array)
            .map(|patterns| {
                patterns
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let value_group = object
            .get("value_group")
            .or_else(|| object.get("capture_group"))
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;

        Some(Self {
            regexes,
            simple_patterns,
            value_group,
        })
    }

    fn extract(&self, query: &str, param_type: &str) -> Option<Value> {
        for regex in &self.regexes {
            if let Some(captures) = regex.captures(query) {
                let value_str = captures
                    .get(self.value_group)
                    .or_else(|| captures.get(0))
                    .map(|m| m.as_str())?;
                return parse_value(value_str, param_type);
            }
        }

        for pattern in &self.simple_patterns {
            let escaped = regex::escape(pattern);
            let Ok(regex) = Regex::new(&format!(r"(?i)\b{escaped}\b\s*[:=]?\s*([^\s,]+)")) else {
                continue;
            };
            if let Some(captures) = regex.captures(query) {
                return parse_value(captures.get(1)?.as_str(), param_type);
            }
        }

        None
    }
}

impl DomainStrategy for GenericDomainStrategy {
    fn domain_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if !self.domain.domain_name.is_empty() && self.domain.domain_name != "unknown" {
            names.push(self.domain.domain_name.clone());
        }
        if !self.domain.domain_type.is_empty() {
            names.push(self.domain.domain_type.clone());
        }
        names.push("generic".to_string());
        names.dedup();
        names
    }

    fn calculate_domain_boost(&self, _template: &Template, _query: &str) -> f32 {
        // The generic strategy applies no custom boosts
        0.0
    }

    fn extract_domain_parameters(
        &self,
        query: &str,
        parameter: &TemplateParameter,
        domain: &DomainConfig,
    ) -> Option<Value> {
        let param_type = parameter.type_name();

        let field = match (&parameter.entity, &parameter.field) {
            (Some(entity), Some(field)) => domain.field(entity, field),
            _ => None,
        };

        let semantic_type = parameter
            .semantic_type
            .clone()
            .or_else(|| field.and_then(|f| f.semantic_type.clone()));

        if let Some(semantic_type) = semantic_type {
            if let Some(extractor) = self.semantic_extractors.get(&semantic_type) {
                if let Some(value) = extractor.extract(query, param_type) {
                    return Some(value);
                }
            }
        }

        if let Some(pattern) = field.and_then(|f| f.extraction_pattern.as_deref()) {
            if let Ok(regex) = Regex::new(&format!("(?i){pattern}")) {
                if let Some(captures) = regex.captures(query) {
                    let value_str = captures
                        .get(1)
                        .or_else(|| captures.get(0))
                        .map(|m| m.as_str())?;
                    if let Some(value) = parse_value(value_str, param_type) {
                        return Some(value);
                    }
                }
            }
        }

        let hints = parameter
            .extraction_hints
            .as_ref()
            .map(ExtractionHints::from_value)
            .or_else(|| field.map(|f| f.extraction_hints.clone()));

        if let Some(hints) = hints {
            if !hints.is_empty() {
                return self.extract_with_hints(query, &hints, param_type);
            }
        }

        None
    }

    fn summary_field_priority(&self, field_name: &str, field: Option<&FieldConfig>) -> i32 {
        if let Some(priority) = field.and_then(|f| f.summary_priority) {
            return priority;
        }

        if let Some(semantic) = field.and_then(|f| f.semantic_type.as_deref()) {
            let semantic_lower = semantic.to_lowercase();
            let defaults = [
                ("identifier", 90),
                ("name", 85),
                ("status", 80),
                ("amount", 75),
                ("total", 75),
                ("date", 70),
                ("email", 65),
                ("description", 60),
            ];
            for (key, priority) in defaults {
                if semantic_lower.contains(key) {
                    return priority;
                }
            }
        }

        let field_lower = field_name.to_lowercase();
        if field_lower.contains("id") {
            return 50;
        }
        if field_lower.contains("name") {
            return 45;
        }
        if field_lower.contains("date") || field_lower.contains("time") {
            return 35;
        }
        if field_lower.contains("status") {
            return 30;
        }

        0
    }
}

fn find_formatted_value(query: &str, format: &str) -> Option<String> {
    let pattern = match format {
        "YYYY-MM-DD" => r"\b\d{4}-\d{2}-\d{2}\b",
        "DD-MM-YYYY" => r"\b\d{2}-\d{2}-\d{4}\b",
        "MM/DD/YYYY" => r"\b\d{2}/\d{2}/\d{4}\b",
        "Month DD, YYYY" => {
            r"\b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}\b"
        }
        _ => return None,
    };
    Regex::new(pattern)
        .ok()?
        .find(query)
        .map(|m| m.as_str().to_string())
}

type StrategyFactory = Arc<dyn Fn(Arc<DomainConfig>) -> Arc<dyn DomainStrategy> + Send + Sync>;

/// Registry resolving a strategy by `domain_name`, then `domain_type`, then
/// custom registration, falling back to the generic strategy.
#[derive(Default)]
pub struct DomainStrategyRegistry {
    custom: RwLock<HashMap<String, StrategyFactory>>,
}

impl DomainStrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: StrategyFactory) {
        info!("Registered domain strategy: {name}");
        self.custom
            .write()
            .expect("strategy registry poisoned")
            .insert(name.to_lowercase(), factory);
    }

    pub fn get_strategy(&self, domain: Arc<DomainConfig>) -> Arc<dyn DomainStrategy> {
        let custom = self.custom.read().expect("strategy registry poisoned");

        for key in [&domain.domain_name, &domain.domain_type] {
            if let Some(factory) = custom.get(&key.to_lowercase()) {
                debug!("Selected custom domain strategy for '{key}'");
                return factory(domain.clone());
            }
        }

        Arc::new(GenericDomainStrategy::new(domain))
    }
}
