// Domain-aware parameter extraction
// Orchestrates pattern extraction, strategy hooks, context clues, the LLM
// fallback for missing required parameters, and declared defaults.

pub mod llm;
pub mod patterns;
pub mod validate;
pub mod values;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::contracts::Inference;
use crate::domain::strategy::DomainStrategy;
use crate::domain::DomainConfig;
use crate::templates::Template;

use llm::LlmFallback;
use patterns::PatternBuilder;
use validate::Validator;
use values::ValueExtractor;

/// Facade that fills `template.parameters` from a user query.
pub struct DomainParameterExtractor {
    domain: Arc<DomainConfig>,
    value_extractor: ValueExtractor,
    llm_fallback: LlmFallback,
    validator: Validator,
}

impl DomainParameterExtractor {
    pub fn new(
        inference: Arc<dyn Inference>,
        domain: Arc<DomainConfig>,
        strategy: Arc<dyn DomainStrategy>,
    ) -> Self {
        let patterns = Arc::new(PatternBuilder::build(&domain));
        debug!(
            "Initialized parameter extractor with {} patterns for domain '{}'",
            patterns.len(),
            domain.domain_name
        );

        Self {
            value_extractor: ValueExtractor::new(domain.clone(), patterns, strategy),
            llm_fallback: LlmFallback::new(inference, domain.clone()),
            validator: Validator::new(domain.clone()),
            domain,
        }
    }

    /// Extract parameters for a template.
    ///
    /// Pass one matches patterns and context; pass two asks the LLM for the
    /// still-missing required parameters (batched when two or more are
    /// missing); finally declared defaults fill remaining gaps.
    pub async fn extract_parameters(
        &self,
        query: &str,
        template: &Template,
    ) -> HashMap<String, Value> {
        let mut parameters: HashMap<String, Value> = HashMap::new();

        let extracted_values = self.value_extractor.extract_all_values(query);

        for parameter in &template.parameters {
            let data_type = parameter.type_name().to_string();

            let mut value = match (&parameter.entity, &parameter.field) {
                (Some(entity), Some(field)) => {
                    extracted_values.get(&format!("{entity}.{field}")).cloned()
                }
                _ => extracted_values.get(&parameter.name).cloned(),
            };

            if value.is_none() {
                if let (Some(entity), Some(field)) = (&parameter.entity, &parameter.field) {
                    value = self
                        .value_extractor
                        .extract_value(query, entity, field, &data_type);
                } else {
                    value = self
                        .value_extractor
                        .extract_template_parameter(query, parameter);
                }
            }

            let Some(value) = value else {
                continue;
            };

            if let (Some(entity), Some(field)) = (&parameter.entity, &parameter.field) {
                match self.validator.validate_field(&value, entity, field) {
                    Ok(()) => {
                        let sanitized = self.validator.sanitize(value, entity, field);
                        parameters.insert(parameter.name.clone(), sanitized);
                    }
                    Err(message) => {
                        debug!("Validation failed for {}: {message}", parameter.name);
                    }
                }
            } else {
                // Coerce to string for string-typed parameters extracted as
                // other JSON shapes
                let value = if data_type == "string" && !value.is_string() {
                    Value::String(values_to_text(&value))
                } else {
                    value
                };
                parameters.insert(parameter.name.clone(), value);
            }
        }

        let missing: Vec<_> = template
            .parameters
            .iter()
            .filter(|parameter| parameter.required && !parameters.contains_key(&parameter.name))
            .collect();

        if !missing.is_empty() {
            let template_description = if template.description.is_empty() {
                "query"
            } else {
                &template.description
            };

            if missing.len() > 1 {
                let values = self
                    .llm_fallback
                    .extract_batch(query, &missing, template_description)
                    .await;
                for (name, value) in values {
                    parameters.entry(name).or_insert(value);
                }
            } else {
                for parameter in &missing {
                    if let Some(value) = self
                        .llm_fallback
                        .extract_single(query, parameter, template_description)
                        .await
                    {
                        parameters.insert(parameter.name.clone(), value);
                    }
                }
            }
        }

        for parameter in &template.parameters {
            if !parameters.contains_key(&parameter.name) {
                if let Some(default) = &parameter.default {
                    parameters.insert(parameter.name.clone(), default.clone());
                }
            }
        }

        debug!("Extracted parameters: {parameters:?}");
        parameters
    }

    /// Validate parameters before execution. Returns `(ok, errors)`.
    pub fn validate_parameters(
        &self,
        parameters: &HashMap<String, Value>,
        template: &Template,
    ) -> (bool, HashMap<String, Vec<String>>) {
        self.validator.validate_parameters(parameters, template)
    }

    pub fn domain(&self) -> &DomainConfig {
        &self.domain
    }
}

fn values_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
