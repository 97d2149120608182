// LLM fallback for parameter extraction
// When patterns find nothing for a required parameter, a strict prompt asks
// the inference provider for the bare value or NOT_FOUND. Two or more
// missing parameters are batched into one JSON-object request.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::values::parse_value;
use crate::contracts::Inference;
use crate::domain::DomainConfig;
use crate::templates::TemplateParameter;

pub struct LlmFallback {
    inference: Arc<dyn Inference>,
    domain: Arc<DomainConfig>,
}

impl LlmFallback {
    pub fn new(inference: Arc<dyn Inference>, domain: Arc<DomainConfig>) -> Self {
        Self { inference, domain }
    }

    /// Extract a single parameter value. Returns None when the model answers
    /// NOT_FOUND or the reply fails type parsing.
    pub async fn extract_single(
        &self,
        query: &str,
        parameter: &TemplateParameter,
        template_description: &str,
    ) -> Option<Value> {
        let prompt = self.build_single_prompt(query, parameter, template_description);

        match self.inference.generate(&prompt).await {
            Ok(response) => parse_single_response(&response, parameter),
            Err(err) => {
                error!("LLM extraction failed: {err}");
                None
            }
        }
    }

    /// Extract several missing parameters in one call. The model returns a
    /// JSON object; unparseable or NOT_FOUND entries are treated as absent.
    pub async fn extract_batch(
        &self,
        query: &str,
        parameters: &[&TemplateParameter],
        template_description: &str,
    ) -> HashMap<String, Value> {
        let prompt = self.build_batch_prompt(query, parameters, template_description);

        let response = match self.inference.generate(&prompt).await {
            Ok(response) => response,
            Err(err) => {
                error!("Batch LLM extraction failed: {err}");
                return HashMap::new();
            }
        };

        parse_batch_response(&response, parameters)
    }

    fn build_single_prompt(
        &self,
        query: &str,
        parameter: &TemplateParameter,
        template_description: &str,
    ) -> String {
        let param_name = &parameter.name;
        let param_type = parameter.type_name();
        let description = parameter.description.as_deref().unwrap_or("");
        let domain_context = self.domain_context(parameter);

        format!(
            r#"Extract the value for parameter "{param_name}" from the user's query.

User Query: "{query}"

Template Context: {template_description}
Parameter Details:
- Name: {param_name}
- Type: {param_type}
- Description: {description}

{domain_context}

Instructions:
1. Look for the {param_name} value in the user's query
2. If found, extract and format it according to the type
3. If not explicitly stated, infer from context if possible
4. Return ONLY the extracted value or "NOT_FOUND" if not present

For date values, use YYYY-MM-DD format.
For numeric values, return the number without currency symbols or commas.

Response:"#
        )
    }

    fn build_batch_prompt(
        &self,
        query: &str,
        parameters: &[&TemplateParameter],
        template_description: &str,
    ) -> String {
        let descriptions: Vec<String> = parameters
            .iter()
            .map(|parameter| {
                let mut line = format!(
                    "- {} ({}): {}",
                    parameter.name,
                    parameter.type_name(),
                    parameter.description.as_deref().unwrap_or("")
                );
                if let Some(example) = &parameter.example {
                    line.push_str(&format!(" (Example: {example})"));
                }
                if !parameter.allowed_values.is_empty() {
                    line.push_str(&format!(
                        " - Allowed values: {}",
                        parameter.allowed_values.join(", ")
                    ));
                }
                line
            })
            .collect();

        format!(
            r#"Extract the following parameters from the user query.
Return ONLY a valid JSON object with the extracted values.
Use null for parameters that cannot be found.

Template Context: {template_description}

Parameters needed:
{}

User query: "{query}"

JSON:"#,
            descriptions.join("\n")
        )
    }

    fn domain_context(&self, parameter: &TemplateParameter) -> String {
        let mut parts = Vec::new();

        if let Some(entity_name) = &parameter.entity {
            if let Some(entity) = self.domain.entity(entity_name) {
                parts.push(format!(
                    "Entity: {}",
                    entity.display_name.as_deref().unwrap_or(&entity.name)
                ));
                if let Some(description) = &entity.description {
                    parts.push(format!("Entity Description: {description}"));
                }
                let synonyms = self.domain.entity_synonyms(entity_name);
                if !synonyms.is_empty() {
                    parts.push(format!("Entity Synonyms: {}", synonyms.join(", ")));
                }
            }

            if let Some(field_name) = &parameter.field {
                if let Some(field) = self.domain.field(entity_name, field_name) {
                    if let Some(display_name) = &field.display_name {
                        parts.push(format!("Field Display Name: {display_name}"));
                    }
                }
                let synonyms = self.domain.field_synonyms(field_name);
                if !synonyms.is_empty() {
                    parts.push(format!("Field Synonyms: {}", synonyms.join(", ")));
                }
            }
        }

        if parts.is_empty() {
            String::new()
        } else {
            format!("Domain Context:\n{}", parts.join("\n"))
        }
    }
}

fn parse_single_response(response: &str, parameter: &TemplateParameter) -> Option<Value> {
    let trimmed = response.trim();
    if trimmed.is_empty() || trimmed == "NOT_FOUND" {
        return None;
    }

    let value = parse_value(trimmed, parameter.type_name());
    if value.is_none() {
        debug!(
            "LLM reply '{trimmed}' failed to parse as {}",
            parameter.type_name()
        );
    }
    value
}

fn parse_batch_response(
    response: &str,
    parameters: &[&TemplateParameter],
) -> HashMap<String, Value> {
    let mut extracted = HashMap::new();

    // Locate the JSON object anywhere in the reply
    let start = response.find('{');
    let end = response.rfind('}');
    let Some(object) = start
        .zip(end)
        .filter(|(s, e)| s < e)
        .and_then(|(s, e)| serde_json::from_str::<Value>(&response[s..=e]).ok())
        .and_then(|value| value.as_object().cloned())
    else {
        debug!("Batch LLM reply carried no parseable JSON object");
        return extracted;
    };

    for parameter in parameters {
        let Some(raw) = object.get(&parameter.name) else {
            continue;
        };
        if raw.is_null() {
            continue;
        }
        let value = match raw {
            Value::String(text) if text == "NOT_FOUND" => None,
            Value::String(text) => parse_value(text, parameter.type_name()),
            other => Some(other.clone()),
        };
        if let Some(value) = value {
            extracted.insert(parameter.name.clone(), value);
        }
    }

    extracted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_fixtures::customer_order_domain;
    use crate::inference::StaticInference;
    use serde_json::json;

    fn parameter(name: &str, data_type: &str) -> TemplateParameter {
        TemplateParameter {
            name: name.to_string(),
            data_type: Some(data_type.to_string()),
            required: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_extraction_parses_typed_value() -> Result<()> {
        let fallback = LlmFallback::new(
            Arc::new(StaticInference::new("1,250")),
            Arc::new(customer_order_domain()),
        );
        let value = fallback
            .extract_single("q", &parameter("min_total", "integer"), "orders over amount")
            .await;
        assert_eq!(value, Some(json!(1250)));
        Ok(())
    }

    #[tokio::test]
    async fn test_single_extraction_not_found() -> Result<()> {
        let fallback = LlmFallback::new(
            Arc::new(StaticInference::new("NOT_FOUND")),
            Arc::new(customer_order_domain()),
        );
        let value = fallback
            .extract_single("q", &parameter("customer_name", "string"), "desc")
            .await;
        assert_eq!(value, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_extraction_parses_json_object() -> Result<()> {
        let reply = r#"Here you go: {"customer_name": "John Smith", "min_total": "250", "city": null}"#;
        let fallback = LlmFallback::new(
            Arc::new(StaticInference::new(reply)),
            Arc::new(customer_order_domain()),
        );

        let name_param = parameter("customer_name", "string");
        let total_param = parameter("min_total", "integer");
        let city_param = parameter("city", "string");
        let parameters = vec![&name_param, &total_param, &city_param];

        let values = fallback.extract_batch("q", &parameters, "desc").await;
        assert_eq!(values.get("customer_name"), Some(&json!("John Smith")));
        assert_eq!(values.get("min_total"), Some(&json!(250)));
        assert!(!values.contains_key("city"));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_extraction_handles_garbage() -> Result<()> {
        let fallback = LlmFallback::new(
            Arc::new(StaticInference::new("I cannot help with that")),
            Arc::new(customer_order_domain()),
        );
        let name_param = parameter("customer_name", "string");
        let parameters = vec![&name_param];
        let values = fallback.extract_batch("q", &parameters, "desc").await;
        assert!(values.is_empty());
        Ok(())
    }
}
