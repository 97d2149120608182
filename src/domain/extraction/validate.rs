// Parameter validation against domain rules
// Type checks plus declarative rules (min/max, lengths, regex pattern,
// allowed values, required), reported as field-scoped error lists.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::domain::{DomainConfig, FieldConfig, ValidationRules};
use crate::templates::{Template, TemplateParameter};

/// Validates extracted parameter values.
pub struct Validator {
    domain: Arc<DomainConfig>,
}

impl Validator {
    pub fn new(domain: Arc<DomainConfig>) -> Self {
        Self { domain }
    }

    /// Validate a value for an entity field. Returns Ok, or the reason.
    pub fn validate_field(
        &self,
        value: &Value,
        entity_name: &str,
        field_name: &str,
    ) -> Result<(), String> {
        let Some(field) = self.domain.field(entity_name, field_name) else {
            // No field config means no validation
            return Ok(());
        };

        if !validate_type(value, &field.data_type) {
            return Err(format!(
                "Invalid type for {field_name}: expected {}",
                field.data_type
            ));
        }

        validate_rules(value, &field.validation_rules, field_name)
    }

    /// Validate all parameters of a template, including required-parameter
    /// presence. Returns `(ok, {param -> [errors]})`.
    pub fn validate_parameters(
        &self,
        parameters: &HashMap<String, Value>,
        template: &Template,
    ) -> (bool, HashMap<String, Vec<String>>) {
        let mut errors: HashMap<String, Vec<String>> = HashMap::new();

        for parameter in &template.parameters {
            let value = parameters.get(&parameter.name);

            match value {
                None | Some(Value::Null) => {
                    if parameter.required {
                        errors
                            .entry(parameter.name.clone())
                            .or_default()
                            .push(format!("{} is required", parameter.name));
                    }
                }
                Some(value) => {
                    if let Err(message) = self.validate_parameter_value(value, parameter) {
                        errors
                            .entry(parameter.name.clone())
                            .or_default()
                            .push(message);
                    }
                }
            }
        }

        if !errors.is_empty() {
            warn!("Parameter validation failed: {errors:?}");
        }
        (errors.is_empty(), errors)
    }

    fn validate_parameter_value(
        &self,
        value: &Value,
        parameter: &TemplateParameter,
    ) -> Result<(), String> {
        // Field-backed parameters use the field's rules
        if let (Some(entity), Some(field)) = (&parameter.entity, &parameter.field) {
            return self.validate_field(value, entity, field);
        }

        let param_type = parameter.type_name();
        if param_type != "enum" && !validate_type(value, param_type) {
            return Err(format!(
                "Invalid type for {}: expected {param_type}",
                parameter.name
            ));
        }

        if !parameter.allowed_values.is_empty() {
            let as_text = value_text(value);
            if !parameter
                .allowed_values
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&as_text))
            {
                return Err(format!(
                    "{} must be one of: {}",
                    parameter.name,
                    parameter.allowed_values.join(", ")
                ));
            }
        }

        Ok(())
    }

    /// Sanitize a validated value: trim strings, clamp to max_length,
    /// lowercase emails, strip phone separators.
    pub fn sanitize(&self, value: Value, entity_name: &str, field_name: &str) -> Value {
        let Some(field) = self.domain.field(entity_name, field_name) else {
            return value;
        };

        match (field.data_type.as_str(), value) {
            ("string", Value::String(text)) => {
                let mut clean = text.trim().to_string();
                if let Some(max_len) = field.validation_rules.max_length {
                    if clean.len() > max_len {
                        clean.truncate(max_len);
                    }
                }
                Value::String(clean)
            }
            ("email", Value::String(text)) => Value::String(text.trim().to_lowercase()),
            ("phone", Value::String(text)) => Value::String(
                text.chars()
                    .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
                    .collect(),
            ),
            (_, value) => value,
        }
    }
}

fn validate_type(value: &Value, data_type: &str) -> bool {
    if value.is_null() {
        // Null is valid for optional fields
        return true;
    }

    match data_type {
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value
                    .as_str()
                    .map(|s| s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty())
                    .unwrap_or(false)
        }
        "decimal" => value.is_number(),
        "string" => value.is_string() || value.is_object(),
        "boolean" => value.is_boolean(),
        "date" => value.as_str().map(is_valid_date).unwrap_or(false),
        "datetime" => value.as_str().map(is_valid_datetime).unwrap_or(false),
        "email" => value.as_str().map(is_valid_email).unwrap_or(false),
        "phone" => value.as_str().map(is_valid_phone).unwrap_or(false),
        _ => true,
    }
}

fn validate_rules(value: &Value, rules: &ValidationRules, field_name: &str) -> Result<(), String> {
    if rules.is_empty() {
        return Ok(());
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = rules.min {
            if number < min {
                return Err(format!("{field_name} must be at least {min}"));
            }
        }
        if let Some(max) = rules.max {
            if number > max {
                return Err(format!("{field_name} must be at most {max}"));
            }
        }
    }

    if let Some(text) = value.as_str() {
        if let Some(min_length) = rules.min_length {
            if text.len() < min_length {
                return Err(format!(
                    "{field_name} must be at least {min_length} characters"
                ));
            }
        }
        if let Some(max_length) = rules.max_length {
            if text.len() > max_length {
                return Err(format!(
                    "{field_name} must be at most {max_length} characters"
                ));
            }
        }
        if let Some(pattern) = &rules.pattern {
            match Regex::new(pattern) {
                Ok(regex) => {
                    if !regex.is_match(text) {
                        let description = rules
                            .pattern_description
                            .as_deref()
                            .unwrap_or("required format");
                        return Err(format!("{field_name} does not match {description}"));
                    }
                }
                Err(_) => {
                    warn!("Invalid validation pattern for {field_name}");
                }
            }
        }
    }

    if !rules.allowed_values.is_empty() {
        let matches = rules.allowed_values.iter().any(|allowed| {
            allowed == value
                || (allowed.as_str().zip(value.as_str()))
                    .map(|(a, v)| a.eq_ignore_ascii_case(v))
                    .unwrap_or(false)
        });
        if !matches {
            let allowed = rules
                .allowed_values
                .iter()
                .map(value_text)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(format!("{field_name} must be one of: {allowed}"));
        }
    }

    if rules.required && value.is_null() {
        return Err(format!("{field_name} is required"));
    }

    Ok(())
}

fn is_valid_date(text: &str) -> bool {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn is_valid_datetime(text: &str) -> bool {
    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
    ];
    FORMATS
        .iter()
        .any(|format| NaiveDateTime::parse_from_str(text, format).is_ok())
        || is_valid_date(text)
}

fn is_valid_email(text: &str) -> bool {
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("valid regex")
    });
    PATTERN.is_match(text)
}

fn is_valid_phone(text: &str) -> bool {
    let clean: String = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = clean.strip_prefix('+').unwrap_or(&clean);
    digits.chars().all(|c| c.is_ascii_digit()) && (10..=15).contains(&digits.len())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
