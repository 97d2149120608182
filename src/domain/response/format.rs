// Deterministic result formatting
// Shapes raw result rows per field display formats before any LLM sees
// them: currency, percentage, date/datetime, phone, and case transforms.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::domain::strategy::DomainStrategy;
use crate::domain::{DomainConfig, FieldConfig};

pub struct ResponseFormatter {
    domain: Arc<DomainConfig>,
    strategy: Arc<dyn DomainStrategy>,
}

impl ResponseFormatter {
    pub fn new(domain: Arc<DomainConfig>, strategy: Arc<dyn DomainStrategy>) -> Self {
        Self { domain, strategy }
    }

    /// Format every row according to the domain's field configurations.
    pub fn format_results(&self, results: &[Map<String, Value>]) -> Vec<Map<String, Value>> {
        results.iter().map(|row| self.format_row(row)).collect()
    }

    fn format_row(&self, row: &Map<String, Value>) -> Map<String, Value> {
        let mut formatted = Map::new();

        for (key, value) in row {
            let field = self.domain.find_field(key);

            let shaped = match field.and_then(|f| f.display_format.as_deref()) {
                Some(format) => Value::String(apply_format(value, format)),
                None => match value {
                    // Unformatted floats round to the hinted decimal places
                    Value::Number(n) if n.is_f64() && field.is_some() => {
                        let places = decimal_places(field);
                        let factor = 10f64.powi(places as i32);
                        let rounded = (n.as_f64().unwrap_or(0.0) * factor).round() / factor;
                        Value::from(rounded)
                    }
                    other => other.clone(),
                },
            };

            formatted.insert(key.clone(), shaped);
        }

        formatted
    }

    /// Structured table data (display columns + formatted rows) for UI use.
    pub fn format_table_data(
        &self,
        results: &[Map<String, Value>],
        columns: Option<&[String]>,
    ) -> (Vec<String>, Vec<Vec<String>>) {
        if results.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let columns: Vec<String> = match columns {
            Some(explicit) => explicit.to_vec(),
            None => results[0].keys().cloned().collect(),
        };

        let rows = results
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|column| {
                        let value = row.get(column).cloned().unwrap_or(Value::Null);
                        match self.domain.find_field(column).and_then(|f| f.display_format.as_deref()) {
                            Some(format) => apply_format(&value, format),
                            None => display_text(&value),
                        }
                    })
                    .collect()
            })
            .collect();

        let display_columns = columns
            .iter()
            .map(|column| {
                self.domain
                    .find_field(column)
                    .and_then(|field| field.display_name.clone())
                    .unwrap_or_else(|| title_case(&column.replace('_', " ")))
            })
            .collect();

        (display_columns, rows)
    }

    /// Text summary of the top rows using the highest-priority fields.
    pub fn format_summary_data(&self, results: &[Map<String, Value>]) -> String {
        if results.is_empty() {
            return "No results to summarize.".to_string();
        }

        let summary_fields = self.summary_fields(&results[0]);

        let mut lines = Vec::new();
        for (index, row) in results.iter().take(5).enumerate() {
            let mut parts = Vec::new();
            for field_name in &summary_fields {
                let Some(value) = row.get(field_name) else {
                    continue;
                };
                let field = self.domain.find_field(field_name);
                let text = match field.and_then(|f| f.display_format.as_deref()) {
                    Some(format) => apply_format(value, format),
                    None => display_text(value),
                };
                let display_name = field
                    .and_then(|f| f.display_name.clone())
                    .unwrap_or_else(|| field_name.clone());
                parts.push(format!("{display_name}: {text}"));
            }
            if !parts.is_empty() {
                lines.push(format!("{}. {}", index + 1, parts.join(", ")));
            }
        }

        lines.join("\n")
    }

    /// Pick the top five fields by priority for row summarization.
    ///
    /// Order of precedence: explicit `summary_priority`, the domain
    /// strategy's opinion, semantic-type defaults, name heuristics, then 1
    /// so every field can still appear.
    pub fn summary_fields(&self, sample: &Map<String, Value>) -> Vec<String> {
        let mut prioritized: Vec<(String, i32)> = sample
            .keys()
            .map(|field_name| {
                let field = self.domain.find_field(field_name);
                let priority = self.field_priority(field_name, field);
                (field_name.clone(), priority)
            })
            .collect();

        prioritized.sort_by(|a, b| b.1.cmp(&a.1));
        prioritized
            .into_iter()
            .take(5)
            .map(|(name, _)| name)
            .collect()
    }

    fn field_priority(&self, field_name: &str, field: Option<&FieldConfig>) -> i32 {
        if let Some(priority) = field.and_then(|f| f.summary_priority) {
            return priority;
        }

        let strategy_priority = self.strategy.summary_field_priority(field_name, field);
        if strategy_priority > 0 {
            return strategy_priority;
        }

        if let Some(semantic) = field.and_then(|f| f.semantic_type.as_deref()) {
            let priority = semantic_type_priority(semantic);
            if priority > 0 {
                return priority;
            }
        }

        let priority = generic_field_priority(field_name);
        if priority > 0 {
            priority
        } else {
            1
        }
    }
}

fn decimal_places(field: Option<&FieldConfig>) -> u32 {
    field
        .and_then(|f| f.extraction_hints.decimal_places)
        .unwrap_or(2)
}

/// Apply a named display format to a value, falling back to plain text when
/// the value does not fit the format.
pub fn apply_format(value: &Value, display_format: &str) -> String {
    if value.is_null() {
        return String::new();
    }

    match display_format {
        "currency" => format_currency(value),
        "percentage" => format_percentage(value),
        "date" => format_date(value),
        "datetime" => format_datetime(value),
        "phone" => format_phone(value),
        "title_case" => title_case(&display_text(value)),
        "upper_case" => display_text(value).to_uppercase(),
        "lower_case" => display_text(value).to_lowercase(),
        "email" => display_text(value),
        other => {
            debug!("Unknown display format '{other}'");
            display_text(value)
        }
    }
}

fn format_currency(value: &Value) -> String {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => text.replace(['$', ','], "").trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(amount) => format!("${}", thousands(amount)),
        None => display_text(value),
    }
}

fn format_percentage(value: &Value) -> String {
    match value.as_f64() {
        // Fractions below 1 are auto-scaled to percent
        Some(fraction) if fraction < 1.0 => format!("{:.1}%", fraction * 100.0),
        Some(number) => format!("{number:.1}%"),
        None => display_text(value),
    }
}

fn format_date(value: &Value) -> String {
    let Some(text) = value.as_str() else {
        return display_text(value);
    };
    let head = text.get(..10).unwrap_or(text);
    if let Ok(date) = NaiveDate::parse_from_str(head, "%Y-%m-%d") {
        return date.format("%B %-d, %Y").to_string();
    }
    text.to_string()
}

fn format_datetime(value: &Value) -> String {
    let Some(text) = value.as_str() else {
        return display_text(value);
    };
    let normalized = text.replace('Z', "+00:00");
    if let Ok(datetime) = DateTime::parse_from_rfc3339(&normalized) {
        return datetime.format("%B %-d, %Y at %-I:%M %p").to_string();
    }
    if let Ok(datetime) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return datetime.format("%B %-d, %Y at %-I:%M %p").to_string();
    }
    text.to_string()
}

fn format_phone(value: &Value) -> String {
    let text = display_text(value);
    if text.is_empty() {
        return text;
    }

    let mut digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }

    if digits.len() == 10 {
        format!("({}) {}-{}", &digits[..3], &digits[3..6], &digits[6..])
    } else {
        text
    }
}

fn thousands(amount: f64) -> String {
    let formatted = format!("{amount:.2}");
    let (whole, fraction) = formatted.split_once('.').unwrap_or((&formatted, "00"));
    let negative = whole.starts_with('-');
    let digits: Vec<char> = whole.trim_start_matches('-').chars().collect();

    let mut grouped = String::new();
    for (index, digit) in digits.iter().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*digit);
    }

    let sign = if negative { "-" } else { "" };
    format!("{sign}{grouped}.{fraction}")
}

pub fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn display_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::GenericDomainStrategy;
    use crate::domain::test_fixtures::customer_order_domain;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn formatter() -> ResponseFormatter {
        let domain = Arc::new(customer_order_domain());
        let strategy = Arc::new(GenericDomainStrategy::new(domain.clone()));
        ResponseFormatter::new(domain, strategy)
    }

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_currency_format() {
        assert_eq!(apply_format(&json!(1250.5), "currency"), "$1,250.50");
        assert_eq!(apply_format(&json!("99"), "currency"), "$99.00");
        assert_eq!(apply_format(&json!(1234567.891), "currency"), "$1,234,567.89");
    }

    #[test]
    fn test_percentage_format_auto_scales() {
        assert_eq!(apply_format(&json!(0.25), "percentage"), "25.0%");
        assert_eq!(apply_format(&json!(25), "percentage"), "25.0%");
    }

    #[test]
    fn test_date_and_datetime_format() {
        assert_eq!(apply_format(&json!("2024-03-05"), "date"), "March 5, 2024");
        assert_eq!(
            apply_format(&json!("2024-03-05T14:30:00Z"), "datetime"),
            "March 5, 2024 at 2:30 PM"
        );
    }

    #[test]
    fn test_phone_format() {
        assert_eq!(
            apply_format(&json!("6125550199"), "phone"),
            "(612) 555-0199"
        );
        assert_eq!(
            apply_format(&json!("+1 612 555 0199"), "phone"),
            "(612) 555-0199"
        );
        // Non-US lengths pass through untouched
        assert_eq!(apply_format(&json!("12345"), "phone"), "12345");
    }

    #[test]
    fn test_case_formats() {
        assert_eq!(apply_format(&json!("john smith"), "title_case"), "John Smith");
        assert_eq!(apply_format(&json!("abc"), "upper_case"), "ABC");
    }

    #[test]
    fn test_format_results_applies_field_formats() {
        let formatter = formatter();
        let rows = vec![row(&[
            ("total", json!(1250.5)),
            ("name", json!("John Smith")),
        ])];
        let formatted = formatter.format_results(&rows);
        assert_eq!(formatted[0].get("total"), Some(&json!("$1,250.50")));
        assert_eq!(formatted[0].get("name"), Some(&json!("John Smith")));
    }

    #[test]
    fn test_summary_fields_prefers_semantic_and_heuristics() {
        let formatter = formatter();
        let sample = row(&[
            ("notes", json!("x")),
            ("name", json!("John")),
            ("id", json!(1)),
            ("status", json!("shipped")),
            ("order_date", json!("2024-01-01")),
            ("misc", json!("y")),
        ]);
        let fields = formatter.summary_fields(&sample);
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], "name");
        assert!(!fields.contains(&"misc".to_string()) || !fields.contains(&"notes".to_string()));
    }

    #[test]
    fn test_table_data_display_names() {
        let formatter = formatter();
        let rows = vec![row(&[("order_date", json!("2024-03-05")), ("total", json!(10))])];
        let (columns, data) = formatter.format_table_data(&rows, None);
        assert!(columns.contains(&"Order Date".to_string()));
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_summary_data_lines() {
        let formatter = formatter();
        let rows = vec![
            row(&[("name", json!("A")), ("total", json!(5))]),
            row(&[("name", json!("B")), ("total", json!(6))]),
        ];
        let summary = formatter.format_summary_data(&rows);
        assert!(summary.starts_with("1. "));
        assert!(summary.contains("2. "));
    }
}
