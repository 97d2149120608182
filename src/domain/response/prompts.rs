// Prompt assembly for response generation
// Each response strategy gets a purpose-built prompt grounded in the domain
// description, the matched template, and a bounded sample of the results.

use serde_json::{Map, Value};
use std::sync::Arc;

use super::format::display_text;
use crate::domain::DomainConfig;
use crate::templates::Template;

pub struct PromptBuilder {
    domain: Arc<DomainConfig>,
}

impl PromptBuilder {
    pub fn new(domain: Arc<DomainConfig>) -> Self {
        Self { domain }
    }

    pub fn table_response_prompt(
        &self,
        query: &str,
        formatted_results: &[Map<String, Value>],
        template: &Template,
        summary_fields: &[String],
        conversation_context: Option<&str>,
    ) -> String {
        let domain_context = self.domain_context();
        let template_description = template_description(template);
        let sample = summarize_rows(formatted_results, summary_fields, 5, 6);
        let conversation = conversation_block(conversation_context);

        format!(
            r#"Generate a natural language response for the user's query about {domain_context}.

User Query: "{query}"
Query Type: {template_description}

Results Found: {} records
Sample Results:
{sample}

{conversation}Instructions:
1. Provide a conversational response that summarizes the results
2. Mention the total number of results found
3. Highlight key findings, patterns, and insights from the detailed data
4. Use specific metrics and details from the results
5. Identify trends, outliers, or notable characteristics in the data
6. Be informative and analytical while remaining conversational
7. Use natural language, not technical database terms

Important: Give ONLY the direct response, no meta-commentary."#,
            formatted_results.len()
        )
    }

    pub fn summary_response_prompt(
        &self,
        query: &str,
        formatted_results: &[Map<String, Value>],
        template: &Template,
        summary_fields: &[String],
        metrics: &[(String, Value)],
    ) -> String {
        let domain_context = self.domain_context();
        let template_description = template_description(template);
        let sample = summarize_rows(formatted_results, summary_fields, 5, 6);
        let metrics_block = metrics_block(metrics);

        format!(
            r#"Generate a summary response for the user's analytical query about {domain_context}.

User Query: "{query}"
Analysis Type: {template_description}

Results:
{sample}

{metrics_block}Instructions:
1. Provide a clear summary of the findings
2. Highlight important metrics or totals
3. Explain what the data shows in business terms
4. Be analytical but accessible
5. Focus on insights, not just numbers

Important: Give ONLY the direct response."#
        )
    }

    pub fn error_response_prompt(&self, error: &str, query: &str) -> String {
        let domain_context = self.domain_context();

        format!(
            r#"The user asked a question about {domain_context}, but there was an error.

User Query: "{query}"
Error: {error}

Provide a helpful, conversational response that:
1. Acknowledges the issue without technical details
2. Suggests what might have gone wrong
3. Offers alternative ways to phrase the question if applicable
4. Remains friendly and helpful

Important: Give ONLY the direct response."#
        )
    }

    pub fn no_results_prompt(&self, query: &str, template: &Template) -> String {
        let domain_context = self.domain_context();
        let template_description = template_description(template);
        let criteria = self.searchable_criteria();

        format!(
            r#"The user searched in {domain_context} but no results were found.

User Query: "{query}"
Query Type: {template_description}

Available search criteria:
{criteria}

Provide a helpful response that:
1. Explains no results were found
2. Suggests why this might be (e.g., no matching records, criteria too specific)
3. Offers suggestions for modifying the search
4. Remains conversational and helpful

Important: Give ONLY the direct response."#
        )
    }

    fn domain_context(&self) -> String {
        if self.domain.description.is_empty() {
            format!("the {} system", self.domain.domain_name)
        } else {
            format!("the {} ({})", self.domain.domain_name, self.domain.description)
        }
    }

    /// Searchable criteria grouped by entity for the no-results prompt.
    fn searchable_criteria(&self) -> String {
        let mut lines = Vec::new();
        for entity_name in &self.domain.entity_order {
            let Some(entity) = self.domain.entity(entity_name) else {
                continue;
            };
            let fields: Vec<&str> = entity
                .fields
                .values()
                .filter(|field| field.searchable || field.filterable)
                .map(|field| field.name.as_str())
                .collect();
            if !fields.is_empty() {
                lines.push(format!("- {entity_name}: {}", fields.join(", ")));
            }
        }
        if lines.is_empty() {
            "- (no searchable fields configured)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

fn template_description(template: &Template) -> &str {
    if template.description.is_empty() {
        "query"
    } else {
        &template.description
    }
}

fn conversation_block(context: Option<&str>) -> String {
    match context {
        Some(text) if !text.is_empty() => format!("Conversation Context:\n{text}\n\n"),
        _ => String::new(),
    }
}

fn metrics_block(metrics: &[(String, Value)]) -> String {
    if metrics.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = metrics
        .iter()
        .map(|(name, value)| format!("- {name}: {}", display_text(value)))
        .collect();
    format!("Key Metrics:\n{}\n\n", lines.join("\n"))
}

/// Render the top rows as numbered `field: value` lines, bounded by row and
/// field counts to keep prompts small.
pub fn summarize_rows(
    rows: &[Map<String, Value>],
    preferred_fields: &[String],
    max_rows: usize,
    max_fields: usize,
) -> String {
    if rows.is_empty() {
        return "No results".to_string();
    }

    let mut lines = Vec::new();
    for (index, row) in rows.iter().take(max_rows).enumerate() {
        let fields: Vec<&String> = if preferred_fields.is_empty() {
            row.keys().take(max_fields).collect()
        } else {
            preferred_fields
                .iter()
                .filter(|name| row.contains_key(*name))
                .take(max_fields)
                .collect()
        };

        let parts: Vec<String> = fields
            .into_iter()
            .map(|name| format!("{name}: {}", display_text(row.get(name).unwrap_or(&Value::Null))))
            .collect();
        lines.push(format!("{}. {}", index + 1, parts.join(", ")));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_fixtures::customer_order_domain;
    use serde_json::json;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(Arc::new(customer_order_domain()))
    }

    fn sample_rows() -> Vec<Map<String, Value>> {
        vec![[("name".to_string(), json!("John")), ("total".to_string(), json!("$10.00"))]
            .into_iter()
            .collect()]
    }

    #[test]
    fn test_table_prompt_contains_query_and_counts() {
        let prompt = builder().table_response_prompt(
            "orders from John",
            &sample_rows(),
            &Template {
                description: "Find orders".to_string(),
                ..Default::default()
            },
            &[],
            None,
        );
        assert!(prompt.contains(r#"User Query: "orders from John""#));
        assert!(prompt.contains("Results Found: 1 records"));
        assert!(prompt.contains("Find orders"));
    }

    #[test]
    fn test_no_results_prompt_lists_criteria_by_entity() {
        let prompt = builder().no_results_prompt("anything", &Template::default());
        assert!(prompt.contains("- customer:"));
        assert!(prompt.contains("- order:"));
    }

    #[test]
    fn test_summary_prompt_includes_metrics() {
        let prompt = builder().summary_response_prompt(
            "total sales",
            &sample_rows(),
            &Template::default(),
            &[],
            &[("total_sales".to_string(), json!("$99.00"))],
        );
        assert!(prompt.contains("Key Metrics:"));
        assert!(prompt.contains("total_sales: $99.00"));
    }

    #[test]
    fn test_summarize_rows_bounds() {
        let rows: Vec<Map<String, Value>> = (0..10)
            .map(|i| {
                [("id".to_string(), json!(i))]
                    .into_iter()
                    .collect()
            })
            .collect();
        let text = summarize_rows(&rows, &[], 3, 6);
        assert_eq!(text.lines().count(), 3);
    }
}
