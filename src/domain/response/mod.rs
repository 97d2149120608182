// Domain-aware response generation
// Turns raw result rows into a user-facing answer: deterministic formatting
// first, then a strategy keyed by the template's result_format drives the
// LLM prompt. Failures degrade to deterministic fallback text.

pub mod format;
pub mod prompts;

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::error;

use crate::contracts::Inference;
use crate::domain::strategy::DomainStrategy;
use crate::domain::DomainConfig;
use crate::templates::Template;

use format::ResponseFormatter;
use prompts::PromptBuilder;

/// Names of aggregate results recognized by the summary strategy.
const METRIC_MARKERS: &[&str] = &["sum", "avg", "average", "count", "total", "max", "min"];

/// Facade for response generation.
pub struct DomainResponseGenerator {
    inference: Arc<dyn Inference>,
    formatter: ResponseFormatter,
    prompt_builder: PromptBuilder,
    /// Append a plain-text table after the LLM answer for table results.
    pub include_table_data: bool,
}

impl DomainResponseGenerator {
    pub fn new(
        inference: Arc<dyn Inference>,
        domain: Arc<DomainConfig>,
        strategy: Arc<dyn DomainStrategy>,
    ) -> Self {
        Self {
            inference,
            formatter: ResponseFormatter::new(domain.clone(), strategy),
            prompt_builder: PromptBuilder::new(domain),
            include_table_data: false,
        }
    }

    /// Generate the response for a query's results.
    ///
    /// Strategy selection: an error produces the error strategy; an empty
    /// result set the no-results strategy; otherwise the template's
    /// `result_format` picks table or summary.
    pub async fn generate_response(
        &self,
        query: &str,
        results: &[Map<String, Value>],
        template: &Template,
        error: Option<&str>,
        conversation_context: Option<&str>,
    ) -> String {
        if let Some(error_text) = error {
            return self.generate_error(query, error_text).await;
        }

        if results.is_empty() {
            return self.generate_no_results(query, template).await;
        }

        let formatted = self.formatter.format_results(results);
        let summary_fields = self.formatter.summary_fields(&formatted[0]);

        match template.result_format.as_str() {
            "summary" => {
                self.generate_summary(query, &formatted, template, &summary_fields)
                    .await
            }
            _ => {
                self.generate_table(query, &formatted, template, &summary_fields, conversation_context)
                    .await
            }
        }
    }

    async fn generate_table(
        &self,
        query: &str,
        formatted: &[Map<String, Value>],
        template: &Template,
        summary_fields: &[String],
        conversation_context: Option<&str>,
    ) -> String {
        let prompt = self.prompt_builder.table_response_prompt(
            query,
            formatted,
            template,
            summary_fields,
            conversation_context,
        );

        let mut response = match self.inference.generate(&prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                error!("Error generating table response: {err}");
                fallback_table_response(formatted.len())
            }
        };

        if self.include_table_data {
            response.push_str(&self.render_plain_table(formatted));
        }

        response
    }

    async fn generate_summary(
        &self,
        query: &str,
        formatted: &[Map<String, Value>],
        template: &Template,
        summary_fields: &[String],
    ) -> String {
        let metrics = extract_metrics(formatted);
        let prompt = self.prompt_builder.summary_response_prompt(
            query,
            formatted,
            template,
            summary_fields,
            &metrics,
        );

        match self.inference.generate(&prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                error!("Error generating summary response: {err}");
                format!(
                    "Summary of results:\n{}",
                    self.formatter.format_summary_data(formatted)
                )
            }
        }
    }

    async fn generate_error(&self, query: &str, error_text: &str) -> String {
        let prompt = self.prompt_builder.error_response_prompt(error_text, query);
        match self.inference.generate(&prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                error!("Error generating error response: {err}");
                "I encountered an error processing your request. Please try rephrasing your question."
                    .to_string()
            }
        }
    }

    async fn generate_no_results(&self, query: &str, template: &Template) -> String {
        let prompt = self.prompt_builder.no_results_prompt(query, template);
        match self.inference.generate(&prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                error!("Error generating no-results response: {err}");
                "I didn't find any results for your query. You might want to try different search criteria."
                    .to_string()
            }
        }
    }

    /// Plain-text table appendix, capped at ten rows.
    fn render_plain_table(&self, formatted: &[Map<String, Value>]) -> String {
        let (columns, rows) = self.formatter.format_table_data(formatted, None);
        if rows.is_empty() {
            return String::new();
        }

        let header = columns.join(" | ");
        let mut table = format!("\n\n{header}\n{}\n", "-".repeat(header.len()));
        for row in rows.iter().take(10) {
            table.push_str(&row.join(" | "));
            table.push('\n');
        }
        if rows.len() > 10 {
            table.push_str(&format!("... and {} more rows\n", rows.len() - 10));
        }
        table
    }

    /// Structured table data for UI display.
    pub fn get_table_data(
        &self,
        results: &[Map<String, Value>],
        columns: Option<&[String]>,
    ) -> (Vec<String>, Vec<Vec<String>>) {
        let formatted = self.formatter.format_results(results);
        self.formatter.format_table_data(&formatted, columns)
    }

    /// Text summary of results without invoking the LLM.
    pub fn get_summary_data(&self, results: &[Map<String, Value>]) -> String {
        let formatted = self.formatter.format_results(results);
        self.formatter.format_summary_data(&formatted)
    }
}

fn fallback_table_response(count: usize) -> String {
    match count {
        0 => "No results found for your query.".to_string(),
        1 => "Found 1 result matching your query.".to_string(),
        n => format!("Found {n} results matching your query."),
    }
}

/// Pull aggregate fields out of the first row: any field whose name carries
/// one of the metric markers is reported in the Key Metrics block.
fn extract_metrics(results: &[Map<String, Value>]) -> Vec<(String, Value)> {
    let Some(first) = results.first() else {
        return Vec::new();
    };

    first
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_lowercase();
            METRIC_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
