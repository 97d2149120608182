// QA document adapter
// Shapes question/answer metadata into conversational context, offers the
// direct-answer shortcut, and can boost exact question matches.

use serde_json::{Map, Value};
use tracing::debug;

use crate::contracts::DocumentAdapter;
use crate::types::{sort_by_confidence, ContextItem};

#[derive(Debug, Clone)]
pub struct QaAdapter {
    pub confidence_threshold: f32,
    pub boost_exact_matches: bool,
}

impl Default for QaAdapter {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            boost_exact_matches: false,
        }
    }
}

impl QaAdapter {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold,
            boost_exact_matches: false,
        }
    }

    pub fn with_exact_match_boost(mut self) -> Self {
        self.boost_exact_matches = true;
        self
    }

    pub fn from_config(config: &Value) -> Self {
        Self {
            confidence_threshold: config
                .get("confidence_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(0.7) as f32,
            boost_exact_matches: config
                .get("boost_exact_matches")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

impl DocumentAdapter for QaAdapter {
    fn format_document(&self, raw_doc: &str, metadata: &Map<String, Value>) -> ContextItem {
        let mut item = ContextItem::new(raw_doc, raw_doc);
        item.metadata = metadata.clone();

        match (
            metadata.get("question").and_then(Value::as_str),
            metadata.get("answer").and_then(Value::as_str),
        ) {
            (Some(question), Some(answer)) => {
                item.content = format!("Question: {question}\nAnswer: {answer}");
            }
            _ => {
                item.content = raw_doc.to_string();
            }
        }

        item
    }

    fn extract_direct_answer(&self, context: &[ContextItem]) -> Option<String> {
        let first = context.first()?;
        if first.confidence < self.confidence_threshold {
            return None;
        }

        let question = first.metadata_str("question")?;
        let answer = first.metadata_str("answer")?;
        Some(format!("Question: {question}\nAnswer: {answer}"))
    }

    fn apply_domain_filtering(
        &self,
        mut items: Vec<ContextItem>,
        query: &str,
    ) -> Vec<ContextItem> {
        if items.is_empty() {
            return items;
        }

        if self.boost_exact_matches {
            let query_lower = query.to_lowercase();
            for item in items.iter_mut() {
                let Some(question) = item.metadata_str("question") else {
                    continue;
                };
                let question_lower = question.to_lowercase();

                if question_lower.contains(&query_lower) {
                    item.confidence = (item.confidence * 1.2).min(1.0);
                    if question_lower == query_lower {
                        item.confidence = (item.confidence * 1.5).min(1.0);
                    }
                    debug!("Boosted exact-match question to {:.3}", item.confidence);
                }
            }
        }

        let mut filtered: Vec<ContextItem> = items
            .into_iter()
            .filter(|item| item.confidence >= self.confidence_threshold)
            .collect();
        sort_by_confidence(&mut filtered);
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn qa_metadata(question: &str, answer: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("question".to_string(), json!(question));
        metadata.insert("answer".to_string(), json!(answer));
        metadata
    }

    #[test]
    fn test_format_document_qa_pair() {
        let adapter = QaAdapter::default();
        let item = adapter.format_document("raw", &qa_metadata("What is it?", "A thing."));
        assert_eq!(item.content, "Question: What is it?\nAnswer: A thing.");
        assert_eq!(item.raw_document, "raw");
    }

    #[test]
    fn test_format_document_without_qa_metadata() {
        let adapter = QaAdapter::default();
        let item = adapter.format_document("plain text", &Map::new());
        assert_eq!(item.content, "plain text");
    }

    #[test]
    fn test_direct_answer_gated_by_confidence() {
        let adapter = QaAdapter::new(0.7);

        let mut confident = adapter.format_document("raw", &qa_metadata("Q", "A"));
        confident.confidence = 0.9;
        assert_eq!(
            adapter.extract_direct_answer(&[confident.clone()]),
            Some("Question: Q\nAnswer: A".to_string())
        );

        confident.confidence = 0.5;
        assert_eq!(adapter.extract_direct_answer(&[confident]), None);
        assert_eq!(adapter.extract_direct_answer(&[]), None);
    }

    #[test]
    fn test_filtering_drops_below_threshold_and_sorts() {
        let adapter = QaAdapter::new(0.5);
        let items = vec![
            ContextItem::new("low", "low").with_confidence(0.3),
            ContextItem::new("mid", "mid").with_confidence(0.6),
            ContextItem::new("high", "high").with_confidence(0.9),
        ];
        let filtered = adapter.apply_domain_filtering(items, "q");
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].content, "high");
    }

    #[test]
    fn test_exact_match_boost() {
        let adapter = QaAdapter::new(0.1).with_exact_match_boost();
        let mut item = adapter.format_document("raw", &qa_metadata("reset password", "Click..."));
        item.confidence = 0.5;

        let boosted = adapter.apply_domain_filtering(vec![item], "reset password");
        // x1.2 for containment, then x1.5 for exact equality
        assert!((boosted[0].confidence - 0.9).abs() < 1e-6);
    }
}
