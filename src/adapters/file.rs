// File document adapter
// Specializes the QA adapter for uploaded-file chunks: content is labeled
// with filename and mime type, and filtering boosts items whose filename or
// content matches query terms.

use serde_json::{Map, Value};

use super::qa::QaAdapter;
use crate::contracts::DocumentAdapter;
use crate::types::{sort_by_confidence, ContextItem};

/// Confidence ceiling after file boosts; boosted items must not outrank a
/// perfect vector match.
const BOOST_CAP: f32 = 0.95;

#[derive(Debug, Clone)]
pub struct FileAdapter {
    inner: QaAdapter,
    pub boost_file_uploads: bool,
}

impl Default for FileAdapter {
    fn default() -> Self {
        Self {
            inner: QaAdapter::new(0.3),
            boost_file_uploads: true,
        }
    }
}

impl FileAdapter {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            inner: QaAdapter::new(confidence_threshold),
            boost_file_uploads: true,
        }
    }

    pub fn from_config(config: &Value) -> Self {
        Self {
            inner: QaAdapter::from_config(config),
            boost_file_uploads: config
                .get("boost_file_uploads")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        }
    }

    fn file_label(metadata: &Map<String, Value>) -> (String, String) {
        let filename = metadata
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("Unknown file")
            .to_string();
        let mime_type = metadata
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown type")
            .to_string();
        (filename, mime_type)
    }
}

impl DocumentAdapter for FileAdapter {
    fn format_document(&self, raw_doc: &str, metadata: &Map<String, Value>) -> ContextItem {
        let mut item = self.inner.format_document(raw_doc, metadata);

        let (filename, mime_type) = Self::file_label(metadata);
        item.content = format!("File: {filename}\nType: {mime_type}\n\nContent:\n{raw_doc}");
        item.metadata
            .insert("filename".to_string(), Value::String(filename));
        item.metadata
            .insert("mime_type".to_string(), Value::String(mime_type));

        item
    }

    fn extract_direct_answer(&self, context: &[ContextItem]) -> Option<String> {
        self.inner.extract_direct_answer(context)
    }

    fn apply_domain_filtering(
        &self,
        items: Vec<ContextItem>,
        query: &str,
    ) -> Vec<ContextItem> {
        if items.is_empty() {
            return items;
        }

        let query_terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|term| term.len() > 2)
            .map(str::to_string)
            .collect();

        let mut boosted: Vec<ContextItem> = items
            .into_iter()
            .map(|mut item| {
                if !self.boost_file_uploads {
                    return item;
                }

                let mut boost_factor = 1.0f32;

                let content_lower = item.content.to_lowercase();
                let exact_matches = query_terms
                    .iter()
                    .filter(|term| content_lower.contains(*term))
                    .count();
                if exact_matches > 0 {
                    boost_factor *= 1.0 + exact_matches as f32 * 0.2;
                }

                if let Some(filename) = item.metadata_str("filename") {
                    let filename_lower = filename.to_lowercase();
                    let filename_matches = query_terms
                        .iter()
                        .filter(|term| filename_lower.contains(*term))
                        .count();
                    if filename_matches > 0 {
                        boost_factor *= 1.0 + filename_matches as f32 * 0.15;
                    }
                }

                if item.metadata.contains_key("upload_timestamp") {
                    boost_factor *= 1.1;
                }

                if boost_factor > 1.0 {
                    item.confidence = (item.confidence * boost_factor).min(BOOST_CAP);
                    item.metadata.insert(
                        "boost_factor".to_string(),
                        Value::from(boost_factor as f64),
                    );
                }
                item
            })
            .filter(|item| item.confidence >= self.inner.confidence_threshold)
            .collect();

        sort_by_confidence(&mut boosted);
        boosted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_metadata(filename: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("filename".to_string(), json!(filename));
        metadata.insert("mime_type".to_string(), json!("text/csv"));
        metadata
    }

    #[test]
    fn test_format_labels_file() {
        let adapter = FileAdapter::default();
        let item = adapter.format_document("a,b,c", &file_metadata("report.csv"));
        assert!(item.content.starts_with("File: report.csv\nType: text/csv"));
        assert!(item.content.contains("a,b,c"));
        assert_eq!(item.raw_document, "a,b,c");
    }

    #[test]
    fn test_filename_match_boost() {
        let adapter = FileAdapter::new(0.1);
        let mut item = adapter.format_document("numbers", &file_metadata("sales_report.csv"));
        item.confidence = 0.5;

        let boosted = adapter.apply_domain_filtering(vec![item], "sales report");
        assert!(boosted[0].confidence > 0.5);
        assert!(boosted[0].confidence <= BOOST_CAP);
        assert!(boosted[0].metadata.contains_key("boost_factor"));
    }

    #[test]
    fn test_boost_capped() {
        let adapter = FileAdapter::new(0.1);
        let mut item = adapter.format_document(
            "sales sales sales report report",
            &file_metadata("sales_report.csv"),
        );
        item.confidence = 0.94;

        let boosted = adapter.apply_domain_filtering(vec![item], "sales report");
        assert!(boosted[0].confidence <= BOOST_CAP);
    }

    #[test]
    fn test_boost_disabled() {
        let mut adapter = FileAdapter::new(0.1);
        adapter.boost_file_uploads = false;
        let mut item = adapter.format_document("sales", &file_metadata("sales.csv"));
        item.confidence = 0.5;

        let result = adapter.apply_domain_filtering(vec![item], "sales");
        assert_eq!(result[0].confidence, 0.5);
    }
}
