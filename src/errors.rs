// Error taxonomy for the retrieval core
// Errors are propagated by kind: callers match on the variant, not on the
// backend that produced it.

use thiserror::Error;

/// Errors surfaced by retrievers and the registries that build them.
///
/// Policy per variant:
/// - `ConfigInvalid` and `BackendUnavailable` propagate at initialize.
/// - `CollectionNotFound` propagates from `set_collection`.
/// - `DimensionMismatch` is logged and converted to an empty result list
///   inside the vector pipeline; it never crosses `get_relevant_context`.
/// - `Timeout` stays internal to the composite router, where a timed-out
///   child contributes no matches rather than an error.
/// - Intent pipelines convert all post-initialize failures into sentinel
///   context items and never return an error from a query.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("no collection available; configure a default collection or supply one per request")]
    NoCollection,

    #[error("embedding dimension mismatch: query has {query} dimensions, collection expects {expected}")]
    DimensionMismatch { query: usize, expected: usize },

    #[error("unknown retriever type: {requested}. Valid types: {valid:?}")]
    UnknownType {
        requested: String,
        valid: Vec<String>,
    },

    #[error("adapter not found: type={kind}, datasource={backend}, name={name}")]
    AdapterNotFound {
        kind: String,
        backend: String,
        name: String,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid api key")]
    InvalidApiKey,
}

/// Per-template failure inside the intent pipeline. Internal control flow:
/// a failed attempt advances to the next candidate template, and the final
/// outcome is reported as a sentinel context item rather than an error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("similarity {0} below confidence threshold")]
    BelowThreshold(f32),

    #[error("parameter validation failed: {0}")]
    ParameterValidation(String),

    #[error("template execution failed: {0}")]
    Execution(String),
}

/// Scan backend error text for the dimension-mismatch signature shared by
/// the supported vector stores.
pub fn is_dimension_mismatch(message: &str) -> bool {
    static PATTERN: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"(?i)dimension.*(match|expect)").expect("valid regex")
    });
    PATTERN.is_match(message)
}

/// Scan driver error text for the closed/lost-connection signature that
/// triggers the single reconnect-and-retry inside SQL query execution.
pub fn is_connection_dropped(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("connection")
        && (lower.contains("closed") || lower.contains("lost") || lower.contains("broken"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_detection() {
        assert!(is_dimension_mismatch(
            "Vector dimension 384 does not match collection dimensionality 768"
        ));
        assert!(is_dimension_mismatch(
            "Dimension of query vector 768, expected 384"
        ));
        assert!(is_dimension_mismatch(
            "Embedding dimension 16 does not match collection dimensionality 384"
        ));
        assert!(!is_dimension_mismatch("collection not found"));
        assert!(!is_dimension_mismatch("dimension looks fine"));
    }

    #[test]
    fn test_connection_dropped_detection() {
        assert!(is_connection_dropped("Connection closed by peer"));
        assert!(is_connection_dropped("the connection was lost"));
        assert!(is_connection_dropped("broken connection state"));
        assert!(!is_connection_dropped("syntax error near SELECT"));
        assert!(!is_connection_dropped("file closed"));
    }

    #[test]
    fn test_unknown_type_lists_valid_types() {
        let err = RetrievalError::UnknownType {
            requested: "graph".to_string(),
            valid: vec!["vector".to_string(), "intent_sql".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("graph"));
        assert!(message.contains("vector"));
        assert!(message.contains("intent_sql"));
    }

    #[test]
    fn test_collection_not_found_display() {
        let err = RetrievalError::CollectionNotFound("faq".to_string());
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains("faq"));
    }

    #[test]
    fn test_dimension_mismatch_display_names_both_dimensions() {
        let err = RetrievalError::DimensionMismatch {
            query: 384,
            expected: 768,
        };
        let message = err.to_string();
        assert!(message.contains("384"));
        assert!(message.contains("768"));
    }

    #[test]
    fn test_exec_error_display() {
        assert!(ExecError::BelowThreshold(0.3)
            .to_string()
            .contains("below confidence threshold"));
        assert!(ExecError::ParameterValidation("missing customer_name".to_string())
            .to_string()
            .contains("missing customer_name"));
        assert!(ExecError::Execution("HTTP request failed with status 502".to_string())
            .to_string()
            .contains("502"));
    }
}
