// Configuration model for the retrieval core
// Loaded from YAML once per process and treated as read-only afterwards.
// Connection parameters support `${VAR}` environment references resolved at
// pull time, and secret-looking keys are masked in logs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Top-level application configuration consumed by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub embedding: EmbeddingSection,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub adapters: Vec<AdapterDeclaration>,
    /// Free-form configuration block consumed by composite adapters.
    #[serde(default)]
    pub adapter_config: Value,
    #[serde(default)]
    pub messages: MessagesConfig,
}

impl AppConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("failed to parse application config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        Self::from_yaml(&text)
    }

    /// Datasource section for a named backend, or an empty default.
    pub fn datasource(&self, name: &str) -> DatasourceConfig {
        self.datasources.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub provider: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceSection {
    #[serde(default)]
    pub provider: Option<String>,
}

/// Per-datasource configuration. Typed fields cover the knobs every
/// retriever understands; everything else (host, port, credentials, index
/// names) stays in `params` and is pulled through `param`/`param_str`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_return_results")]
    pub return_results: usize,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub auto_create_collection: bool,
    #[serde(default = "default_distance_scaling")]
    pub distance_scaling_factor: f32,
    #[serde(default = "default_score_scaling")]
    pub score_scaling_factor: f32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Backend-specific connection parameters.
    #[serde(flatten)]
    pub params: HashMap<String, Value>,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            relevance_threshold: default_relevance_threshold(),
            max_results: default_max_results(),
            return_results: default_return_results(),
            collection: None,
            auto_create_collection: false,
            distance_scaling_factor: default_distance_scaling(),
            score_scaling_factor: default_score_scaling(),
            connection_timeout: default_connection_timeout(),
            params: HashMap::new(),
        }
    }
}

impl DatasourceConfig {
    /// Fetch a raw connection parameter with `${VAR}` resolution applied to
    /// string values. Missing env vars warn and fall back to the default.
    pub fn param(&self, key: &str, default: Value) -> Value {
        let value = self.params.get(key).cloned().unwrap_or(default.clone());
        log_config_value(key, &value);
        match value {
            Value::String(text) => resolve_env(&text)
                .map(Value::String)
                .unwrap_or(default),
            other => other,
        }
    }

    pub fn param_str(&self, key: &str, default: &str) -> String {
        match self.param(key, Value::String(default.to_string())) {
            Value::String(text) => text,
            other => other.to_string(),
        }
    }

    pub fn param_u16(&self, key: &str, default: u16) -> u16 {
        match self.param(key, Value::from(default)) {
            Value::Number(n) => n.as_u64().map(|v| v as u16).unwrap_or(default),
            Value::String(text) => text.parse().unwrap_or_else(|_| {
                warn!("Invalid port '{text}', using default {default}");
                default
            }),
            _ => default,
        }
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        match self.params.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true" || s == "1",
            _ => default,
        }
    }
}

/// Store definitions, currently vector stores only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoresConfig {
    #[serde(default)]
    pub vector_stores: HashMap<String, VectorStoreConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(rename = "type", default)]
    pub store_type: String,
    #[serde(default)]
    pub connection_params: HashMap<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub auto_cleanup: bool,
}

/// One entry in the `adapters` list. All four identity fields are required
/// for registration; incomplete entries are skipped with a warning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterDeclaration {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub datasource: Option<String>,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_collection_not_found")]
    pub collection_not_found: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            collection_not_found: default_collection_not_found(),
        }
    }
}

/// Resolve a `${VAR_NAME}` reference against the environment. Plain strings
/// pass through unchanged; a missing variable warns and returns None so the
/// caller can substitute its default.
pub fn resolve_env(value: &str) -> Option<String> {
    if let Some(name) = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        match std::env::var(name) {
            Ok(resolved) => {
                debug!("Resolved env var '{name}'");
                Some(resolved)
            }
            Err(_) => {
                warn!("Environment variable {name} not found, using default");
                None
            }
        }
    } else {
        Some(value.to_string())
    }
}

const SECRET_KEYS: &[&str] = &["password", "pass", "pwd", "secret", "token", "api_key"];

fn log_config_value(key: &str, value: &Value) {
    let lower = key.to_lowercase();
    if SECRET_KEYS.iter().any(|secret| lower.contains(secret)) {
        debug!("Config key '{key}': [MASKED]");
    } else {
        debug!("Config key '{key}': {value}");
    }
}

/// Mask a secret for display, keeping only its length.
pub fn mask_secret(value: &str) -> String {
    "*".repeat(value.len())
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_relevance_threshold() -> f32 {
    0.5
}

fn default_max_results() -> usize {
    10
}

fn default_return_results() -> usize {
    3
}

fn default_distance_scaling() -> f32 {
    200.0
}

fn default_score_scaling() -> f32 {
    1.0
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_collection_not_found() -> String {
    "Collection not found. Ensure the collection exists or check your configuration.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_config() -> Result<()> {
        let yaml = r#"
general:
  verbose: true
embedding:
  enabled: true
  provider: openai
inference:
  provider: ollama
datasources:
  chroma:
    host: localhost
    port: 8000
    confidence_threshold: 0.5
    return_results: 2
    collection: faq
adapters:
  - type: retriever
    datasource: chroma
    adapter: qa
    implementation: qa
"#;
        let config = AppConfig::from_yaml(yaml)?;
        assert!(config.general.verbose);
        assert_eq!(config.embedding.provider.as_deref(), Some("openai"));

        let chroma = config.datasource("chroma");
        assert_eq!(chroma.confidence_threshold, 0.5);
        assert_eq!(chroma.return_results, 2);
        assert_eq!(chroma.collection.as_deref(), Some("faq"));
        assert_eq!(chroma.param_str("host", "127.0.0.1"), "localhost");
        assert_eq!(chroma.param_u16("port", 9000), 8000);
        Ok(())
    }

    #[test]
    fn test_datasource_defaults() {
        let ds = DatasourceConfig::default();
        assert_eq!(ds.confidence_threshold, 0.7);
        assert_eq!(ds.relevance_threshold, 0.5);
        assert_eq!(ds.max_results, 10);
        assert_eq!(ds.return_results, 3);
        assert_eq!(ds.distance_scaling_factor, 200.0);
    }

    #[test]
    fn test_env_resolution() {
        std::env::set_var("CONTEXTDB_TEST_HOST", "db.internal");
        assert_eq!(
            resolve_env("${CONTEXTDB_TEST_HOST}").as_deref(),
            Some("db.internal")
        );
        assert_eq!(resolve_env("plain-value").as_deref(), Some("plain-value"));
        assert_eq!(resolve_env("${CONTEXTDB_TEST_MISSING}"), None);
    }

    #[test]
    fn test_param_env_fallback_to_default() {
        let mut ds = DatasourceConfig::default();
        ds.params.insert(
            "password".to_string(),
            Value::String("${CONTEXTDB_TEST_NO_SUCH_VAR}".to_string()),
        );
        assert_eq!(ds.param_str("password", "fallback"), "fallback");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("hunter2"), "*******");
    }
}
