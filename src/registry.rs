// Adapter registry and retriever factory
// Two-level registry keyed by (kind, backend, name) holding constructor
// closures plus default config, and a factory mapping retriever_type
// strings to constructors. Constructors are closures so registration never
// forces eager imports of backend code.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::adapters::{FileAdapter, GenericAdapter, QaAdapter};
use crate::config::AppConfig;
use crate::contracts::{DocumentAdapter, Retriever};
use crate::errors::RetrievalError;

/// Closure that builds a document adapter from merged config.
pub type AdapterFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn DocumentAdapter>> + Send + Sync>;

/// Closure that builds a retriever from the application config.
pub type RetrieverConstructor =
    Arc<dyn Fn(&AppConfig) -> Result<Arc<dyn Retriever>> + Send + Sync>;

/// One registry entry.
#[derive(Clone)]
pub struct AdapterEntry {
    pub implementation: String,
    pub factory: Option<AdapterFactory>,
    pub config: Value,
}

/// Registry with `{kind -> backend -> name -> entry}` semantics, flattened
/// to a composite key.
#[derive(Default)]
pub struct AdapterRegistry {
    entries: RwLock<HashMap<(String, String, String), AdapterEntry>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Overwriting an existing registration is
    /// permitted and logged.
    pub fn register(
        &self,
        kind: &str,
        backend: &str,
        name: &str,
        implementation: &str,
        factory: Option<AdapterFactory>,
        config: Value,
    ) {
        let key = (kind.to_string(), backend.to_string(), name.to_string());
        let mut entries = self.entries.write().expect("adapter registry poisoned");
        if entries.contains_key(&key) {
            info!("Overwriting adapter registration: {kind}/{backend}/{name}");
        } else {
            info!("Registered adapter: type={kind}, datasource={backend}, name={name}");
        }
        entries.insert(
            key,
            AdapterEntry {
                implementation: implementation.to_string(),
                factory,
                config,
            },
        );
    }

    /// Pure lookup.
    pub fn get(&self, kind: &str, backend: &str, name: &str) -> Option<AdapterEntry> {
        self.entries
            .read()
            .expect("adapter registry poisoned")
            .get(&(kind.to_string(), backend.to_string(), name.to_string()))
            .cloned()
    }

    /// Create an adapter: merge default config with the override (override
    /// wins), prefer the factory closure, else resolve the implementation
    /// name against the built-in constructor table. An unregistered triple
    /// is also tried against the built-ins before failing.
    pub fn create(
        &self,
        kind: &str,
        backend: &str,
        name: &str,
        override_config: Option<&Value>,
    ) -> Result<Arc<dyn DocumentAdapter>> {
        info!("Creating adapter: type={kind}, datasource={backend}, name={name}");

        let entry = match self.get(kind, backend, name) {
            Some(entry) => entry,
            None => {
                // The lazy-resolution path: conventional implementations can
                // be constructed without prior registration
                info!("Adapter not registered, trying built-in implementations");
                AdapterEntry {
                    implementation: name.to_string(),
                    factory: None,
                    config: Value::Null,
                }
            }
        };

        let merged = merge_config(&entry.config, override_config);

        if let Some(factory) = &entry.factory {
            return factory(&merged);
        }

        match builtin_adapter(&entry.implementation, &merged)? {
            Some(adapter) => Ok(adapter),
            None => bail!(RetrievalError::AdapterNotFound {
                kind: kind.to_string(),
                backend: backend.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Register every complete entry of `cfg.adapters`; entries missing
    /// `type`, `datasource`, `adapter`, or `implementation` are skipped
    /// with a warning.
    pub fn load_from_config(&self, config: &AppConfig) -> usize {
        let mut registered = 0;
        for declaration in &config.adapters {
            if !declaration.enabled {
                continue;
            }
            let (Some(kind), Some(backend), Some(name), Some(implementation)) = (
                declaration.kind.as_deref(),
                declaration.datasource.as_deref(),
                declaration.adapter.as_deref(),
                declaration.implementation.as_deref(),
            ) else {
                warn!(
                    "Skipping adapter entry missing type/datasource/adapter/implementation: {declaration:?}"
                );
                continue;
            };

            self.register(
                kind,
                backend,
                name,
                implementation,
                None,
                declaration.config.clone(),
            );
            registered += 1;
        }
        registered
    }
}

/// Built-in constructors for the conventional adapter names. The intent
/// adapter loads its domain and template libraries from configured paths.
fn builtin_adapter(
    implementation: &str,
    config: &Value,
) -> Result<Option<Arc<dyn DocumentAdapter>>> {
    Ok(match implementation {
        "qa" => Some(Arc::new(QaAdapter::from_config(config)) as Arc<dyn DocumentAdapter>),
        "generic" => Some(Arc::new(GenericAdapter::from_config(config))),
        "file" => Some(Arc::new(FileAdapter::from_config(config))),
        "intent" => {
            let domain_path = config
                .get("domain_config_path")
                .and_then(Value::as_str)
                .map(std::path::Path::new);
            let template_paths: Vec<&std::path::Path> = config
                .get("template_library_path")
                .map(|value| match value {
                    Value::String(path) => vec![std::path::Path::new(path.as_str())],
                    Value::Array(paths) => paths
                        .iter()
                        .filter_map(Value::as_str)
                        .map(std::path::Path::new)
                        .collect(),
                    _ => Vec::new(),
                })
                .unwrap_or_default();
            let threshold = config
                .get("confidence_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(0.75) as f32;
            Some(Arc::new(crate::adapters::IntentAdapter::load(
                domain_path,
                &template_paths,
                threshold,
            )?))
        }
        _ => None,
    })
}

/// Merge override config over defaults, recursing into objects.
fn merge_config(default: &Value, override_config: Option<&Value>) -> Value {
    let Some(override_config) = override_config else {
        return default.clone();
    };
    match (default, override_config) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, value) in over {
                let merged_value = match merged.get(key) {
                    Some(existing) => merge_config(existing, Some(value)),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        (_, over) => over.clone(),
    }
}

/// Factory mapping `retriever_type` strings to constructors.
#[derive(Default)]
pub struct RetrieverFactory {
    constructors: RwLock<HashMap<String, RetrieverConstructor>>,
}

impl RetrieverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_retriever(&self, retriever_type: &str, constructor: RetrieverConstructor) {
        info!("Registered retriever type: {retriever_type}");
        self.constructors
            .write()
            .expect("retriever factory poisoned")
            .insert(retriever_type.to_string(), constructor);
    }

    pub fn create_retriever(
        &self,
        retriever_type: &str,
        config: &AppConfig,
    ) -> Result<Arc<dyn Retriever>> {
        let constructors = self.constructors.read().expect("retriever factory poisoned");
        let Some(constructor) = constructors.get(retriever_type) else {
            let mut valid: Vec<String> = constructors.keys().cloned().collect();
            valid.sort();
            bail!(RetrievalError::UnknownType {
                requested: retriever_type.to_string(),
                valid,
            });
        };
        info!("Creating retriever of type: {retriever_type}");
        constructor(config)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .constructors
            .read()
            .expect("retriever factory poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

static GLOBAL_REGISTRY: Lazy<AdapterRegistry> = Lazy::new(AdapterRegistry::new);
static GLOBAL_FACTORY: Lazy<RetrieverFactory> = Lazy::new(RetrieverFactory::new);

/// Process-wide adapter registry.
pub fn global_registry() -> &'static AdapterRegistry {
    &GLOBAL_REGISTRY
}

/// Process-wide retriever factory.
pub fn global_factory() -> &'static RetrieverFactory {
    &GLOBAL_FACTORY
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_get_create() -> Result<()> {
        let registry = AdapterRegistry::new();
        registry.register(
            "retriever",
            "chroma",
            "qa",
            "qa",
            None,
            json!({"confidence_threshold": 0.6}),
        );

        let entry = registry.get("retriever", "chroma", "qa").expect("registered");
        assert_eq!(entry.implementation, "qa");

        let adapter = registry.create("retriever", "chroma", "qa", None)?;
        // The adapter exists and behaves like a QA adapter
        assert!(adapter.extract_direct_answer(&[]).is_none());
        Ok(())
    }

    #[test]
    fn test_override_config_wins() -> Result<()> {
        let merged = merge_config(
            &json!({"a": 1, "nested": {"x": 1, "y": 2}}),
            Some(&json!({"nested": {"y": 3}, "b": 2})),
        );
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}}));
        Ok(())
    }

    #[test]
    fn test_overwrite_registration_permitted() {
        let registry = AdapterRegistry::new();
        registry.register("retriever", "chroma", "qa", "qa", None, Value::Null);
        registry.register("retriever", "chroma", "qa", "generic", None, Value::Null);
        let entry = registry.get("retriever", "chroma", "qa").unwrap();
        assert_eq!(entry.implementation, "generic");
    }

    #[test]
    fn test_unregistered_conventional_name_resolves() -> Result<()> {
        let registry = AdapterRegistry::new();
        // Never registered, but "generic" is a conventional implementation
        let adapter = registry.create("retriever", "qdrant", "generic", None)?;
        assert!(adapter.extract_direct_answer(&[]).is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_adapter_fails() {
        let registry = AdapterRegistry::new();
        let result = registry.create("retriever", "chroma", "no_such_adapter", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_factory_closure_preferred() -> Result<()> {
        let registry = AdapterRegistry::new();
        registry.register(
            "retriever",
            "sqlite",
            "custom",
            "ignored",
            Some(Arc::new(|config: &Value| {
                let threshold = config
                    .get("confidence_threshold")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0) as f32;
                Ok(Arc::new(GenericAdapter::new(threshold)) as Arc<dyn DocumentAdapter>)
            })),
            json!({"confidence_threshold": 0.4}),
        );

        let adapter = registry.create("retriever", "sqlite", "custom", None)?;
        assert!(adapter.extract_direct_answer(&[]).is_none());
        Ok(())
    }

    #[test]
    fn test_load_from_config_skips_incomplete() -> Result<()> {
        let yaml = r#"
adapters:
  - type: retriever
    datasource: chroma
    adapter: qa
    implementation: qa
  - type: retriever
    datasource: chroma
  - type: retriever
    datasource: sqlite
    adapter: generic
    implementation: generic
    enabled: false
"#;
        let config = AppConfig::from_yaml(yaml)?;
        let registry = AdapterRegistry::new();
        assert_eq!(registry.load_from_config(&config), 1);
        assert!(registry.get("retriever", "chroma", "qa").is_some());
        assert!(registry.get("retriever", "sqlite", "generic").is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_retriever_type_lists_valid() {
        let factory = RetrieverFactory::new();
        let config = AppConfig::default();
        let error = factory
            .create_retriever("graph", &config)
            .unwrap_err()
            .to_string();
        assert!(error.contains("graph"));
    }
}
