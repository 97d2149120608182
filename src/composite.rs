// Composite intent router
// Fans one query across the template stores of named child intent
// retrievers, picks the single best match across all sources, and delegates
// execution to the owning child. Children are resolved through the adapter
// manager and are never closed here; the manager owns their lifetime.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::contracts::{AdapterManager, Embedder, IntentChild, Retriever};
use crate::errors::RetrievalError;
use crate::types::{ContextItem, QueryOptions, TemplateMatch};

/// Tunables for the composite router.
#[derive(Debug, Clone)]
pub struct CompositeSettings {
    pub child_adapter_names: Vec<String>,
    pub confidence_threshold: f32,
    pub max_templates_per_source: usize,
    pub search_timeout: Duration,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self {
            child_adapter_names: Vec::new(),
            confidence_threshold: 0.4,
            max_templates_per_source: 3,
            search_timeout: Duration::from_secs(5),
        }
    }
}

impl CompositeSettings {
    /// Read from `adapter_config`: `{child_adapters, confidence_threshold,
    /// max_templates_per_source, search_timeout}`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let section = &config.adapter_config;
        let child_adapter_names: Vec<String> = section
            .get("child_adapters")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if child_adapter_names.is_empty() {
            bail!(RetrievalError::ConfigInvalid(
                "child_adapters is required in adapter configuration".to_string()
            ));
        }

        let defaults = Self::default();
        Ok(Self {
            child_adapter_names,
            confidence_threshold: section
                .get("confidence_threshold")
                .and_then(Value::as_f64)
                .map(|v| v as f32)
                .unwrap_or(defaults.confidence_threshold),
            max_templates_per_source: section
                .get("max_templates_per_source")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(defaults.max_templates_per_source),
            search_timeout: section
                .get("search_timeout")
                .and_then(Value::as_f64)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.search_timeout),
        })
    }
}

/// Router over child intent retrievers. Holds lookup handles only;
/// ownership of the children stays with the adapter manager.
pub struct CompositeIntentRetriever {
    settings: CompositeSettings,
    manager: Arc<dyn AdapterManager>,
    embedder: Arc<dyn Embedder>,
    children: RwLock<Vec<(String, Arc<dyn IntentChild>)>>,
    initialized: RwLock<bool>,
}

impl CompositeIntentRetriever {
    pub fn new(
        settings: CompositeSettings,
        manager: Arc<dyn AdapterManager>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        info!(
            "Composite intent retriever configured with {} child adapters: {:?}",
            settings.child_adapter_names.len(),
            settings.child_adapter_names
        );
        Self {
            settings,
            manager,
            embedder,
            children: RwLock::new(Vec::new()),
            initialized: RwLock::new(false),
        }
    }

    async fn resolve_children(&self) -> Result<()> {
        let mut resolved = Vec::new();
        for name in &self.settings.child_adapter_names {
            match self.manager.get_intent_child(name).await {
                Ok(Some(child)) => {
                    debug!("Resolved child adapter: {name}");
                    resolved.push((name.clone(), child));
                }
                Ok(None) => warn!("Child adapter '{name}' not found, skipping"),
                Err(err) => error!("Failed to resolve child adapter '{name}': {err}"),
            }
        }

        if resolved.is_empty() {
            bail!(RetrievalError::ConfigInvalid(format!(
                "no valid child adapters could be resolved from: {:?}",
                self.settings.child_adapter_names
            )));
        }

        info!("Resolved {} child adapters", resolved.len());
        *self.children.write().await = resolved;
        Ok(())
    }

    async fn searched_names(&self) -> Vec<String> {
        self.children
            .read()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Search every child's template store concurrently, each under the
    /// per-child timeout. A timed-out or failed child contributes no
    /// matches. Results are merged and sorted by similarity.
    async fn search_all_stores(&self, query: &str) -> Result<Vec<TemplateMatch>> {
        let embedding = self.embedder.embed_query(query).await?;
        if embedding.is_empty() {
            error!("Failed to generate query embedding");
            return Ok(Vec::new());
        }
        debug!("Generated query embedding with {} dimensions", embedding.len());

        let children = self.children.read().await.clone();
        let searches = children.iter().map(|(name, child)| {
            let name = name.clone();
            let child = child.clone();
            let embedding = embedding.clone();
            let limit = self.settings.max_templates_per_source;
            let threshold = self.settings.confidence_threshold;
            let timeout = self.settings.search_timeout;

            async move {
                match tokio::time::timeout(
                    timeout,
                    child.search_templates(&embedding, limit, threshold),
                )
                .await
                {
                    Ok(Ok(mut matches)) => {
                        for candidate in matches.iter_mut() {
                            candidate.source_adapter = Some(name.clone());
                        }
                        debug!("Found {} template matches from '{name}'", matches.len());
                        matches
                    }
                    Ok(Err(err)) => {
                        error!("Error searching template store for '{name}': {err}");
                        Vec::new()
                    }
                    Err(_) => {
                        warn!("Template search timeout for adapter '{name}'");
                        Vec::new()
                    }
                }
            }
        });

        let mut all_matches: Vec<TemplateMatch> =
            join_all(searches).await.into_iter().flatten().collect();

        all_matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(
            "Found {} total template matches across {} adapters",
            all_matches.len(),
            children.len()
        );
        Ok(all_matches)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if !*self.initialized.read().await {
            self.initialize().await?;
        }
        Ok(())
    }

    fn error_item(
        content: &str,
        error_kind: &str,
        extra: Vec<(&str, Value)>,
    ) -> ContextItem {
        let mut item = ContextItem::new(content, "")
            .with_metadata("source", json!("composite_intent"))
            .with_metadata("error", json!(error_kind))
            .with_confidence(0.0);
        for (key, value) in extra {
            item.metadata.insert(key.to_string(), value);
        }
        item
    }
}

#[async_trait]
impl Retriever for CompositeIntentRetriever {
    async fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.write().await;
        if *initialized {
            return Ok(());
        }
        self.resolve_children().await?;
        *initialized = true;
        info!("Composite intent retriever initialization complete");
        Ok(())
    }

    /// Children belong to the adapter manager and stay open.
    async fn close(&self) -> Result<()> {
        *self.initialized.write().await = false;
        self.children.write().await.clear();
        debug!("Composite intent retriever closed");
        Ok(())
    }

    /// Children manage their own collections; nothing to bind here.
    async fn set_collection(&self, name: &str) -> Result<()> {
        debug!("Composite retriever ignoring set_collection('{name}'), children manage their own");
        Ok(())
    }

    async fn get_relevant_context(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ContextItem>> {
        self.ensure_initialized().await?;
        debug!("Composite intent retriever processing query: {query}");

        let all_matches = match self.search_all_stores(query).await {
            Ok(matches) => matches,
            Err(err) => {
                error!("Composite template search failed: {err}");
                Vec::new()
            }
        };

        let searched = self.searched_names().await;

        if all_matches.is_empty() {
            warn!("No matching templates found across any child adapters");
            return Ok(vec![Self::error_item(
                "I couldn't find a matching query pattern across any data sources.",
                "no_matching_template",
                vec![("searched_adapters", json!(searched))],
            )]);
        }

        let best = &all_matches[0];
        if best.similarity < self.settings.confidence_threshold {
            warn!("No template matches met the confidence threshold");
            return Ok(vec![Self::error_item(
                "I found potential matches but none met the confidence threshold.",
                "below_threshold",
                vec![
                    ("searched_adapters", json!(searched)),
                    ("best_score", json!(best.similarity)),
                ],
            )]);
        }

        let source_name = best
            .source_adapter
            .clone()
            .unwrap_or_default();
        let child = {
            let children = self.children.read().await;
            children
                .iter()
                .find(|(name, _)| *name == source_name)
                .map(|(_, child)| child.clone())
        };

        let Some(child) = child else {
            error!("Source adapter '{source_name}' not found in cache");
            return Ok(vec![Self::error_item(
                "An error occurred routing to the data source.",
                "adapter_not_found",
                vec![("attempted_adapter", json!(source_name))],
            )]);
        };

        debug!(
            "Routing query to adapter '{source_name}' for template '{}'",
            best.template_id
        );

        let mut results = child.get_relevant_context(query, options).await?;

        let routing_value = json!({
            "selected_adapter": source_name,
            "template_id": best.template_id,
            "similarity_score": best.similarity,
            "adapters_searched": searched,
            "total_matches_found": all_matches.len(),
        });

        for result in results.iter_mut() {
            result
                .metadata
                .insert("composite_routing".to_string(), routing_value.clone());
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() -> Result<()> {
        let yaml = r#"
adapter_config:
  child_adapters: [sales, support]
  confidence_threshold: 0.5
  search_timeout: 2.5
"#;
        let config = AppConfig::from_yaml(yaml)?;
        let settings = CompositeSettings::from_config(&config)?;
        assert_eq!(settings.child_adapter_names, vec!["sales", "support"]);
        assert_eq!(settings.confidence_threshold, 0.5);
        assert_eq!(settings.search_timeout, Duration::from_secs_f64(2.5));
        assert_eq!(settings.max_templates_per_source, 3);
        Ok(())
    }

    #[test]
    fn test_settings_require_children() -> Result<()> {
        let config = AppConfig::from_yaml("adapter_config: {}")?;
        assert!(CompositeSettings::from_config(&config).is_err());
        Ok(())
    }
}
