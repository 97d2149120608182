// Intent pipeline
// NL -> template match -> parameter extraction -> execution -> answer.
// The pipeline owns the template store, extractor, reranker, processor, and
// response generator; SQL and HTTP retrievers plug in as executors. After a
// successful initialize a query never fails: every outcome is a context
// item, including the no_matching_template and parameter_extraction_failed
// sentinels.

pub mod http;
pub mod processor;
pub mod reranker;
pub mod template_store;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::adapters::IntentAdapter;
use crate::config::DatasourceConfig;
use crate::contracts::{Embedder, Inference, IntentChild, Retriever};
use crate::domain::extraction::DomainParameterExtractor;
use crate::domain::response::DomainResponseGenerator;
use crate::domain::strategy::DomainStrategyRegistry;
use crate::errors::ExecError;
use crate::sql::{execute_with_recovery, prepare_statement, SqlDriver};
use crate::templates::{embedding_text, template_metadata, Template};
use crate::types::{ContextItem, QueryOptions, TemplateMatch};

use processor::TemplateProcessor;
use reranker::TemplateReranker;
use template_store::TemplateStore;

/// Tunables for an intent pipeline.
#[derive(Debug, Clone)]
pub struct IntentSettings {
    pub template_collection_name: String,
    pub confidence_threshold: f32,
    pub max_templates: usize,
    pub reload_templates_on_start: bool,
    pub force_reload_templates: bool,
    /// Persist the template store here; None keeps it in memory.
    pub store_path: Option<PathBuf>,
    /// Wrap name-like string parameters as %value% when the SQL uses LIKE.
    pub wrap_like_parameters: bool,
}

impl Default for IntentSettings {
    fn default() -> Self {
        Self {
            template_collection_name: "intent_query_templates".to_string(),
            confidence_threshold: 0.75,
            max_templates: 5,
            reload_templates_on_start: true,
            force_reload_templates: false,
            store_path: None,
            wrap_like_parameters: true,
        }
    }
}

impl IntentSettings {
    pub fn from_datasource(datasource: &DatasourceConfig) -> Self {
        let store_path = datasource.param_str("template_store_path", "");
        Self {
            template_collection_name: datasource
                .param_str("template_collection_name", "intent_query_templates"),
            confidence_threshold: datasource.confidence_threshold,
            max_templates: datasource
                .param("max_templates", Value::from(5))
                .as_u64()
                .unwrap_or(5) as usize,
            reload_templates_on_start: datasource.param_bool("reload_templates_on_start", true),
            force_reload_templates: datasource.param_bool("force_reload_templates", false),
            store_path: if store_path.is_empty() {
                None
            } else {
                Some(PathBuf::from(store_path))
            },
            wrap_like_parameters: datasource.param_bool("wrap_like_parameters", true),
        }
    }
}

/// Output of one template execution: portable rows plus optional
/// display-ready payload (HTTP/tabular backends).
pub struct ExecutionOutput {
    pub rows: Vec<Map<String, Value>>,
    pub formatted_data: Option<Value>,
}

/// Backend half of an intent retriever: render and run one template.
#[async_trait]
pub trait TemplateExecutor: Send + Sync {
    async fn execute(
        &self,
        template: &Template,
        parameters: &Map<String, Value>,
        processor: &TemplateProcessor,
    ) -> Result<ExecutionOutput>;
}

/// Shared state and logic for intent retrievers.
pub struct IntentPipeline {
    adapter: Arc<IntentAdapter>,
    embedder: Arc<dyn Embedder>,
    settings: IntentSettings,
    store: RwLock<Option<TemplateStore>>,
    extractor: DomainParameterExtractor,
    responder: DomainResponseGenerator,
    reranker: TemplateReranker,
    processor: TemplateProcessor,
}

impl IntentPipeline {
    pub fn new(
        adapter: Arc<IntentAdapter>,
        embedder: Arc<dyn Embedder>,
        inference: Arc<dyn Inference>,
        settings: IntentSettings,
    ) -> Self {
        let domain = adapter.domain_config();
        let strategy = DomainStrategyRegistry::new().get_strategy(domain.clone());

        Self {
            extractor: DomainParameterExtractor::new(
                inference.clone(),
                domain.clone(),
                strategy.clone(),
            ),
            responder: DomainResponseGenerator::new(inference, domain.clone(), strategy.clone()),
            reranker: TemplateReranker::new(domain.clone(), strategy),
            processor: TemplateProcessor::new(&domain),
            adapter,
            embedder,
            settings,
            store: RwLock::new(None),
        }
    }

    pub fn processor(&self) -> &TemplateProcessor {
        &self.processor
    }

    pub fn template_count(&self) -> usize {
        self.adapter.template_count()
    }

    pub async fn store_count(&self) -> usize {
        match &*self.store.read().await {
            Some(store) => store.count(),
            None => 0,
        }
    }

    /// Open the template store, rebuild it on a dimension change, and load
    /// template embeddings unless a warm persistent store makes the reload
    /// unnecessary.
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.store.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let dimension = self.embedder.dimension();
        let mut store = TemplateStore::open(
            &self.settings.template_collection_name,
            self.settings.store_path.as_deref(),
            dimension,
        )?;

        let dimension_changed = store.dimension() != dimension;
        if dimension_changed {
            info!(
                "Template store dimension {} differs from embedder dimension {dimension}, rebuilding",
                store.dimension()
            );
            store.recreate(dimension)?;
        }

        let warm_store = !store.is_empty()
            && !dimension_changed
            && !self.settings.force_reload_templates
            && !self.settings.reload_templates_on_start;
        if warm_store {
            info!(
                "Template store '{}' holds {} templates, skipping reload",
                self.settings.template_collection_name,
                store.count()
            );
            *guard = Some(store);
            return Ok(());
        }

        self.load_templates(&mut store).await?;
        *guard = Some(store);
        Ok(())
    }

    async fn load_templates(&self, store: &mut TemplateStore) -> Result<()> {
        let templates = self.adapter.all_templates();
        if templates.is_empty() {
            warn!("No templates found in template library");
            return Ok(());
        }

        let domain = self.adapter.domain_config();
        let texts: Vec<String> = templates
            .iter()
            .map(|template| embedding_text(template, Some(&domain)))
            .collect();

        info!("Loading {} templates into the template store", templates.len());
        let embeddings = self.embedder.embed_batch(&texts).await?;

        if !store.is_empty() {
            store.recreate(self.embedder.dimension())?;
        }

        let mut loaded = 0;
        for ((template, text), embedding) in templates.iter().zip(&texts).zip(embeddings) {
            if template.id.is_empty() || embedding.is_empty() {
                continue;
            }
            store.insert(
                &template.id,
                embedding,
                text.clone(),
                template_metadata(template),
            )?;
            loaded += 1;
        }
        store.persist()?;
        info!("Loaded {loaded} templates into the template store");
        Ok(())
    }

    /// Search the store with a pre-computed embedding and hydrate matches
    /// from the adapter's library.
    pub async fn search_templates(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<TemplateMatch>> {
        let guard = self.store.read().await;
        let store = guard
            .as_ref()
            .ok_or_else(|| anyhow!("intent pipeline not initialized"))?;

        let matches = store.search_similar(query_embedding, limit, threshold)?;
        Ok(matches
            .into_iter()
            .filter_map(|candidate| {
                let template = self.adapter.template_by_id(&candidate.template_id)?;
                Some(TemplateMatch::new(
                    Arc::new(template.clone()),
                    candidate.similarity,
                    candidate.document,
                ))
            })
            .collect())
    }

    /// Run the full query pipeline against the given executor. Always
    /// returns at least one context item.
    pub async fn run_query(
        &self,
        query: &str,
        executor: &dyn TemplateExecutor,
    ) -> Vec<ContextItem> {
        debug!("Processing intent query: {query}");

        let embedding = match self.embedder.embed_query(query).await {
            Ok(embedding) if !embedding.is_empty() => embedding,
            Ok(_) => return vec![no_matching_template_item("intent")],
            Err(err) => {
                warn!("Failed to embed intent query: {err}");
                return vec![no_matching_template_item("intent")];
            }
        };

        let matches = match self
            .search_templates(&embedding, self.settings.max_templates, 0.0)
            .await
        {
            Ok(matches) => matches,
            Err(err) => {
                warn!("Template search failed: {err}");
                return vec![no_matching_template_item("intent")];
            }
        };

        if matches.is_empty() {
            warn!("No matching templates found");
            return vec![no_matching_template_item("intent")];
        }

        let matches = self.reranker.rerank(matches, query);

        for candidate in &matches {
            match self.try_template(query, candidate, executor).await {
                Ok(item) => return vec![item],
                Err(ExecError::BelowThreshold(similarity)) => {
                    debug!(
                        "Template {} below threshold ({similarity:.3} < {})",
                        candidate.template_id, self.settings.confidence_threshold
                    );
                }
                Err(ExecError::ParameterValidation(message)) => {
                    warn!(
                        "Parameter validation failed for {}: {message}",
                        candidate.template_id
                    );
                }
                Err(ExecError::Execution(message)) => {
                    debug!(
                        "Template {} execution failed: {message}",
                        candidate.template_id
                    );
                }
            }
        }

        vec![extraction_failed_item("intent")]
    }

    async fn try_template(
        &self,
        query: &str,
        candidate: &TemplateMatch,
        executor: &dyn TemplateExecutor,
    ) -> std::result::Result<ContextItem, ExecError> {
        if candidate.similarity < self.settings.confidence_threshold {
            return Err(ExecError::BelowThreshold(candidate.similarity));
        }

        let template = &candidate.template;
        debug!(
            "Trying template {} (similarity {:.2})",
            template.id, candidate.similarity
        );

        let parameters = self.extractor.extract_parameters(query, template).await;
        let (valid, errors) = self.extractor.validate_parameters(&parameters, template);
        if !valid {
            return Err(ExecError::ParameterValidation(format!("{errors:?}")));
        }

        let mut parameter_map: Map<String, Value> = parameters.into_iter().collect();
        if self.settings.wrap_like_parameters {
            if let Some(sql) = &template.sql_template {
                wrap_like_parameters(sql, &mut parameter_map);
            }
        }

        let output = executor
            .execute(template, &parameter_map, &self.processor)
            .await
            .map_err(|err| ExecError::Execution(err.to_string()))?;

        let answer = self
            .responder
            .generate_response(query, &output.rows, template, None, None)
            .await;

        let mut item = ContextItem::new(answer, serde_json::to_string(&output.rows).unwrap_or_default());
        item.confidence = candidate.similarity;
        item.metadata.insert("source".to_string(), json!("intent"));
        item.metadata
            .insert("template_id".to_string(), json!(template.id));
        item.metadata
            .insert("query_intent".to_string(), json!(template.description));
        item.metadata.insert(
            "parameters_used".to_string(),
            Value::Object(parameter_map),
        );
        item.metadata
            .insert("results".to_string(), json!(output.rows));
        item.metadata
            .insert("similarity".to_string(), json!(candidate.similarity));
        item.metadata
            .insert("result_count".to_string(), json!(output.rows.len()));
        if let Some(formatted) = output.formatted_data {
            item.metadata.insert("formatted_data".to_string(), formatted);
        }

        Ok(item)
    }
}

/// Wrap name-carrying string parameters as `%value%` for LIKE matching,
/// stripping outer whitespace and quotes first. Source-faithful heuristic,
/// switchable via `IntentSettings::wrap_like_parameters`.
pub fn wrap_like_parameters(sql_template: &str, parameters: &mut Map<String, Value>) {
    if !sql_template.to_uppercase().contains("LIKE") {
        return;
    }

    for (name, value) in parameters.iter_mut() {
        if !name.to_lowercase().contains("name") {
            continue;
        }
        let Some(text) = value.as_str() else {
            continue;
        };
        let cleaned = text
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        if cleaned.is_empty() {
            continue;
        }
        *value = Value::String(format!("%{cleaned}%"));
    }
}

pub(crate) fn no_matching_template_item(source: &str) -> ContextItem {
    ContextItem::new(
        "I couldn't find a matching query pattern for your request.",
        "",
    )
    .with_metadata("source", json!(source))
    .with_metadata("error", json!("no_matching_template"))
    .with_confidence(0.0)
}

pub(crate) fn extraction_failed_item(source: &str) -> ContextItem {
    ContextItem::new(
        "I found potential matches but couldn't extract the required information.",
        "",
    )
    .with_metadata("source", json!(source))
    .with_metadata("error", json!("parameter_extraction_failed"))
    .with_confidence(0.0)
}

/// Intent retriever over a SQL driver.
pub struct IntentSqlRetriever {
    pipeline: IntentPipeline,
    driver: Arc<dyn SqlDriver>,
    collection: Mutex<Option<String>>,
    initialized: RwLock<bool>,
    reconnects: AtomicUsize,
}

impl IntentSqlRetriever {
    pub fn new(
        adapter: Arc<IntentAdapter>,
        embedder: Arc<dyn Embedder>,
        inference: Arc<dyn Inference>,
        driver: Arc<dyn SqlDriver>,
        settings: IntentSettings,
    ) -> Self {
        Self {
            pipeline: IntentPipeline::new(adapter, embedder, inference, settings),
            driver,
            collection: Mutex::new(None),
            initialized: RwLock::new(false),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn pipeline(&self) -> &IntentPipeline {
        &self.pipeline
    }

    /// How many dropped-connection recoveries have occurred.
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if !*self.initialized.read().await {
            self.initialize().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateExecutor for IntentSqlRetriever {
    async fn execute(
        &self,
        template: &Template,
        parameters: &Map<String, Value>,
        processor: &TemplateProcessor,
    ) -> Result<ExecutionOutput> {
        let sql_template = template
            .sql_template
            .as_deref()
            .ok_or_else(|| anyhow!("template {} has no SQL body", template.id))?;

        let runtime: HashMap<String, Value> = parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let rendered = processor.render_sql(sql_template, &runtime)?;
        debug!("Executing SQL: {rendered}");

        let (statement, binds) = prepare_statement(&rendered, parameters);
        let rows =
            execute_with_recovery(self.driver.as_ref(), &statement, &binds, &self.reconnects)
                .await?;

        Ok(ExecutionOutput {
            rows,
            formatted_data: None,
        })
    }
}

#[async_trait]
impl Retriever for IntentSqlRetriever {
    async fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.write().await;
        if *initialized {
            return Ok(());
        }

        self.driver.connect().await?;
        self.pipeline.initialize().await?;
        *initialized = true;
        info!("Intent SQL retriever initialized ({})", self.driver.name());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut initialized = self.initialized.write().await;
        if !*initialized {
            return Ok(());
        }
        *initialized = false;
        // Embedder and inference are shared capabilities; only the driver
        // belongs to this retriever
        self.driver.close().await
    }

    async fn set_collection(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            bail!(crate::errors::RetrievalError::CollectionNotFound(
                String::new()
            ));
        }
        *self.collection.lock().await = Some(name.to_string());
        debug!("Intent SQL retriever switched to table '{name}'");
        Ok(())
    }

    async fn get_relevant_context(
        &self,
        query: &str,
        _options: &QueryOptions,
    ) -> Result<Vec<ContextItem>> {
        if let Err(err) = self.ensure_initialized().await {
            return Err(err);
        }
        Ok(self.pipeline.run_query(query, self).await)
    }
}

#[async_trait]
impl IntentChild for IntentSqlRetriever {
    async fn search_templates(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<TemplateMatch>> {
        self.pipeline
            .search_templates(query_embedding, limit, threshold)
            .await
    }

    async fn get_relevant_context(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ContextItem>> {
        Retriever::get_relevant_context(self, query, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_like_parameters() {
        let sql = "SELECT id FROM orders WHERE name LIKE {{ customer_name }}";
        let mut parameters = Map::new();
        parameters.insert("customer_name".to_string(), json!("  'John Smith' "));
        parameters.insert("status".to_string(), json!("open"));
        parameters.insert("max_name_length".to_string(), json!(5));

        wrap_like_parameters(sql, &mut parameters);
        assert_eq!(parameters.get("customer_name"), Some(&json!("%John Smith%")));
        // Non-name and non-string parameters are untouched
        assert_eq!(parameters.get("status"), Some(&json!("open")));
        assert_eq!(parameters.get("max_name_length"), Some(&json!(5)));
    }

    #[test]
    fn test_wrap_requires_like_in_sql() {
        let mut parameters = Map::new();
        parameters.insert("customer_name".to_string(), json!("John"));
        wrap_like_parameters("SELECT 1 WHERE name = {{ customer_name }}", &mut parameters);
        assert_eq!(parameters.get("customer_name"), Some(&json!("John")));
    }

    #[test]
    fn test_wrap_skips_empty_values() {
        let mut parameters = Map::new();
        parameters.insert("customer_name".to_string(), json!("  "));
        wrap_like_parameters("... LIKE ...", &mut parameters);
        assert_eq!(parameters.get("customer_name"), Some(&json!("  ")));
    }

    #[test]
    fn test_sentinel_items() {
        let missing = no_matching_template_item("intent");
        assert_eq!(missing.confidence, 0.0);
        assert_eq!(missing.metadata_str("error"), Some("no_matching_template"));

        let failed = extraction_failed_item("intent");
        assert_eq!(
            failed.metadata_str("error"),
            Some("parameter_extraction_failed")
        );
    }

    #[test]
    fn test_settings_from_datasource() {
        let mut datasource = DatasourceConfig::default();
        datasource.confidence_threshold = 0.6;
        datasource
            .params
            .insert("max_templates".to_string(), json!(7));
        datasource
            .params
            .insert("reload_templates_on_start".to_string(), json!(false));

        let settings = IntentSettings::from_datasource(&datasource);
        assert_eq!(settings.confidence_threshold, 0.6);
        assert_eq!(settings.max_templates, 7);
        assert!(!settings.reload_templates_on_start);
        assert!(settings.wrap_like_parameters);
        assert!(settings.store_path.is_none());
    }
}
