// HTTP intent retriever
// Executes templates whose body is an HTTP request directive. The pooled
// client keeps 5 idle connections per host; auth headers come from
// environment-named credentials per the configured auth type. A non-2xx
// response fails the template and the pipeline advances to the next one.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{ExecutionOutput, IntentPipeline, IntentSettings, TemplateExecutor};
use crate::adapters::IntentAdapter;
use crate::config::DatasourceConfig;
use crate::contracts::{Embedder, Inference, IntentChild, Retriever};
use crate::templates::Template;
use crate::types::{ContextItem, QueryOptions, TemplateMatch};

use super::processor::TemplateProcessor;

const KEEPALIVE_CONNECTIONS: usize = 5;

/// Authentication modes for the HTTP backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    None,
    BasicAuth {
        username_env: String,
        password_env: String,
    },
    ApiKey {
        header_name: String,
        api_key_env: String,
    },
    BearerToken {
        token_env: String,
    },
}

impl AuthMode {
    pub fn from_datasource(datasource: &DatasourceConfig) -> Self {
        let auth = datasource.params.get("auth").cloned().unwrap_or(Value::Null);
        let auth_type = auth
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("none")
            .to_string();

        let env_name = |key: &str, default: &str| -> String {
            auth.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };

        match auth_type.as_str() {
            "basic_auth" => AuthMode::BasicAuth {
                username_env: env_name("username_env", "HTTP_USERNAME"),
                password_env: env_name("password_env", "HTTP_PASSWORD"),
            },
            "api_key" => AuthMode::ApiKey {
                header_name: env_name("header_name", "X-API-Key"),
                api_key_env: env_name("api_key_env", "HTTP_API_KEY"),
            },
            "bearer_token" => AuthMode::BearerToken {
                token_env: env_name("token_env", "HTTP_TOKEN"),
            },
            _ => AuthMode::None,
        }
    }

    /// Resolve headers from the environment. Missing variables warn and
    /// yield no header rather than failing initialization.
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            AuthMode::None => Vec::new(),
            AuthMode::BasicAuth {
                username_env,
                password_env,
            } => {
                let username = std::env::var(username_env).unwrap_or_default();
                let password = std::env::var(password_env).unwrap_or_default();
                if username.is_empty() {
                    warn!("Basic auth username variable {username_env} not set");
                    return Vec::new();
                }
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                vec![("Authorization".to_string(), format!("Basic {encoded}"))]
            }
            AuthMode::ApiKey {
                header_name,
                api_key_env,
            } => match std::env::var(api_key_env) {
                Ok(key) if !key.is_empty() => vec![(header_name.clone(), key)],
                _ => {
                    warn!("API key variable {api_key_env} not set");
                    Vec::new()
                }
            },
            AuthMode::BearerToken { token_env } => match std::env::var(token_env) {
                Ok(token) if !token.is_empty() => {
                    vec![("Authorization".to_string(), format!("Bearer {token}"))]
                }
                _ => {
                    warn!("Bearer token variable {token_env} not set");
                    Vec::new()
                }
            },
        }
    }
}

/// Intent retriever whose templates execute as HTTP requests.
pub struct HttpIntentRetriever {
    pipeline: IntentPipeline,
    client: reqwest::Client,
    base_url: String,
    auth: AuthMode,
    collection: Mutex<Option<String>>,
    initialized: RwLock<bool>,
}

impl HttpIntentRetriever {
    pub fn new(
        adapter: Arc<IntentAdapter>,
        embedder: Arc<dyn Embedder>,
        inference: Arc<dyn Inference>,
        datasource: &DatasourceConfig,
        settings: IntentSettings,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(datasource.connection_timeout))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .pool_max_idle_per_host(KEEPALIVE_CONNECTIONS)
            .build()?;

        Ok(Self {
            pipeline: IntentPipeline::new(adapter, embedder, inference, settings),
            client,
            base_url: datasource
                .param_str("base_url", "")
                .trim_end_matches('/')
                .to_string(),
            auth: AuthMode::from_datasource(datasource),
            collection: Mutex::new(None),
            initialized: RwLock::new(false),
        })
    }

    pub fn pipeline(&self) -> &IntentPipeline {
        &self.pipeline
    }

    fn resolve_url(&self, rendered_url: &str) -> String {
        if rendered_url.starts_with("http://") || rendered_url.starts_with("https://") {
            rendered_url.to_string()
        } else {
            format!("{}/{}", self.base_url, rendered_url.trim_start_matches('/'))
        }
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if !*self.initialized.read().await {
            self.initialize().await?;
        }
        Ok(())
    }

    /// Flatten a response payload into result rows: an array of objects is
    /// rows, a bare object is one row, anything else lands under `value`.
    fn rows_from_payload(payload: &Value) -> Vec<Map<String, Value>> {
        match payload {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Object(object) => object.clone(),
                    other => {
                        let mut row = Map::new();
                        row.insert("value".to_string(), other.clone());
                        row
                    }
                })
                .collect(),
            Value::Object(object) => {
                // Unwrap the common {results: [...]} and {data: [...]} shapes
                for key in ["results", "data", "items"] {
                    if let Some(Value::Array(_)) = object.get(key) {
                        return Self::rows_from_payload(object.get(key).unwrap());
                    }
                }
                vec![object.clone()]
            }
            Value::Null => Vec::new(),
            other => {
                let mut row = Map::new();
                row.insert("value".to_string(), other.clone());
                vec![row]
            }
        }
    }
}

#[async_trait]
impl TemplateExecutor for HttpIntentRetriever {
    async fn execute(
        &self,
        template: &Template,
        parameters: &Map<String, Value>,
        processor: &TemplateProcessor,
    ) -> Result<ExecutionOutput> {
        let spec = template
            .http_request
            .as_ref()
            .ok_or_else(|| anyhow!("template {} has no HTTP request body", template.id))?;

        let runtime: HashMap<String, Value> = parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let url = self.resolve_url(&processor.render(&spec.url, &runtime, false)?);
        let method: reqwest::Method = spec
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| anyhow!("invalid HTTP method '{}'", spec.method))?;

        debug!("Executing HTTP template {}: {method} {url}", template.id);

        let mut request = self.client.request(method, &url);
        for (name, value) in self.auth.headers() {
            request = request.header(name, value);
        }
        for (name, value) in &spec.headers {
            request = request.header(name, processor.render(value, &runtime, false)?);
        }

        let mut query_params = Vec::new();
        for (name, value) in &spec.params {
            query_params.push((name.clone(), processor.render(value, &runtime, false)?));
        }
        if !query_params.is_empty() {
            request = request.query(&query_params);
        }

        if let Some(body) = &spec.body {
            let rendered_body = render_json_body(body, &runtime, processor)?;
            request = request.json(&rendered_body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP request failed with status {status}");
        }

        let payload: Value = response.json().await.unwrap_or(Value::Null);
        let rows = Self::rows_from_payload(&payload);

        Ok(ExecutionOutput {
            rows,
            formatted_data: Some(payload),
        })
    }
}

/// Render every string leaf of a JSON body through the processor.
fn render_json_body(
    body: &Value,
    runtime: &HashMap<String, Value>,
    processor: &TemplateProcessor,
) -> Result<Value> {
    Ok(match body {
        Value::String(text) => Value::String(processor.render(text, runtime, false)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_json_body(item, runtime, processor))
                .collect::<Result<_>>()?,
        ),
        Value::Object(object) => {
            let mut rendered = Map::new();
            for (key, value) in object {
                rendered.insert(key.clone(), render_json_body(value, runtime, processor)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

#[async_trait]
impl Retriever for HttpIntentRetriever {
    async fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.write().await;
        if *initialized {
            return Ok(());
        }
        self.pipeline.initialize().await?;
        *initialized = true;
        info!("HTTP intent retriever initialized ({})", self.base_url);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.initialized.write().await = false;
        Ok(())
    }

    async fn set_collection(&self, name: &str) -> Result<()> {
        *self.collection.lock().await = Some(name.to_string());
        Ok(())
    }

    async fn get_relevant_context(
        &self,
        query: &str,
        _options: &QueryOptions,
    ) -> Result<Vec<ContextItem>> {
        self.ensure_initialized().await?;
        Ok(self.pipeline.run_query(query, self).await)
    }
}

#[async_trait]
impl IntentChild for HttpIntentRetriever {
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
