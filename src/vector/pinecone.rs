// Pinecone vector backend
// REST driver against a data-plane index host. Collections map to Pinecone
// namespaces within the configured index. Scores are similarities used
// directly, optionally scaled by score_scaling_factor.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::VectorBackend;
use crate::config::DatasourceConfig;
use crate::errors::RetrievalError;
use crate::types::VectorHit;

pub struct PineconeBackend {
    datasource: DatasourceConfig,
    client: reqwest::Client,
    index_host: String,
    api_key: String,
}

impl PineconeBackend {
    pub fn new(datasource: DatasourceConfig) -> Result<Self> {
        let index_host = datasource.param_str("index_host", "");
        if index_host.is_empty() {
            bail!(RetrievalError::ConfigInvalid(
                "pinecone requires an index_host".to_string()
            ));
        }
        let api_key = datasource.param_str("api_key", "");

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(datasource.connection_timeout))
                .build()?,
            index_host: normalize_host(&index_host),
            api_key,
            datasource,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.index_host))
            .header("Api-Key", &self.api_key)
            .header("Content-Type", "application/json")
    }

    /// Pinecone keeps document text in metadata; accept the common keys in
    /// order.
    fn content_from_metadata(metadata: &Map<String, Value>) -> String {
        for key in ["content", "text", "document"] {
            if let Some(text) = metadata.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
        String::new()
    }
}

fn normalize_host(host: &str) -> String {
    let trimmed = host.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

#[derive(Deserialize)]
struct StatsResponse {
    #[serde(default)]
    namespaces: Map<String, Value>,
}

#[async_trait]
impl VectorBackend for PineconeBackend {
    fn name(&self) -> &str {
        "pinecone"
    }

    async fn connect(&self) -> Result<()> {
        let response = self
            .request("/describe_index_stats")
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| {
                anyhow!(RetrievalError::BackendUnavailable(format!("pinecone: {err}")))
            })?;
        if !response.status().is_success() {
            bail!(RetrievalError::BackendUnavailable(format!(
                "pinecone index unreachable: {}",
                response.status()
            )));
        }
        debug!("Connected to pinecone index at {}", self.index_host);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// A collection is a namespace; namespaces appear on first upsert, so
    /// absence is only an error when auto-create is off and the index has
    /// explicit namespaces that do not include this one.
    async fn ensure_collection(&self, name: &str, auto_create: bool) -> Result<()> {
        if auto_create {
            return Ok(());
        }

        let response = self
            .request("/describe_index_stats")
            .json(&json!({}))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("pinecone stats failed: {}", response.status());
        }

        let stats: StatsResponse = response.json().await?;
        if !stats.namespaces.is_empty() && !stats.namespaces.contains_key(name) {
            bail!(RetrievalError::CollectionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        #[derive(Deserialize)]
        struct Match {
            score: f32,
            #[serde(default)]
            metadata: Map<String, Value>,
        }

        #[derive(Deserialize)]
        struct QueryResponse {
            #[serde(default)]
            matches: Vec<Match>,
        }

        let response = self
            .request("/query")
            .json(&json!({
                "vector": embedding,
                "topK": top_k,
                "includeMetadata": true,
                "namespace": collection,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("pinecone query failed: {}", response.text().await.unwrap_or_default());
        }

        let result: QueryResponse = response.json().await?;
        Ok(result
            .matches
            .into_iter()
            .map(|candidate| {
                let document = Self::content_from_metadata(&candidate.metadata);
                VectorHit {
                    document,
                    metadata: candidate.metadata,
                    distance: None,
                    score: Some(candidate.score),
                }
            })
            .collect())
    }

    /// Direct similarity, multiplied by the configured scaling factor.
    fn convert_score(&self, hit: &VectorHit, datasource: &DatasourceConfig) -> f32 {
        (hit.score.unwrap_or(0.0) * datasource.score_scaling_factor).clamp(0.0, 1.0)
    }
}
