// Milvus vector backend
// REST driver against the v2 vectordb API. set_collection loads the
// collection into memory; searches run against the named embedding field.
// IP and COSINE scores map as (score+1)/2; L2 distances use the sigmoid.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::VectorBackend;
use crate::config::DatasourceConfig;
use crate::errors::RetrievalError;
use crate::types::VectorHit;

pub struct MilvusBackend {
    datasource: DatasourceConfig,
    client: reqwest::Client,
    base_url: String,
    vector_field: String,
    content_field: String,
    metric: String,
    token: Option<String>,
}

impl MilvusBackend {
    pub fn new(datasource: DatasourceConfig) -> Result<Self> {
        let host = datasource.param_str("host", "localhost");
        let port = datasource.param_u16("port", 19530);
        let token = datasource.param_str("token", "");

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(datasource.connection_timeout))
                .build()?,
            base_url: format!("http://{host}:{port}/v2/vectordb"),
            vector_field: datasource.param_str("vector_field", "embedding"),
            content_field: datasource.param_str("content_field", "content"),
            metric: datasource.param_str("metric_type", "COSINE").to_uppercase(),
            token: if token.is_empty() { None } else { Some(token) },
            datasource,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[async_trait]
impl VectorBackend for MilvusBackend {
    fn name(&self) -> &str {
        "milvus"
    }

    async fn connect(&self) -> Result<()> {
        let response = self
            .request("/collections/list")
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| anyhow!(RetrievalError::BackendUnavailable(format!("milvus: {err}"))))?;
        if !response.status().is_success() {
            bail!(RetrievalError::BackendUnavailable(format!(
                "milvus unreachable: {}",
                response.status()
            )));
        }
        debug!("Connected to milvus at {}", self.base_url);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Describe, then load: Milvus serves searches only for collections
    /// loaded into memory.
    async fn ensure_collection(&self, name: &str, auto_create: bool) -> Result<()> {
        let response = self
            .request("/collections/describe")
            .json(&json!({"collectionName": name}))
            .send()
            .await?;
        let described: ApiResponse = response.json().await?;

        if described.code != 0 {
            if !auto_create {
                bail!(RetrievalError::CollectionNotFound(name.to_string()));
            }
            let dimension = self
                .datasource
                .param("dimension", Value::from(384))
                .as_u64()
                .unwrap_or(384);
            let created: ApiResponse = self
                .request("/collections/create")
                .json(&json!({
                    "collectionName": name,
                    "dimension": dimension,
                    "metricType": self.metric,
                    "vectorFieldName": self.vector_field,
                }))
                .send()
                .await?
                .json()
                .await?;
            if created.code != 0 {
                bail!(RetrievalError::CollectionNotFound(name.to_string()));
            }
            info!("Auto-created milvus collection '{name}' ({dimension}d)");
        }

        let loaded: ApiResponse = self
            .request("/collections/load")
            .json(&json!({"collectionName": name}))
            .send()
            .await?
            .json()
            .await?;
        if loaded.code != 0 {
            bail!(
                "milvus load failed for '{name}': {}",
                loaded.message.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        let response = self
            .request("/entities/search")
            .json(&json!({
                "collectionName": collection,
                "data": [embedding],
                "annsField": self.vector_field,
                "limit": top_k,
                "outputFields": ["*"],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("milvus search failed: {}", response.status());
        }

        let result: ApiResponse = response.json().await?;
        if result.code != 0 {
            bail!(
                "milvus search failed: {}",
                result.message.unwrap_or_default()
            );
        }

        let rows = result.data.as_array().cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter_map(|row| row.as_object().cloned())
            .map(|mut fields| {
                let raw_score = fields
                    .remove("distance")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0) as f32;
                fields.remove(&self.vector_field);
                let document = fields
                    .get(&self.content_field)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                // IP/COSINE report similarity-like scores, L2 a distance
                let (distance, score) = if self.metric == "L2" {
                    (Some(raw_score), None)
                } else {
                    (None, Some(raw_score))
                };

                VectorHit {
                    document,
                    metadata: fields,
                    distance,
                    score,
                }
            })
            .collect())
    }

    fn convert_score(&self, hit: &VectorHit, datasource: &DatasourceConfig) -> f32 {
        match self.metric.as_str() {
            "IP" | "COSINE" => {
                let score = hit.score.unwrap_or(0.0);
                ((score + 1.0) / 2.0).clamp(0.0, 1.0)
            }
            _ => {
                let distance = hit.distance.unwrap_or(f32::MAX);
                1.0 / (1.0 + distance / datasource.distance_scaling_factor)
            }
        }
    }
}
