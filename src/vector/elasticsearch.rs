// Elasticsearch vector backend
// KNN query against a configured dense_vector field, with
// num_candidates = max(2 * top_k, 100). Scores are similarities used
// directly, optionally scaled.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::VectorBackend;
use crate::config::DatasourceConfig;
use crate::errors::RetrievalError;
use crate::types::VectorHit;

const MIN_NUM_CANDIDATES: usize = 100;

pub struct ElasticsearchBackend {
    datasource: DatasourceConfig,
    client: reqwest::Client,
    base_url: String,
    vector_field: String,
    content_field: String,
    auth_header: Option<String>,
}

impl ElasticsearchBackend {
    pub fn new(datasource: DatasourceConfig) -> Result<Self> {
        let node = datasource.param_str("node", "http://localhost:9200");
        let username = datasource.param_str("username", "");
        let password = datasource.param_str("password", "");

        let auth_header = if username.is_empty() {
            None
        } else {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            Some(format!("Basic {encoded}"))
        };

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(datasource.connection_timeout))
                .build()?,
            base_url: node.trim_end_matches('/').to_string(),
            vector_field: datasource.param_str("vector_field", "embedding"),
            content_field: datasource.param_str("content_field", "content"),
            auth_header,
            datasource,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(auth) = &self.auth_header {
            builder = builder.header("Authorization", auth);
        }
        builder
    }
}

#[async_trait]
impl VectorBackend for ElasticsearchBackend {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn connect(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, "/")
            .send()
            .await
            .map_err(|err| {
                anyhow!(RetrievalError::BackendUnavailable(format!(
                    "elasticsearch: {err}"
                )))
            })?;
        if !response.status().is_success() {
            bail!(RetrievalError::BackendUnavailable(format!(
                "elasticsearch unreachable: {}",
                response.status()
            )));
        }
        debug!("Connected to elasticsearch at {}", self.base_url);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_collection(&self, name: &str, auto_create: bool) -> Result<()> {
        let response = self
            .request(reqwest::Method::HEAD, &format!("/{name}"))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            bail!("elasticsearch index check failed: {}", response.status());
        }
        if !auto_create {
            bail!(RetrievalError::CollectionNotFound(name.to_string()));
        }

        let dimension = self
            .datasource
            .param("dimension", Value::from(384))
            .as_u64()
            .unwrap_or(384);
        let mut properties = Map::new();
        properties.insert(
            self.vector_field.clone(),
            json!({
                "type": "dense_vector",
                "dims": dimension,
                "index": true,
                "similarity": "cosine",
            }),
        );
        properties.insert(self.content_field.clone(), json!({"type": "text"}));

        let response = self
            .request(reqwest::Method::PUT, &format!("/{name}"))
            .json(&json!({"mappings": {"properties": properties}}))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!(RetrievalError::CollectionNotFound(name.to_string()));
        }
        info!("Auto-created elasticsearch index '{name}' ({dimension}d)");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        #[derive(Deserialize)]
        struct Hit {
            #[serde(rename = "_score")]
            score: f32,
            #[serde(rename = "_source", default)]
            source: Map<String, Value>,
        }

        #[derive(Deserialize)]
        struct Hits {
            hits: Vec<Hit>,
        }

        #[derive(Deserialize)]
        struct SearchResponse {
            hits: Hits,
        }

        let num_candidates = (2 * top_k).max(MIN_NUM_CANDIDATES);
        let response = self
            .request(reqwest::Method::POST, &format!("/{collection}/_search"))
            .json(&json!({
                "knn": {
                    "field": self.vector_field,
                    "query_vector": embedding,
                    "k": top_k,
                    "num_candidates": num_candidates,
                },
                "size": top_k,
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            bail!(RetrievalError::CollectionNotFound(collection.to_string()));
        }
        if !response.status().is_success() {
            bail!(
                "elasticsearch search failed: {}",
                response.text().await.unwrap_or_default()
            );
        }

        let result: SearchResponse = response.json().await?;
        Ok(result
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let document = hit
                    .source
                    .get(&self.content_field)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut metadata = hit.source;
                metadata.remove(&self.vector_field);
                VectorHit {
                    document,
                    metadata,
                    distance: None,
                    score: Some(hit.score),
                }
            })
            .collect())
    }

    /// Direct similarity, multiplied by the configured scaling factor.
    fn convert_score(&self, hit: &VectorHit, datasource: &DatasourceConfig) -> f32 {
        (hit.score.unwrap_or(0.0) * datasource.score_scaling_factor).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_candidates_floor() {
        assert_eq!((2 * 3usize).max(MIN_NUM_CANDIDATES), 100);
        assert_eq!((2 * 80usize).max(MIN_NUM_CANDIDATES), 160);
    }

    #[test]
    fn test_auth_header_only_with_username() -> Result<()> {
        let backend = ElasticsearchBackend::new(DatasourceConfig::default())?;
        assert!(backend.auth_header.is_none());

        let mut datasource = DatasourceConfig::default();
        datasource
            .params
            .insert("username".to_string(), Value::String("elastic".to_string()));
        datasource
            .params
            .insert("password".to_string(), Value::String("changeme".to_string()));
        let backend = ElasticsearchBackend::new(datasource)?;
        assert!(backend.auth_header.as_deref().unwrap().starts_with("Basic "));
        Ok(())
    }

    #[test]
    fn test_configured_fields() -> Result<()> {
        let mut datasource = DatasourceConfig::default();
        datasource
            .params
            .insert("vector_field".to_string(), Value::String("vec".to_string()));
        datasource
            .params
            .insert("content_field".to_string(), Value::String("body".to_string()));
        let backend = ElasticsearchBackend::new(datasource)?;
        assert_eq!(backend.vector_field, "vec");
        assert_eq!(backend.content_field, "body");
        Ok(())
    }
}
