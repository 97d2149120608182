// Qdrant vector backend
// REST driver. Clients are deduplicated per (host, port, api_key) and
// shared process-wide; the first liveness check per client is serialized by
// a mutex. Prefers the query_points API with a fallback to legacy search.
// Qdrant returns similarity scores directly.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::VectorBackend;
use crate::config::DatasourceConfig;
use crate::errors::RetrievalError;
use crate::types::VectorHit;

/// One shared client per (host, port, api_key).
struct SharedClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    connected: AtomicBool,
    liveness: Mutex<()>,
}

static CLIENTS: Lazy<DashMap<String, Arc<SharedClient>>> = Lazy::new(DashMap::new);

fn shared_client(host: &str, port: u16, api_key: Option<&str>, timeout: u64) -> Arc<SharedClient> {
    let key = format!("{host}:{port}:{}", api_key.unwrap_or(""));
    CLIENTS
        .entry(key)
        .or_insert_with(|| {
            Arc::new(SharedClient {
                client: reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(timeout))
                    .build()
                    .expect("reqwest client"),
                base_url: format!("http://{host}:{port}"),
                api_key: api_key.map(str::to_string),
                connected: AtomicBool::new(false),
                liveness: Mutex::new(()),
            })
        })
        .clone()
}

impl SharedClient {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    /// Verify the server answers once per process; serialized so parallel
    /// retrievers sharing this client do not stampede the check.
    async fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.liveness.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let response = self
            .request(reqwest::Method::GET, "/collections")
            .send()
            .await
            .map_err(|err| anyhow!(RetrievalError::BackendUnavailable(format!("qdrant: {err}"))))?;
        if !response.status().is_success() {
            bail!(RetrievalError::BackendUnavailable(format!(
                "qdrant liveness check failed: {}",
                response.status()
            )));
        }

        self.connected.store(true, Ordering::Release);
        info!("Connected to qdrant at {}", self.base_url);
        Ok(())
    }
}

pub struct QdrantBackend {
    datasource: DatasourceConfig,
    shared: Arc<SharedClient>,
}

impl QdrantBackend {
    pub fn new(datasource: DatasourceConfig) -> Self {
        let host = datasource.param_str("host", "localhost");
        let port = datasource.param_u16("port", 6333);
        let api_key = datasource.param_str("api_key", "");
        let shared = shared_client(
            &host,
            port,
            if api_key.is_empty() {
                None
            } else {
                Some(api_key.as_str())
            },
            datasource.connection_timeout,
        );
        Self { datasource, shared }
    }

    fn content_from_payload(payload: &Map<String, Value>) -> String {
        for key in ["content", "text", "document", "page_content"] {
            if let Some(text) = payload.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
        String::new()
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn connect(&self) -> Result<()> {
        self.shared.ensure_connected().await
    }

    async fn close(&self) -> Result<()> {
        // The client is shared across retrievers; nothing to tear down here
        Ok(())
    }

    async fn ensure_collection(&self, name: &str, auto_create: bool) -> Result<()> {
        let response = self
            .shared
            .request(reqwest::Method::GET, &format!("/collections/{name}"))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            bail!("qdrant collection check failed: {}", response.status());
        }
        if !auto_create {
            bail!(RetrievalError::CollectionNotFound(name.to_string()));
        }

        let dimension = self
            .datasource
            .param("dimension", Value::from(384))
            .as_u64()
            .unwrap_or(384);
        let response = self
            .shared
            .request(reqwest::Method::PUT, &format!("/collections/{name}"))
            .json(&json!({
                "vectors": {"size": dimension, "distance": "Cosine"}
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!(RetrievalError::CollectionNotFound(name.to_string()));
        }
        info!("Auto-created qdrant collection '{name}' ({dimension}d)");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        self.shared.ensure_connected().await?;

        #[derive(Deserialize)]
        struct Point {
            score: f32,
            #[serde(default)]
            payload: Map<String, Value>,
        }

        #[derive(Deserialize)]
        struct QueryResult {
            points: Vec<Point>,
        }

        #[derive(Deserialize)]
        struct QueryResponse {
            result: QueryResult,
        }

        #[derive(Deserialize)]
        struct LegacyResponse {
            result: Vec<Point>,
        }

        // query_points first (qdrant >= 1.10), legacy search on 404
        let response = self
            .shared
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/query"),
            )
            .json(&json!({
                "query": embedding,
                "limit": top_k,
                "with_payload": true,
            }))
            .send()
            .await?;

        let points: Vec<Point> = if response.status().is_success() {
            response.json::<QueryResponse>().await?.result.points
        } else if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("qdrant query_points unavailable, falling back to legacy search");
            let legacy = self
                .shared
                .request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points/search"),
                )
                .json(&json!({
                    "vector": embedding,
                    "limit": top_k,
                    "with_payload": true,
                }))
                .send()
                .await?;
            if !legacy.status().is_success() {
                bail!("qdrant search failed: {}", legacy.text().await.unwrap_or_default());
            }
            legacy.json::<LegacyResponse>().await?.result
        } else {
            bail!("qdrant search failed: {}", response.text().await.unwrap_or_default());
        };

        Ok(points
            .into_iter()
            .map(|point| {
                let document = Self::content_from_payload(&point.payload);
                VectorHit {
                    document,
                    metadata: point.payload,
                    distance: None,
                    score: Some(point.score),
                }
            })
            .collect())
    }

    /// Qdrant scores are already similarities in [0, 1].
    fn convert_score(&self, hit: &VectorHit, _datasource: &DatasourceConfig) -> f32 {
        hit.score.unwrap_or(0.0).clamp(0.0, 1.0)
    }
}
