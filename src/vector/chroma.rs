// Chroma vector backend
// Two modes selected by config: `http` talks to a Chroma server over its
// REST API; `embedded` keeps collections in-process with optional bincode
// persistence, covering the persistent-file deployment shape. Both report
// cosine distance in [0, 2], converted as sim = 1 - d/2.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::VectorBackend;
use crate::config::DatasourceConfig;
use crate::errors::RetrievalError;
use crate::types::VectorHit;

/// Metadata is stored as JSON text: the bincode layout cannot carry
/// self-describing values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct EmbeddedDocument {
    document: String,
    metadata_json: String,
    embedding: Vec<f32>,
}

impl EmbeddedDocument {
    fn metadata(&self) -> Map<String, Value> {
        serde_json::from_str(&self.metadata_json).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct EmbeddedCollection {
    metadata: HashMap<String, String>,
    documents: Vec<EmbeddedDocument>,
}

enum Mode {
    Http {
        client: reqwest::Client,
        base_url: String,
        /// name -> collection id, resolved on first use
        ids: RwLock<HashMap<String, String>>,
    },
    Embedded {
        path: Option<PathBuf>,
        collections: RwLock<HashMap<String, EmbeddedCollection>>,
    },
}

pub struct ChromaBackend {
    datasource: DatasourceConfig,
    mode: Mode,
}

impl ChromaBackend {
    /// Build from datasource config. `mode: embedded` (or a configured
    /// `persist_path`) selects the in-process store; anything else is HTTP.
    pub fn new(datasource: DatasourceConfig) -> Result<Self> {
        let mode_name = datasource.param_str("mode", "http");
        let persist_path = datasource.param_str("persist_path", "");

        let mode = if mode_name == "embedded" || !persist_path.is_empty() {
            Mode::Embedded {
                path: if persist_path.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(persist_path))
                },
                collections: RwLock::new(HashMap::new()),
            }
        } else {
            let host = datasource.param_str("host", "localhost");
            let port = datasource.param_u16("port", 8000);
            Mode::Http {
                client: reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(datasource.connection_timeout))
                    .build()?,
                base_url: format!("http://{host}:{port}/api/v1"),
                ids: RwLock::new(HashMap::new()),
            }
        };

        Ok(Self { datasource, mode })
    }

    pub fn embedded() -> Self {
        Self {
            datasource: DatasourceConfig::default(),
            mode: Mode::Embedded {
                path: None,
                collections: RwLock::new(HashMap::new()),
            },
        }
    }

    /// Insert documents into an embedded collection (test and ingest path).
    pub async fn insert_documents(
        &self,
        collection: &str,
        documents: Vec<(String, Map<String, Value>, Vec<f32>)>,
    ) -> Result<()> {
        let Mode::Embedded { collections, .. } = &self.mode else {
            bail!("insert_documents is only available in embedded mode");
        };

        let mut guard = collections.write().await;
        let entry = guard.entry(collection.to_string()).or_default();
        for (document, metadata, embedding) in documents {
            entry.documents.push(EmbeddedDocument {
                document,
                metadata_json: serde_json::to_string(&metadata)?,
                embedding,
            });
        }
        Ok(())
    }

    async fn resolve_collection_id(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        name: &str,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct CollectionInfo {
            id: String,
        }

        let response = client
            .get(format!("{base_url}/collections/{name}"))
            .send()
            .await
            .context("chroma collection lookup failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            bail!(RetrievalError::CollectionNotFound(name.to_string()));
        }
        if !response.status().is_success() {
            bail!("chroma error: {}", response.text().await.unwrap_or_default());
        }

        let info: CollectionInfo = response.json().await?;
        Ok(info.id)
    }

    fn persist_embedded(
        path: &Option<PathBuf>,
        collections: &HashMap<String, EmbeddedCollection>,
    ) -> Result<()> {
        let Some(path) = path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        bincode::serialize_into(std::io::BufWriter::new(file), collections)?;
        Ok(())
    }

    fn load_embedded(path: &PathBuf) -> Result<HashMap<String, EmbeddedCollection>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(bincode::deserialize_from(std::io::BufReader::new(file))?)
    }
}

#[async_trait]
impl VectorBackend for ChromaBackend {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn connect(&self) -> Result<()> {
        match &self.mode {
            Mode::Http { client, base_url, .. } => {
                let response = client
                    .get(format!("{base_url}/heartbeat"))
                    .send()
                    .await
                    .map_err(|err| {
                        anyhow!(RetrievalError::BackendUnavailable(format!("chroma: {err}")))
                    })?;
                if !response.status().is_success() {
                    bail!(RetrievalError::BackendUnavailable(
                        "chroma heartbeat failed".to_string()
                    ));
                }
                debug!("Connected to chroma at {base_url}");
                Ok(())
            }
            Mode::Embedded { path, collections } => {
                if let Some(path) = path {
                    if path.exists() {
                        let loaded = Self::load_embedded(path)?;
                        info!(
                            "Loaded {} embedded chroma collections from {}",
                            loaded.len(),
                            path.display()
                        );
                        *collections.write().await = loaded;
                    }
                }
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if let Mode::Embedded { path, collections } = &self.mode {
            Self::persist_embedded(path, &*collections.read().await)?;
        }
        Ok(())
    }

    async fn ensure_collection(&self, name: &str, auto_create: bool) -> Result<()> {
        match &self.mode {
            Mode::Http {
                client,
                base_url,
                ids,
            } => {
                if ids.read().await.contains_key(name) {
                    return Ok(());
                }

                match self.resolve_collection_id(client, base_url, name).await {
                    Ok(id) => {
                        ids.write().await.insert(name.to_string(), id);
                        Ok(())
                    }
                    Err(error) if auto_create => {
                        if !error.to_string().contains("not found") {
                            debug!("chroma lookup failed, attempting create: {error}");
                        }
                        #[derive(Deserialize)]
                        struct Created {
                            id: String,
                        }
                        let response = client
                            .post(format!("{base_url}/collections"))
                            .json(&json!({
                                "name": name,
                                "metadata": {"hnsw:space": "cosine"},
                                "get_or_create": true,
                            }))
                            .send()
                            .await?;
                        if !response.status().is_success() {
                            bail!(RetrievalError::CollectionNotFound(name.to_string()));
                        }
                        let created: Created = response.json().await?;
                        info!("Auto-created chroma collection '{name}'");
                        ids.write().await.insert(name.to_string(), created.id);
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            Mode::Embedded { collections, .. } => {
                let exists = collections.read().await.contains_key(name);
                if exists {
                    return Ok(());
                }
                if !auto_create {
                    bail!(RetrievalError::CollectionNotFound(name.to_string()));
                }
                let mut metadata = HashMap::new();
                metadata.insert("hnsw:space".to_string(), "cosine".to_string());
                collections.write().await.insert(
                    name.to_string(),
                    EmbeddedCollection {
                        metadata,
                        documents: Vec::new(),
                    },
                );
                info!("Auto-created embedded chroma collection '{name}'");
                Ok(())
            }
        }
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        match &self.mode {
            Mode::Http {
                client,
                base_url,
                ids,
            } => {
                let id = ids
                    .read()
                    .await
                    .get(collection)
                    .cloned()
                    .ok_or_else(|| anyhow!(RetrievalError::CollectionNotFound(collection.to_string())))?;

                #[derive(Deserialize)]
                struct QueryResponse {
                    documents: Vec<Vec<Option<String>>>,
                    metadatas: Vec<Vec<Option<Map<String, Value>>>>,
                    distances: Vec<Vec<f32>>,
                }

                let response = client
                    .post(format!("{base_url}/collections/{id}/query"))
                    .json(&json!({
                        "query_embeddings": [embedding],
                        "n_results": top_k,
                        "include": ["documents", "metadatas", "distances"],
                    }))
                    .send()
                    .await?;

                if !response.status().is_success() {
                    bail!("chroma query failed: {}", response.text().await.unwrap_or_default());
                }

                let result: QueryResponse = response.json().await?;
                let documents = result.documents.into_iter().next().unwrap_or_default();
                let metadatas = result.metadatas.into_iter().next().unwrap_or_default();
                let distances = result.distances.into_iter().next().unwrap_or_default();

                Ok(documents
                    .into_iter()
                    .zip(metadatas)
                    .zip(distances)
                    .map(|((document, metadata), distance)| VectorHit {
                        document: document.unwrap_or_default(),
                        metadata: metadata.unwrap_or_default(),
                        distance: Some(distance),
                        score: None,
                    })
                    .collect())
            }
            Mode::Embedded { collections, .. } => {
                let guard = collections.read().await;
                let entry = guard.get(collection).ok_or_else(|| {
                    anyhow!(RetrievalError::CollectionNotFound(collection.to_string()))
                })?;

                if let Some(first) = entry.documents.first() {
                    if first.embedding.len() != embedding.len() {
                        bail!(
                            "Embedding dimension {} does not match collection dimensionality {}",
                            embedding.len(),
                            first.embedding.len()
                        );
                    }
                }

                let mut hits: Vec<VectorHit> = entry
                    .documents
                    .iter()
                    .map(|doc| VectorHit {
                        document: doc.document.clone(),
                        metadata: doc.metadata(),
                        distance: Some(cosine_distance(embedding, &doc.embedding)),
                        score: None,
                    })
                    .collect();

                hits.sort_by(|a, b| {
                    a.distance
                        .partial_cmp(&b.distance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                hits.truncate(top_k);
                Ok(hits)
            }
        }
    }

    /// Cosine distance in [0, 2] maps to sim = 1 - d/2.
    fn convert_score(&self, hit: &VectorHit, _datasource: &DatasourceConfig) -> f32 {
        match hit.distance {
            Some(distance) => (1.0 - distance / 2.0).clamp(0.0, 1.0),
            None => hit.score.unwrap_or(0.0).clamp(0.0, 1.0),
        }
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit_with_distance(distance: f32) -> VectorHit {
        VectorHit {
            document: String::new(),
            metadata: Map::new(),
            distance: Some(distance),
            score: None,
        }
    }

    #[test]
    fn test_score_conversion() {
        let backend = ChromaBackend::embedded();
        let ds = DatasourceConfig::default();
        assert_eq!(backend.convert_score(&hit_with_distance(0.0), &ds), 1.0);
        assert!((backend.convert_score(&hit_with_distance(0.8), &ds) - 0.6).abs() < 1e-6);
        assert!((backend.convert_score(&hit_with_distance(1.8), &ds) - 0.1).abs() < 1e-6);
        assert_eq!(backend.convert_score(&hit_with_distance(2.5), &ds), 0.0);
    }

    #[tokio::test]
    async fn test_embedded_collection_lifecycle() -> Result<()> {
        let backend = ChromaBackend::embedded();
        backend.connect().await?;

        // Missing without auto-create
        assert!(backend.ensure_collection("faq", false).await.is_err());

        backend.ensure_collection("faq", true).await?;
        backend
            .insert_documents(
                "faq",
                vec![
                    ("close".to_string(), Map::new(), vec![1.0, 0.0, 0.0]),
                    ("far".to_string(), Map::new(), vec![0.0, 1.0, 0.0]),
                ],
            )
            .await?;

        let hits = backend.search("faq", &[1.0, 0.0, 0.0], 10).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document, "close");
        assert!(hits[0].distance.unwrap() < hits[1].distance.unwrap());
        Ok(())
    }

    #[tokio::test]
    async fn test_embedded_dimension_mismatch_error_text() -> Result<()> {
        let backend = ChromaBackend::embedded();
        backend.ensure_collection("faq", true).await?;
        backend
            .insert_documents("faq", vec![("a".to_string(), Map::new(), vec![0.0; 384])])
            .await?;

        let error = backend.search("faq", &[1.0, 0.0], 5).await.unwrap_err();
        assert!(crate::errors::is_dimension_mismatch(&error.to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_embedded_persistence() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("chroma.bin");

        let mut datasource = DatasourceConfig::default();
        datasource.params.insert(
            "persist_path".to_string(),
            Value::String(path.display().to_string()),
        );

        {
            let backend = ChromaBackend::new(datasource.clone())?;
            backend.connect().await?;
            backend.ensure_collection("faq", true).await?;
            backend
                .insert_documents("faq", vec![("a".to_string(), Map::new(), vec![1.0, 0.0])])
                .await?;
            backend.close().await?;
        }

        let backend = ChromaBackend::new(datasource)?;
        backend.connect().await?;
        let hits = backend.search("faq", &[1.0, 0.0], 5).await?;
        assert_eq!(hits.len(), 1);
        Ok(())
    }
}
