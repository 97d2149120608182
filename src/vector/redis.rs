// Redis vector backend
// RediSearch KNN over HASH documents: the query vector travels as
// little-endian f32 bytes in a query parameter. Distance-to-similarity
// depends on the configured metric: COSINE max(0, 1-d), L2 sigmoid,
// IP direct pass-through clamped to [0, 1] (RediSearch versions disagree on
// IP semantics; the clamp pins the mapping).

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value as RedisValue;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::VectorBackend;
use crate::config::DatasourceConfig;
use crate::errors::RetrievalError;
use crate::types::VectorHit;

pub struct RedisBackend {
    datasource: DatasourceConfig,
    vector_field: String,
    content_field: String,
    metric: String,
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub fn new(datasource: DatasourceConfig) -> Self {
        Self {
            vector_field: datasource.param_str("vector_field", "embedding"),
            content_field: datasource.param_str("content_field", "content"),
            metric: datasource.param_str("distance_metric", "COSINE").to_uppercase(),
            datasource,
            connection: RwLock::new(None),
        }
    }

    fn redis_url(&self) -> String {
        let host = self.datasource.param_str("host", "localhost");
        let port = self.datasource.param_u16("port", 6379);
        let password = self.datasource.param_str("password", "");
        if password.is_empty() {
            format!("redis://{host}:{port}/")
        } else {
            format!("redis://:{password}@{host}:{port}/")
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("redis connection not initialized"))
    }

    /// Query vector as little-endian f32 bytes for the KNN parameter.
    fn vector_bytes(embedding: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(embedding.len() * 4);
        for value in embedding {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }
}

#[async_trait]
impl VectorBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let client = redis::Client::open(self.redis_url())
            .map_err(|err| anyhow!(RetrievalError::BackendUnavailable(format!("redis: {err}"))))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| anyhow!(RetrievalError::BackendUnavailable(format!("redis: {err}"))))?;

        *guard = Some(connection);
        debug!("Connected to redis");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connection.write().await.take();
        Ok(())
    }

    async fn ensure_collection(&self, name: &str, auto_create: bool) -> Result<()> {
        let mut connection = self.connection().await?;

        let info: Result<RedisValue, redis::RedisError> = redis::cmd("FT.INFO")
            .arg(name)
            .query_async(&mut connection)
            .await;

        match info {
            Ok(_) => Ok(()),
            Err(error) if error.to_string().to_lowercase().contains("unknown index") => {
                if !auto_create {
                    bail!(RetrievalError::CollectionNotFound(name.to_string()));
                }

                let dimension = self
                    .datasource
                    .param("dimension", Value::from(384))
                    .as_u64()
                    .unwrap_or(384);
                let _: RedisValue = redis::cmd("FT.CREATE")
                    .arg(name)
                    .arg("ON")
                    .arg("HASH")
                    .arg("PREFIX")
                    .arg(1)
                    .arg(format!("{name}:"))
                    .arg("SCHEMA")
                    .arg(&self.content_field)
                    .arg("TEXT")
                    .arg(&self.vector_field)
                    .arg("VECTOR")
                    .arg("FLAT")
                    .arg(6)
                    .arg("TYPE")
                    .arg("FLOAT32")
                    .arg("DIM")
                    .arg(dimension)
                    .arg("DISTANCE_METRIC")
                    .arg(&self.metric)
                    .query_async(&mut connection)
                    .await?;
                info!("Auto-created redis index '{name}' ({dimension}d, {})", self.metric);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        let mut connection = self.connection().await?;

        let query = format!(
            "*=>[KNN {top_k} @{field} $vec AS vector_score]",
            field = self.vector_field
        );

        let reply: RedisValue = redis::cmd("FT.SEARCH")
            .arg(collection)
            .arg(&query)
            .arg("PARAMS")
            .arg(2)
            .arg("vec")
            .arg(Self::vector_bytes(embedding))
            .arg("SORTBY")
            .arg("vector_score")
            .arg("DIALECT")
            .arg(2)
            .query_async(&mut connection)
            .await?;

        parse_search_reply(&reply, &self.content_field, &self.vector_field)
    }

    fn convert_score(&self, hit: &VectorHit, datasource: &DatasourceConfig) -> f32 {
        let distance = hit.distance.unwrap_or_else(|| hit.score.unwrap_or(0.0));
        match self.metric.as_str() {
            "COSINE" => (1.0 - distance).max(0.0),
            "L2" => 1.0 / (1.0 + distance / datasource.distance_scaling_factor),
            // Direct pass-through, pinned to [0, 1]
            "IP" => distance.clamp(0.0, 1.0),
            _ => 1.0 / (1.0 + distance / datasource.distance_scaling_factor),
        }
    }
}

/// FT.SEARCH reply shape: `[count, key, [field, value, ...], key, ...]`.
fn parse_search_reply(
    reply: &RedisValue,
    content_field: &str,
    vector_field: &str,
) -> Result<Vec<VectorHit>> {
    let RedisValue::Array(items) = reply else {
        bail!("unexpected FT.SEARCH reply shape");
    };

    let mut hits = Vec::new();
    let mut index = 1; // skip total count
    while index + 1 < items.len() {
        let key = text_of(&items[index]);
        let RedisValue::Array(fields) = &items[index + 1] else {
            index += 2;
            continue;
        };

        let mut document = String::new();
        let mut metadata = Map::new();
        let mut distance = None;

        let mut field_index = 0;
        while field_index + 1 < fields.len() {
            let field_name = text_of(&fields[field_index]);
            let field_value = text_of(&fields[field_index + 1]);

            if field_name == content_field {
                document = field_value;
            } else if field_name == "vector_score" {
                distance = field_value.parse::<f32>().ok();
            } else if field_name != vector_field {
                metadata.insert(field_name, Value::String(field_value));
            }
            field_index += 2;
        }

        metadata.insert("key".to_string(), Value::String(key));
        hits.push(VectorHit {
            document,
            metadata,
            distance,
            score: None,
        });
        index += 2;
    }

    Ok(hits)
}

fn text_of(value: &RedisValue) -> String {
    match value {
        RedisValue::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        RedisValue::SimpleString(text) => text.clone(),
        RedisValue::Int(number) => number.to_string(),
        RedisValue::Double(number) => number.to_string(),
        other => format!("{other:?}"),
    }
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

    fn backend_with_metric(metric: &str) -> RedisBackend {
        let mut datasource = DatasourceConfig::default();
        datasource.params.insert(
            "distance_metric".to_string(),
            Value::String(metric.to_string()),
        );
        RedisBackend::new(datasource)
    }

    #[test]
    fn test_cosine_metric_conversion() {
        let backend = backend_with_metric("COSINE");
        let ds = DatasourceConfig::default();
        assert_eq!(backend.convert_score(&hit_with_distance(0.0), &ds), 1.0);
        assert!((backend.convert_score(&hit_with_distance(0.4), &ds) - 0.6).abs() < 1e-6);
        // Distances beyond 1 floor at zero
        assert_eq!(backend.convert_score(&hit_with_distance(1.5), &ds), 0.0);
    }

    #[test]
    fn test_l2_metric_conversion() {
        let backend = backend_with_metric("L2");
        let mut ds = DatasourceConfig::default();
        ds.distance_scaling_factor = 1.0;
        assert!((backend.convert_score(&hit_with_distance(1.0), &ds) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ip_metric_clamped_passthrough() {
        let backend = backend_with_metric("IP");
        let ds = DatasourceConfig::default();
        assert_eq!(backend.convert_score(&hit_with_distance(0.7), &ds), 0.7);
        assert_eq!(backend.convert_score(&hit_with_distance(1.7), &ds), 1.0);
        assert_eq!(backend.convert_score(&hit_with_distance(-0.2), &ds), 0.0);
    }

    #[test]
    fn test_vector_bytes_little_endian() {
        let bytes = RedisBackend::vector_bytes(&[1.0, -2.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-2.0f32).to_le_bytes());
    }

    #[test]
    fn test_parse_search_reply() -> Result<()> {
        let reply = RedisValue::Array(vec![
            RedisValue::Int(1),
            RedisValue::BulkString(b"faq:1".to_vec()),
            RedisValue::Array(vec![
                RedisValue::BulkString(b"content".to_vec()),
                RedisValue::BulkString(b"the document".to_vec()),
                RedisValue::BulkString(b"vector_score".to_vec()),
                RedisValue::BulkString(b"0.25".to_vec()),
                RedisValue::BulkString(b"category".to_vec()),
                RedisValue::BulkString(b"faq".to_vec()),
            ]),
        ]);

        let hits = parse_search_reply(&reply, "content", "embedding")?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document, "the document");
        assert_eq!(hits[0].distance, Some(0.25));
        assert_eq!(
            hits[0].metadata.get("category").and_then(Value::as_str),
            Some("faq")
        );
        Ok(())
    }
}
