// contextdb - A pluggable retrieval core for RAG servers
// Root library module

pub mod adapters;
pub mod composite;
pub mod config;
pub mod contracts;
pub mod domain;
pub mod embeddings;
pub mod errors;
pub mod inference;
pub mod intent;
pub mod observability;
pub mod registry;
pub mod sql;
pub mod templates;
pub mod types;
pub mod vector;

// Re-export logging helpers
pub use observability::{init_logging, init_logging_with_level};

// Re-export core contracts
pub use contracts::{
    AdapterManager, ApiKeyResolver, DocumentAdapter, Embedder, Inference, IntentChild, Retriever,
};

// Re-export core value types
pub use types::{ContextItem, QueryOptions, TemplateMatch, VectorHit};

// Re-export configuration
pub use config::{AppConfig, DatasourceConfig};

// Re-export error taxonomy
pub use errors::{ExecError, RetrievalError};

// Re-export registries
pub use registry::{global_factory, global_registry, AdapterRegistry, RetrieverFactory};

// Re-export adapters
pub use adapters::{FileAdapter, GenericAdapter, IntentAdapter, QaAdapter};

// Re-export embedding and inference providers
pub use embeddings::{create_embedder, EmbeddingConfig, EmbeddingService, HashEmbedder, HttpEmbedder};
pub use inference::{HttpInference, InferenceConfig, StaticInference};

// Re-export the vector pipeline and backends
pub use vector::chroma::ChromaBackend;
pub use vector::elasticsearch::ElasticsearchBackend;
pub use vector::milvus::MilvusBackend;
pub use vector::pinecone::PineconeBackend;
pub use vector::qdrant::QdrantBackend;
pub use vector::redis::RedisBackend;
pub use vector::{VectorBackend, VectorRetriever};

// Re-export the SQL layer
pub use sql::mysql::MysqlDriver;
pub use sql::postgres::PostgresDriver;
pub use sql::sqlite::SqliteDriver;
pub use sql::SqlDriver;

// Re-export the intent pipeline
pub use intent::http::HttpIntentRetriever;
pub use intent::processor::TemplateProcessor;
pub use intent::reranker::TemplateReranker;
pub use intent::template_store::TemplateStore;
pub use intent::{IntentPipeline, IntentSettings, IntentSqlRetriever, TemplateExecutor};

// Re-export the composite router
pub use composite::{CompositeIntentRetriever, CompositeSettings};

// Re-export the domain subsystem
pub use domain::extraction::DomainParameterExtractor;
pub use domain::response::DomainResponseGenerator;
pub use domain::strategy::{DomainStrategy, DomainStrategyRegistry, GenericDomainStrategy};
pub use domain::DomainConfig;

// Re-export the template model
pub use templates::{Template, TemplateLibrary, TemplateParameter};
