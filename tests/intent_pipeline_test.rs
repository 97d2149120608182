// End-to-end intent pipeline scenarios: SQL execution over in-memory
// SQLite, parameter validation failure, template store rebuild on
// dimension change, and dropped-connection recovery.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use contextdb::{
    DatasourceConfig, DomainConfig, HashEmbedder, Inference, IntentAdapter, IntentSettings,
    IntentSqlRetriever, QueryOptions, Retriever, SqlDriver, SqliteDriver, StaticInference,
    Template, TemplateLibrary,
};

const DOMAIN_YAML: &str = r#"
domain_name: customer_orders
domain_type: retail
description: Customers and their orders
entities:
  customer:
    entity_type: primary
    table_name: customers
    primary_key: id
  order:
    entity_type: transaction
    table_name: orders
    primary_key: id
fields:
  customer:
    name:
      data_type: string
      searchable: true
vocabulary:
  entity_synonyms:
    customer: [client, buyer]
  action_verbs:
    find: [show, list]
"#;

const TEMPLATES_YAML: &str = r#"
templates:
  - id: orders_by_customer
    description: Find orders for a customer by name
    nl_examples:
      - "orders from John Smith"
      - "show me orders for a customer"
    tags: [orders, customer]
    semantic_tags:
      action: find
      primary_entity: customer
      secondary_entity: order
    parameters:
      - name: customer_name
        type: string
        description: Customer full name
        required: true
    sql_template: "SELECT id, total FROM orders WHERE name LIKE {{ customer_name | sql_string }}"
"#;

fn intent_adapter() -> Arc<IntentAdapter> {
    let domain = DomainConfig::from_yaml(DOMAIN_YAML).expect("domain parses");
    let mut templates = TemplateLibrary::new();
    templates
        .merge_yaml(TEMPLATES_YAML)
        .expect("templates parse");
    Arc::new(IntentAdapter::from_parts(domain, templates, 0.3))
}

fn settings() -> IntentSettings {
    IntentSettings {
        confidence_threshold: 0.2,
        ..Default::default()
    }
}

async fn seeded_sqlite() -> Result<Arc<SqliteDriver>> {
    let driver = Arc::new(SqliteDriver::new(DatasourceConfig::default()));
    driver.connect().await?;
    driver
        .execute(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, name TEXT, total REAL)",
            &[],
        )
        .await?;
    driver
        .execute(
            "INSERT INTO orders (id, name, total) VALUES
             (1, 'John Smith', 99.5),
             (2, 'John Smith', 12.0),
             (3, 'Jane Doe', 45.0)",
            &[],
        )
        .await?;
    Ok(driver)
}

fn retriever_with(
    driver: Arc<dyn SqlDriver>,
    inference: Arc<dyn Inference>,
) -> IntentSqlRetriever {
    IntentSqlRetriever::new(
        intent_adapter(),
        Arc::new(HashEmbedder::new(128)),
        inference,
        driver,
        settings(),
    )
}

#[tokio::test]
async fn test_intent_sql_success() -> Result<()> {
    let driver = seeded_sqlite().await?;
    let retriever = retriever_with(
        driver,
        Arc::new(StaticInference::new("Found 2 orders for John Smith.")),
    );
    retriever.initialize().await?;

    let items = retriever
        .get_relevant_context("orders from John Smith", &QueryOptions::default())
        .await?;

    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.metadata_str("template_id"), Some("orders_by_customer"));
    assert_eq!(item.content, "Found 2 orders for John Smith.");

    // The LIKE heuristic wrapped the extracted name
    let parameters = item
        .metadata
        .get("parameters_used")
        .and_then(Value::as_object)
        .expect("parameters recorded");
    assert_eq!(
        parameters.get("customer_name").and_then(Value::as_str),
        Some("%John Smith%")
    );

    let result_count = item
        .metadata
        .get("result_count")
        .and_then(Value::as_u64)
        .expect("result count recorded");
    assert_eq!(result_count, 2);

    let similarity = item
        .metadata
        .get("similarity")
        .and_then(Value::as_f64)
        .expect("similarity recorded");
    assert!((item.confidence as f64 - similarity).abs() < 1e-6);
    Ok(())
}

#[tokio::test]
async fn test_parameter_extraction_failure() -> Result<()> {
    let driver = seeded_sqlite().await?;
    let retriever = retriever_with(driver, Arc::new(StaticInference::new("NOT_FOUND")));
    retriever.initialize().await?;

    // No name is extractable and the LLM fallback reports NOT_FOUND
    let items = retriever
        .get_relevant_context("show me some orders", &QueryOptions::default())
        .await?;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].confidence, 0.0);
    assert_eq!(
        items[0].metadata_str("error"),
        Some("parameter_extraction_failed")
    );
    Ok(())
}

#[tokio::test]
async fn test_intent_never_errors_after_initialize() -> Result<()> {
    let driver = seeded_sqlite().await?;
    let retriever = retriever_with(driver, Arc::new(StaticInference::new("NOT_FOUND")));
    retriever.initialize().await?;

    for query in ["", "show me some orders", "completely unrelated gibberish"] {
        let items = retriever
            .get_relevant_context(query, &QueryOptions::default())
            .await?;
        assert!(!items.is_empty(), "query '{query}' returned no items");
    }
    Ok(())
}

#[tokio::test]
async fn test_deterministic_output() -> Result<()> {
    let driver = seeded_sqlite().await?;
    let retriever = retriever_with(driver, Arc::new(StaticInference::new("Answer.")));
    retriever.initialize().await?;

    let first = retriever
        .get_relevant_context("orders from John Smith", &QueryOptions::default())
        .await?;
    let second = retriever
        .get_relevant_context("orders from John Smith", &QueryOptions::default())
        .await?;

    assert_eq!(first[0].content, second[0].content);
    assert_eq!(first[0].confidence, second[0].confidence);
    Ok(())
}

#[tokio::test]
async fn test_template_store_rebuild_on_dimension_change() -> Result<()> {
    let temp = TempDir::new()?;
    let store_path = temp.path().join("templates.bin");

    let persistent_settings = |reload: bool| IntentSettings {
        confidence_threshold: 0.2,
        store_path: Some(store_path.clone()),
        reload_templates_on_start: reload,
        ..Default::default()
    };

    // First run with a 384-dimensional embedder
    {
        let driver = seeded_sqlite().await?;
        let retriever = IntentSqlRetriever::new(
            intent_adapter(),
            Arc::new(HashEmbedder::new(384)),
            Arc::new(StaticInference::new("Answer.")),
            driver,
            persistent_settings(true),
        );
        retriever.initialize().await?;
        assert_eq!(retriever.pipeline().store_count().await, 1);
        retriever.close().await?;
    }

    // Second run with a 768-dimensional embedder and reload disabled: the
    // dimension change still forces a rebuild
    let driver = seeded_sqlite().await?;
    let retriever = IntentSqlRetriever::new(
        intent_adapter(),
        Arc::new(HashEmbedder::new(768)),
        Arc::new(StaticInference::new("Rebuilt answer.")),
        driver,
        persistent_settings(false),
    );
    retriever.initialize().await?;
    assert_eq!(retriever.pipeline().store_count().await, 1);

    // First post-restart query succeeds
    let items = retriever
        .get_relevant_context("orders from John Smith", &QueryOptions::default())
        .await?;
    assert_eq!(items[0].metadata_str("template_id"), Some("orders_by_customer"));
    Ok(())
}

/// Driver whose first statement after arming reports a dropped connection,
/// delegating everything else to a real in-memory SQLite.
struct DroppingDriver {
    inner: Arc<SqliteDriver>,
    armed: AtomicBool,
}

#[async_trait]
impl SqlDriver for DroppingDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn reconnect(&self) -> Result<()> {
        // The in-memory database must survive; only the failure arms reset
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn execute(&self, sql: &str, binds: &[Value]) -> Result<Vec<Map<String, Value>>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            anyhow::bail!("connection closed unexpectedly");
        }
        self.inner.execute(sql, binds).await
    }
}

#[tokio::test]
async fn test_connection_drop_recovery() -> Result<()> {
    let inner = seeded_sqlite().await?;
    let driver = Arc::new(DroppingDriver {
        inner,
        armed: AtomicBool::new(false),
    });

    let retriever = IntentSqlRetriever::new(
        intent_adapter(),
        Arc::new(HashEmbedder::new(128)),
        Arc::new(StaticInference::new("Recovered answer.")),
        driver.clone(),
        settings(),
    );
    retriever.initialize().await?;

    // Arm the failure: the next statement reports a closed connection
    driver.armed.store(true, Ordering::SeqCst);

    let items = retriever
        .get_relevant_context("orders from John Smith", &QueryOptions::default())
        .await?;

    assert_eq!(items[0].content, "Recovered answer.");
    let result_count = items[0]
        .metadata
        .get("result_count")
        .and_then(Value::as_u64)
        .unwrap();
    assert_eq!(result_count, 2);
    assert_eq!(retriever.reconnect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_template_store_yields_no_matching_template() -> Result<()> {
    let domain = DomainConfig::from_yaml(DOMAIN_YAML)?;
    let adapter = Arc::new(IntentAdapter::from_parts(
        domain,
        TemplateLibrary::new(),
        0.3,
    ));

    let driver = seeded_sqlite().await?;
    let retriever = IntentSqlRetriever::new(
        adapter,
        Arc::new(HashEmbedder::new(128)),
        Arc::new(StaticInference::new("NOT_FOUND")),
        driver,
        settings(),
    );
    retriever.initialize().await?;

    let items = retriever
        .get_relevant_context("orders from John Smith", &QueryOptions::default())
        .await?;
    assert_eq!(items[0].metadata_str("error"), Some("no_matching_template"));
    assert_eq!(items[0].confidence, 0.0);
    Ok(())
}

#[tokio::test]
async fn test_reinitialize_is_noop() -> Result<()> {
    let driver = seeded_sqlite().await?;
    let retriever = retriever_with(driver, Arc::new(StaticInference::new("Answer.")));
    retriever.initialize().await?;
    let count_before = retriever.pipeline().store_count().await;
    retriever.initialize().await?;
    assert_eq!(retriever.pipeline().store_count().await, count_before);
    Ok(())
}

/// A template whose only parameter declares itself via a default: the
/// defaults pass makes execution succeed without any extraction.
#[tokio::test]
async fn test_default_parameter_flows_through() -> Result<()> {
    let domain = DomainConfig::from_yaml(DOMAIN_YAML)?;
    let mut templates = TemplateLibrary::new();
    templates.insert(Template {
        id: "recent_orders".to_string(),
        description: "List recent orders with a limit".to_string(),
        nl_examples: vec!["recent orders".to_string()],
        sql_template: Some("SELECT id, total FROM orders LIMIT {{ row_limit }}".to_string()),
        parameters: vec![contextdb::TemplateParameter {
            name: "row_limit".to_string(),
            data_type: Some("integer".to_string()),
            default: Some(serde_json::json!(2)),
            ..Default::default()
        }],
        ..Default::default()
    });
    let adapter = Arc::new(IntentAdapter::from_parts(domain, templates, 0.3));

    let driver = seeded_sqlite().await?;
    let retriever = IntentSqlRetriever::new(
        adapter,
        Arc::new(HashEmbedder::new(128)),
        Arc::new(StaticInference::new("Two recent orders.")),
        driver,
        settings(),
    );
    retriever.initialize().await?;

    let items = retriever
        .get_relevant_context("recent orders", &QueryOptions::default())
        .await?;
    assert_eq!(items[0].metadata_str("template_id"), Some("recent_orders"));
    let result_count = items[0]
        .metadata
        .get("result_count")
        .and_then(Value::as_u64)
        .unwrap();
    assert_eq!(result_count, 2);
    Ok(())
}
