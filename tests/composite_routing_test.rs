// Composite router scenarios: best-match routing across children, routing
// metadata enrichment, timeouts, and the below-threshold outcome.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use contextdb::{
    AdapterManager, CompositeIntentRetriever, CompositeSettings, ContextItem, Embedder,
    HashEmbedder, IntentChild, QueryOptions, Retriever, Template, TemplateMatch,
};

/// Child whose template store yields fixed matches and whose execution
/// returns one labeled item.
struct ScriptedChild {
    name: String,
    matches: Vec<(String, f32)>,
    delay: Option<Duration>,
}

#[async_trait]
impl IntentChild for ScriptedChild {
    async fn search_templates(
        &self,
        _query_embedding: &[f32],
        _limit: usize,
        threshold: f32,
    ) -> Result<Vec<TemplateMatch>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .matches
            .iter()
            .filter(|(_, similarity)| *similarity >= threshold)
            .map(|(id, similarity)| {
                let template = Template {
                    id: id.clone(),
                    description: format!("{id} description"),
                    ..Default::default()
                };
                TemplateMatch::new(Arc::new(template), *similarity, String::new())
            })
            .collect())
    }

    async fn get_relevant_context(
        &self,
        _query: &str,
        _options: &QueryOptions,
    ) -> Result<Vec<ContextItem>> {
        let best = &self.matches[0];
        Ok(vec![ContextItem::new(
            format!("answer from {}", self.name),
            "",
        )
        .with_metadata("source", json!("intent"))
        .with_metadata("template_id", json!(best.0))
        .with_confidence(best.1)])
    }
}

struct ScriptedManager {
    children: Vec<Arc<ScriptedChild>>,
}

#[async_trait]
impl AdapterManager for ScriptedManager {
    async fn get_intent_child(&self, name: &str) -> Result<Option<Arc<dyn IntentChild>>> {
        Ok(self
            .children
            .iter()
            .find(|child| child.name == name)
            .map(|child| child.clone() as Arc<dyn IntentChild>))
    }
}

fn embedder() -> Arc<dyn Embedder> {
    Arc::new(HashEmbedder::new(32))
}

fn settings(names: &[&str]) -> CompositeSettings {
    CompositeSettings {
        child_adapter_names: names.iter().map(|name| name.to_string()).collect(),
        confidence_threshold: 0.4,
        max_templates_per_source: 3,
        search_timeout: Duration::from_millis(200),
    }
}

fn sales_and_support(delay_support: Option<Duration>) -> Arc<ScriptedManager> {
    Arc::new(ScriptedManager {
        children: vec![
            Arc::new(ScriptedChild {
                name: "sales".to_string(),
                matches: vec![("quarterly_revenue".to_string(), 0.61)],
                delay: None,
            }),
            Arc::new(ScriptedChild {
                name: "support".to_string(),
                matches: vec![("refund_status".to_string(), 0.82)],
                delay: delay_support,
            }),
        ],
    })
}

#[tokio::test]
async fn test_routes_to_best_matching_child() -> Result<()> {
    let manager = sales_and_support(None);
    let composite = CompositeIntentRetriever::new(
        settings(&["sales", "support"]),
        manager,
        embedder(),
    );

    let items = composite
        .get_relevant_context("what is my refund status", &QueryOptions::default())
        .await?;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].content, "answer from support");

    let routing = items[0]
        .metadata
        .get("composite_routing")
        .expect("routing metadata attached");
    assert_eq!(
        routing.get("selected_adapter").and_then(|v| v.as_str()),
        Some("support")
    );
    assert_eq!(
        routing.get("template_id").and_then(|v| v.as_str()),
        Some("refund_status")
    );
    assert_eq!(
        routing.get("adapters_searched").cloned(),
        Some(json!(["sales", "support"]))
    );
    assert_eq!(
        routing.get("total_matches_found").and_then(|v| v.as_u64()),
        Some(2)
    );
    Ok(())
}

#[tokio::test]
async fn test_all_children_time_out() -> Result<()> {
    let slow = Some(Duration::from_secs(2));
    let manager = Arc::new(ScriptedManager {
        children: vec![
            Arc::new(ScriptedChild {
                name: "sales".to_string(),
                matches: vec![("quarterly_revenue".to_string(), 0.61)],
                delay: slow,
            }),
            Arc::new(ScriptedChild {
                name: "support".to_string(),
                matches: vec![("refund_status".to_string(), 0.82)],
                delay: slow,
            }),
        ],
    });

    let composite = CompositeIntentRetriever::new(
        settings(&["sales", "support"]),
        manager,
        embedder(),
    );

    let items = composite
        .get_relevant_context("anything", &QueryOptions::default())
        .await?;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].confidence, 0.0);
    assert_eq!(items[0].metadata_str("error"), Some("no_matching_template"));
    assert_eq!(
        items[0].metadata.get("searched_adapters").cloned(),
        Some(json!(["sales", "support"]))
    );
    Ok(())
}

#[tokio::test]
async fn test_below_threshold_outcome() -> Result<()> {
    let manager = Arc::new(ScriptedManager {
        children: vec![Arc::new(ScriptedChild {
            name: "sales".to_string(),
            matches: vec![("weak_match".to_string(), 0.45)],
            delay: None,
        })],
    });

    let mut composite_settings = settings(&["sales"]);
    composite_settings.confidence_threshold = 0.7;

    let composite =
        CompositeIntentRetriever::new(composite_settings, manager, embedder());

    let items = composite
        .get_relevant_context("anything", &QueryOptions::default())
        .await?;

    // The child reports a 0.45 match; the composite threshold is 0.7, so
    // the child's own store filter (0.7) returns nothing at all
    assert_eq!(items[0].confidence, 0.0);
    assert_eq!(items[0].metadata_str("error"), Some("no_matching_template"));
    Ok(())
}

#[tokio::test]
async fn test_below_threshold_with_visible_matches() -> Result<()> {
    // Child store filter admits the match, composite selection rejects it
    struct LooseChild;

    #[async_trait]
    impl IntentChild for LooseChild {
        async fn search_templates(
            &self,
            _query_embedding: &[f32],
            _limit: usize,
            _threshold: f32,
        ) -> Result<Vec<TemplateMatch>> {
            let template = Template {
                id: "weak_match".to_string(),
                ..Default::default()
            };
            Ok(vec![TemplateMatch::new(Arc::new(template), 0.3, String::new())])
        }

        async fn get_relevant_context(
            &self,
            _query: &str,
            _options: &QueryOptions,
        ) -> Result<Vec<ContextItem>> {
            Ok(vec![ContextItem::new("should not execute", "")])
        }
    }

    struct LooseManager;

    #[async_trait]
    impl AdapterManager for LooseManager {
        async fn get_intent_child(&self, _name: &str) -> Result<Option<Arc<dyn IntentChild>>> {
            Ok(Some(Arc::new(LooseChild)))
        }
    }

    let composite = CompositeIntentRetriever::new(
        settings(&["loose"]),
        Arc::new(LooseManager),
        embedder(),
    );

    let items = composite
        .get_relevant_context("anything", &QueryOptions::default())
        .await?;
    assert_eq!(items[0].metadata_str("error"), Some("below_threshold"));
    let best = items[0]
        .metadata
        .get("best_score")
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!((best - 0.3).abs() < 1e-6);
    Ok(())
}

#[tokio::test]
async fn test_missing_children_fail_initialize() {
    struct EmptyManager;

    #[async_trait]
    impl AdapterManager for EmptyManager {
        async fn get_intent_child(&self, _name: &str) -> Result<Option<Arc<dyn IntentChild>>> {
            Ok(None)
        }
    }

    let composite = CompositeIntentRetriever::new(
        settings(&["ghost"]),
        Arc::new(EmptyManager),
        embedder(),
    );
    assert!(composite.initialize().await.is_err());
}

#[tokio::test]
async fn test_close_leaves_children_alone() -> Result<()> {
    let manager = sales_and_support(None);
    let composite = CompositeIntentRetriever::new(
        settings(&["sales", "support"]),
        manager.clone(),
        embedder(),
    );
    composite.initialize().await?;
    composite.close().await?;

    // Children remain usable through the manager after composite close
    let child = manager.get_intent_child("support").await?.unwrap();
    let items = child
        .get_relevant_context("refund status", &QueryOptions::default())
        .await?;
    assert_eq!(items[0].content, "answer from support");
    Ok(())
}
