// Template reranking
// Adjusts vector-similarity scores with additive boosts from domain
// vocabulary: entity and action matches, qualifiers, tags, and lexical
// overlap with the natural-language examples. The strategy can contribute a
// disambiguation boost of up to +/-0.3. Scores cap at 1.0.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::domain::strategy::DomainStrategy;
use crate::domain::DomainConfig;
use crate::types::TemplateMatch;

pub struct TemplateReranker {
    domain: Arc<DomainConfig>,
    strategy: Arc<dyn DomainStrategy>,
}

impl TemplateReranker {
    pub fn new(domain: Arc<DomainConfig>, strategy: Arc<dyn DomainStrategy>) -> Self {
        Self { domain, strategy }
    }

    /// Apply boosts and re-sort by adjusted similarity, highest first.
    pub fn rerank(&self, mut matches: Vec<TemplateMatch>, query: &str) -> Vec<TemplateMatch> {
        let query_lower = query.to_lowercase();

        for candidate in matches.iter_mut() {
            let mut boost = 0.0f32;
            let template = &candidate.template;

            if let Some(tags) = &template.semantic_tags {
                if let Some(primary) = &tags.primary_entity {
                    boost += self.entity_boost(&query_lower, primary);
                }
                if let Some(action) = &tags.action {
                    boost += self.action_boost(&query_lower, action);
                }
                for qualifier in &tags.qualifiers {
                    if query_lower.contains(&qualifier.to_lowercase()) {
                        boost += 0.1;
                    }
                }
            }

            for tag in &template.tags {
                if query_lower.contains(&tag.to_lowercase()) {
                    boost += 0.05;
                }
            }

            // Best lexical overlap with an example counts when substantial
            let best_example = template
                .nl_examples
                .iter()
                .map(|example| jaccard_similarity(&query_lower, &example.to_lowercase()))
                .fold(0.0f32, f32::max);
            if best_example > 0.5 {
                boost += best_example * 0.2;
            }

            let domain_boost = self
                .strategy
                .calculate_domain_boost(template, query)
                .clamp(-0.3, 0.3);
            boost += domain_boost;

            let original = candidate.similarity;
            candidate.similarity = (original + boost).clamp(0.0, 1.0);
            candidate.boost_applied = boost;

            if boost != 0.0 {
                debug!(
                    "Template {} boosted by {boost:.3} ({original:.3} -> {:.3})",
                    candidate.template_id, candidate.similarity
                );
            }
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches
    }

    /// +0.2 for the entity name, +0.15 for any one synonym.
    fn entity_boost(&self, query_lower: &str, primary_entity: &str) -> f32 {
        let mut boost = 0.0;

        if query_lower.contains(&primary_entity.to_lowercase()) {
            boost += 0.2;
        }

        for synonym in self.domain.entity_synonyms(primary_entity) {
            if query_lower.contains(&synonym.to_lowercase()) {
                boost += 0.15;
                break;
            }
        }

        boost
    }

    /// +0.15 when the action verb or one of its synonyms appears.
    fn action_boost(&self, query_lower: &str, action: &str) -> f32 {
        let mut verbs: Vec<&str> = self
            .domain
            .action_synonyms(action)
            .iter()
            .map(String::as_str)
            .collect();
        verbs.push(action);

        for verb in verbs {
            if query_lower.contains(&verb.to_lowercase()) {
                return 0.15;
            }
        }
        0.0
    }

    /// Human-readable ranking explanation for the top entries.
    pub fn explain_ranking(&self, matches: &[TemplateMatch]) -> String {
        let mut lines = vec![
            "Template Ranking Explanation:".to_string(),
            "=".repeat(30),
        ];

        for (index, candidate) in matches.iter().take(5).enumerate() {
            let original = candidate.similarity - candidate.boost_applied;
            lines.push(format!(
                "{}. {} (similarity: {:.3})",
                index + 1,
                candidate.template_id,
                candidate.similarity
            ));
            lines.push(format!(
                "   Original: {original:.3}, Boost: {:+.3}",
                candidate.boost_applied
            ));
            lines.push(format!(
                "   Description: {}",
                candidate.template.description
            ));
            if let Some(tags) = &candidate.template.semantic_tags {
                lines.push(format!(
                    "   Entity: {}, Action: {}",
                    tags.primary_entity.as_deref().unwrap_or("N/A"),
                    tags.action.as_deref().unwrap_or("N/A")
                ));
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }
}

/// Word-set Jaccard similarity between two lowercased strings.
pub fn jaccard_similarity(a: &str, b: &str) -> f32 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();

    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f32 / union as f32
}
