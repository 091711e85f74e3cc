use serde::Serialize;

use crate::pipeline::{AdaptiveRules, WeightPair};

/// Which rule produced the weights of a fusion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightRule {
    NoGraphEvidence,
    SparseGraph,
    RelationQuery,
    Base,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionWeights {
    pub vector: f32,
    pub graph: f32,
    pub rule: WeightRule,
}

/// Chooses fusion weights from graph sparsity and the wording of the query.
///
/// Rules apply in order, the first match wins:
/// no graph hits, fewer hits than `rules.min_results`, a relation keyword in the
/// query, otherwise the base weights.
pub fn adjust_weights(
    query: &str,
    graph_result_count: usize,
    base: WeightPair,
    rules: &AdaptiveRules,
) -> FusionWeights {
    if graph_result_count == 0 {
        return FusionWeights {
            vector: 1.0,
            graph: 0.0,
            rule: WeightRule::NoGraphEvidence,
        };
    }

    if graph_result_count < rules.min_results {
        return with_rule(rules.fallback_weights, WeightRule::SparseGraph);
    }

    let lowered = query.to_lowercase();
    if rules
        .relation_keywords
        .iter()
        .filter(|keyword| !keyword.trim().is_empty())
        .any(|keyword| lowered.contains(&keyword.trim().to_lowercase()))
    {
        return with_rule(rules.relation_weights, WeightRule::RelationQuery);
    }

    with_rule(base, WeightRule::Base)
}

/// Base weights as configured, used when adaptive weighting is switched off.
pub const fn fixed_weights(base: WeightPair) -> FusionWeights {
    with_rule(base, WeightRule::Fixed)
}

const fn with_rule(pair: WeightPair, rule: WeightRule) -> FusionWeights {
    FusionWeights {
        vector: pair.vector,
        graph: pair.graph,
        rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> AdaptiveRules {
        AdaptiveRules {
            min_results: 3,
            fallback_weights: WeightPair::new(0.9, 0.1),
            relation_keywords: vec!["teacher".into(), "Role".into()],
            relation_weights: WeightPair::new(0.3, 0.7),
        }
    }

    #[test]
    fn test_no_graph_results_forces_pure_vector() {
        let weights = adjust_weights(
            "who was the teacher of Curie",
            0,
            WeightPair::new(0.6, 0.4),
            &rules(),
        );
        assert_eq!((weights.vector, weights.graph), (1.0, 0.0));
        assert_eq!(weights.rule, WeightRule::NoGraphEvidence);
    }

    #[test]
    fn test_sparse_graph_uses_fallback() {
        let weights = adjust_weights("teacher of Curie", 1, WeightPair::new(0.6, 0.4), &rules());
        assert_eq!((weights.vector, weights.graph), (0.9, 0.1));
        assert_eq!(weights.rule, WeightRule::SparseGraph);
    }

    #[test]
    fn test_relation_keyword_is_case_insensitive() {
        let weights = adjust_weights(
            "What ROLE did Langevin play?",
            5,
            WeightPair::new(0.6, 0.4),
            &rules(),
        );
        assert_eq!((weights.vector, weights.graph), (0.3, 0.7));
        assert_eq!(weights.rule, WeightRule::RelationQuery);
    }

    #[test]
    fn test_plain_query_keeps_base() {
        let base = WeightPair::new(0.6, 0.4);
        let weights = adjust_weights("radioactivity in Paris", 5, base, &rules());
        assert_eq!((weights.vector, weights.graph), (0.6, 0.4));
        assert_eq!(weights.rule, WeightRule::Base);

        let again = adjust_weights("radioactivity in Paris", 5, base, &rules());
        assert_eq!(weights, again);
    }
}
