use std::{fmt, str::FromStr};

use common::{error::AppError, utils::config::AppConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Normalization {
    #[default]
    #[value(name = "minmax")]
    MinMax,
    #[value(name = "zscore")]
    ZScore,
}

impl FromStr for Normalization {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minmax" | "min_max" | "min-max" => Ok(Self::MinMax),
            "zscore" | "z_score" | "z-score" => Ok(Self::ZScore),
            other => Err(format!("unknown normalization '{other}'")),
        }
    }
}

impl From<String> for Normalization {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|err| {
            tracing::warn!("{err}; falling back to 'minmax'");
            Self::MinMax
        })
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinMax => f.write_str("minmax"),
            Self::ZScore => f.write_str("zscore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum MergeStrategy {
    /// Union of text and graph evidence, weighted sum on overlap
    #[default]
    Hybrid,
    /// Only graph-discovered chunks; nothing when the graph has no answer
    GraphOnly,
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "graph_only" | "graph-only" | "graphonly" => Ok(Self::GraphOnly),
            other => Err(format!("unknown merge strategy '{other}'")),
        }
    }
}

impl From<String> for MergeStrategy {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|err| {
            tracing::warn!("{err}; falling back to 'hybrid'");
            Self::Hybrid
        })
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hybrid => f.write_str("hybrid"),
            Self::GraphOnly => f.write_str("graph_only"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerMode {
    /// Noun-like content tokens only
    Strict,
    /// Nouns, verbs and adjectives
    #[default]
    Extended,
}

/// A way of turning the analyzed query into graph evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GraphStrategy {
    Generative,
    Templated,
}

impl fmt::Display for GraphStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generative => f.write_str("generative"),
            Self::Templated => f.write_str("templated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RerankMode {
    #[default]
    CrossEncoder,
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightPair {
    pub vector: f32,
    pub graph: f32,
}

impl WeightPair {
    pub const fn new(vector: f32, graph: f32) -> Self {
        Self { vector, graph }
    }
}

/// Inputs of the adaptive weighting rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRules {
    /// Below this many graph hits the graph is considered under-populated.
    pub min_results: usize,
    pub fallback_weights: WeightPair,
    pub relation_keywords: Vec<String>,
    pub relation_weights: WeightPair,
}

impl Default for AdaptiveRules {
    fn default() -> Self {
        Self {
            min_results: 3,
            fallback_weights: WeightPair::new(0.9, 0.1),
            relation_keywords: default_relation_keywords(),
            relation_weights: WeightPair::new(0.4, 0.6),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationPair {
    pub relation: String,
    pub inverse: String,
}

impl RelationPair {
    fn new(relation: &str, inverse: &str) -> Self {
        Self {
            relation: relation.to_string(),
            inverse: inverse.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub enabled: bool,
    pub mode: RerankMode,
    /// Candidates scoring below this after reranking are dropped.
    pub threshold: f32,
    /// Parallel LLM scoring calls.
    pub concurrency: usize,
    pub keep_top: Option<usize>,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RerankMode::CrossEncoder,
            threshold: 0.0,
            concurrency: 4,
            keep_top: None,
        }
    }
}

/// Per-call retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub vector_weight: f32,
    pub graph_weight: f32,
    pub normalization: Normalization,
    pub merge_strategy: MergeStrategy,
    pub max_hops: u32,
    pub top_k: usize,
    pub score_threshold: f32,
    pub enable_adaptive_weights: bool,
    /// Vocabulary of words that usually name a graph relation.
    pub relation_keywords: Vec<String>,
    pub adaptive_rules: AdaptiveRules,

    /// Lexical share of the text channel when a chunk has both vector and lexical evidence.
    pub lexical_blend: f32,
    pub vector_take: usize,
    pub lexical_take: usize,
    pub graph_chunk_limit: usize,
    pub triple_limit: usize,
    pub tokenizer_mode: TokenizerMode,
    pub entity_stoplist: Vec<String>,
    /// Relation words too generic to filter graph traversal on.
    pub keyword_stopwords: Vec<String>,
    pub relation_inverses: Vec<RelationPair>,
    pub use_llm_entities: bool,
    pub graph_strategies: Vec<GraphStrategy>,
    pub source_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub rerank: RerankSettings,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.6,
            graph_weight: 0.4,
            normalization: Normalization::MinMax,
            merge_strategy: MergeStrategy::Hybrid,
            max_hops: 2,
            top_k: 10,
            score_threshold: 0.0,
            enable_adaptive_weights: true,
            relation_keywords: default_relation_keywords(),
            adaptive_rules: AdaptiveRules::default(),
            lexical_blend: 0.3,
            vector_take: 20,
            lexical_take: 20,
            graph_chunk_limit: 50,
            triple_limit: 30,
            tokenizer_mode: TokenizerMode::Extended,
            entity_stoplist: default_entity_stoplist(),
            keyword_stopwords: default_keyword_stopwords(),
            relation_inverses: default_relation_inverses(),
            use_llm_entities: true,
            graph_strategies: vec![GraphStrategy::Generative, GraphStrategy::Templated],
            source_timeout_ms: 8_000,
            llm_timeout_ms: 4_000,
            request_timeout_ms: 20_000,
            rerank: RerankSettings::default(),
        }
    }
}

impl SearchConfig {
    /// Defaults overlaid with the `[search]` table of the application config.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, AppError> {
        let search = match &config.search {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Self::default(),
        };
        search.validate()?;
        Ok(search)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.top_k == 0 {
            return Err(AppError::Validation("top_k must be greater than zero".into()));
        }
        for (name, weight) in [
            ("vector_weight", self.vector_weight),
            ("graph_weight", self.graph_weight),
            ("lexical_blend", self.lexical_blend),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AppError::Validation(format!(
                    "{name} must be a non-negative number, got {weight}"
                )));
            }
        }
        if self.lexical_blend > 1.0 {
            return Err(AppError::Validation(
                "lexical_blend must lie within [0, 1]".into(),
            ));
        }
        if self.rerank.enabled && self.rerank.concurrency == 0 {
            return Err(AppError::Validation(
                "rerank.concurrency must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_relation_keywords() -> Vec<String> {
    [
        "role", "teacher", "student", "mentor", "advisor", "supervisor", "founder", "author",
        "member", "employee", "employer", "colleague", "parent", "child", "spouse", "sibling",
        "partner", "owner", "manager", "relationship", "related", "relation", "connection",
        "works", "worked", "studied", "taught", "founded", "wrote", "married", "leads",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_entity_stoplist() -> Vec<String> {
    [
        "content", "result", "results", "person", "people", "thing", "things", "information",
        "document", "documents", "question", "answer", "example", "what", "who", "which",
        "where", "when", "why", "how", "the", "a", "an", "is", "are", "tell", "show", "list",
        "find", "please", "i", "me", "explain", "compare", "describe", "summarize", "summarise",
        "define", "give", "name", "identify", "outline", "discuss", "contrast", "did", "does",
        "do", "was", "were", "can", "could",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_keyword_stopwords() -> Vec<String> {
    ["relationship", "related", "relation", "connection"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_relation_inverses() -> Vec<RelationPair> {
    vec![
        RelationPair::new("teacher", "student"),
        RelationPair::new("mentor", "mentee"),
        RelationPair::new("advisor", "advisee"),
        RelationPair::new("supervisor", "subordinate"),
        RelationPair::new("parent", "child"),
        RelationPair::new("employer", "employee"),
        RelationPair::new("manager", "report"),
        RelationPair::new("author", "work"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_names_fall_back_to_defaults() {
        let config: SearchConfig = serde_json::from_value(serde_json::json!({
            "merge_strategy": "top_n_boost",
            "normalization": "softmax"
        }))
        .expect("config deserializes");

        assert_eq!(config.merge_strategy, MergeStrategy::Hybrid);
        assert_eq!(config.normalization, Normalization::MinMax);
    }

    #[test]
    fn test_known_names_and_partial_tables() {
        let config: SearchConfig = serde_json::from_value(serde_json::json!({
            "merge_strategy": "graph_only",
            "normalization": "zscore",
            "top_k": 3,
            "adaptive_rules": { "min_results": 5 },
            "rerank": { "enabled": true, "mode": "llm" },
            "graph_strategies": ["templated"]
        }))
        .expect("config deserializes");

        assert_eq!(config.merge_strategy, MergeStrategy::GraphOnly);
        assert_eq!(config.normalization, Normalization::ZScore);
        assert_eq!(config.top_k, 3);
        assert_eq!(config.adaptive_rules.min_results, 5);
        assert_eq!(config.adaptive_rules.fallback_weights, WeightPair::new(0.9, 0.1));
        assert_eq!(config.rerank.mode, RerankMode::Llm);
        assert_eq!(config.rerank.concurrency, 4);
        assert_eq!(config.graph_strategies, vec![GraphStrategy::Templated]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_strategy_order() {
        let config = SearchConfig::default();
        assert_eq!(
            config.graph_strategies,
            vec![GraphStrategy::Generative, GraphStrategy::Templated]
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_k = SearchConfig {
            top_k: 0,
            ..SearchConfig::default()
        };
        assert!(matches!(zero_k.validate(), Err(AppError::Validation(_))));

        let negative = SearchConfig {
            graph_weight: -0.1,
            ..SearchConfig::default()
        };
        assert!(matches!(negative.validate(), Err(AppError::Validation(_))));
    }
}
