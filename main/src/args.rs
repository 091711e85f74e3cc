use clap::Parser;
use retrieval_pipeline::{
    pipeline::{GraphStrategy, RerankMode},
    MergeStrategy, Normalization, SearchConfig,
};

/// Run one hybrid retrieval query against a knowledge base and print the ranked chunks as JSON.
#[derive(Debug, Parser)]
#[command(name = "retrieve", version)]
pub struct Args {
    /// Knowledge base to search
    pub kb_id: String,

    /// Natural-language question
    pub query: String,

    /// Config file name, loaded before environment variables
    #[arg(long, default_value = "config")]
    pub config: String,

    /// Override the merge strategy
    #[arg(long, value_enum)]
    pub merge_strategy: Option<MergeStrategy>,

    /// Override score normalization
    #[arg(long, value_enum)]
    pub normalization: Option<Normalization>,

    /// Override the number of results returned
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Override the maximum graph traversal depth
    #[arg(long)]
    pub max_hops: Option<u32>,

    /// Override the minimum fused score
    #[arg(long)]
    pub score_threshold: Option<f32>,

    /// Use only these graph strategies, in the given order
    #[arg(long = "graph-strategy", value_enum)]
    pub graph_strategies: Vec<GraphStrategy>,

    /// Keep base weights regardless of graph evidence
    #[arg(long, action = clap::ArgAction::SetTrue, default_value_t = false)]
    pub fixed_weights: bool,

    /// Skip the LLM call during entity extraction
    #[arg(long, action = clap::ArgAction::SetTrue, default_value_t = false)]
    pub no_llm_entities: bool,

    /// Rerank fused results with the given scorer
    #[arg(long, value_enum)]
    pub rerank: Option<RerankMode>,

    /// Print provenance, weights, counts and stage timings alongside the results
    #[arg(long, action = clap::ArgAction::SetTrue, default_value_t = false)]
    pub diagnostics: bool,
}

impl Args {
    /// Applies command-line overrides on top of the configured search defaults.
    pub fn apply(&self, mut search: SearchConfig) -> SearchConfig {
        if let Some(strategy) = self.merge_strategy {
            search.merge_strategy = strategy;
        }
        if let Some(normalization) = self.normalization {
            search.normalization = normalization;
        }
        if let Some(top_k) = self.top_k {
            search.top_k = top_k;
        }
        if let Some(max_hops) = self.max_hops {
            search.max_hops = max_hops;
        }
        if let Some(threshold) = self.score_threshold {
            search.score_threshold = threshold;
        }
        if !self.graph_strategies.is_empty() {
            search.graph_strategies.clone_from(&self.graph_strategies);
        }
        if self.fixed_weights {
            search.enable_adaptive_weights = false;
        }
        if self.no_llm_entities {
            search.use_llm_entities = false;
        }
        if let Some(mode) = self.rerank {
            search.rerank.enabled = true;
            search.rerank.mode = mode;
        }
        search
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_configured_values() {
        let args = Args::parse_from([
            "retrieve",
            "kb-1",
            "who taught Curie",
            "--merge-strategy",
            "graph-only",
            "--normalization",
            "zscore",
            "--top-k",
            "3",
            "--graph-strategy",
            "templated",
            "--rerank",
            "llm",
            "--no-llm-entities",
        ]);

        let search = args.apply(SearchConfig::default());
        assert_eq!(search.merge_strategy, MergeStrategy::GraphOnly);
        assert_eq!(search.normalization, Normalization::ZScore);
        assert_eq!(search.top_k, 3);
        assert_eq!(search.graph_strategies, vec![GraphStrategy::Templated]);
        assert!(search.rerank.enabled);
        assert_eq!(search.rerank.mode, RerankMode::Llm);
        assert!(!search.use_llm_entities);
        assert!(search.enable_adaptive_weights);
    }

    #[test]
    fn test_no_overrides_keep_defaults() {
        let args = Args::parse_from(["retrieve", "kb-1", "question"]);
        let defaults = SearchConfig::default();
        let search = args.apply(defaults.clone());

        assert_eq!(search.merge_strategy, defaults.merge_strategy);
        assert_eq!(search.top_k, defaults.top_k);
        assert_eq!(search.graph_strategies, defaults.graph_strategies);
        assert!(!search.rerank.enabled);
        assert!(!args.diagnostics);
    }
}
