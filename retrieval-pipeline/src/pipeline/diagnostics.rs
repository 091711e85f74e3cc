use serde::Serialize;

use crate::{
    fusion::BackfillReport,
    graph::{GraphAttempt, Triple},
    reranking::RerankReport,
    weights::FusionWeights,
    RetrievalResult,
};

use super::{GraphStrategy, StageKind};

/// Candidate counts per source before fusion.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceCounts {
    pub vector: usize,
    pub lexical: usize,
    pub graph: usize,
}

/// Where the graph evidence came from, for display next to the results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphProvenance {
    pub strategy: Option<GraphStrategy>,
    pub raw_query: String,
    pub triples: Vec<Triple>,
    pub attempts: Vec<GraphAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: StageKind,
    pub millis: u128,
}

/// Results of one query plus how they were produced.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalRun {
    pub results: Vec<RetrievalResult>,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
    pub provenance: GraphProvenance,
    pub weights: Option<FusionWeights>,
    pub source_counts: SourceCounts,
    pub backfill: BackfillReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<RerankReport>,
    pub stage_timings: Vec<StageTiming>,
}
