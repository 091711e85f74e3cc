use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use common::error::AppError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    fts::LexicalSearcher,
    fusion::{backfill, collect_candidates, fuse, BackfillReport, Candidate, FusionParams},
    graph::{
        GenerativeBackend, GraphBackend, GraphRequest, GraphSearchOutcome, GraphSearcher,
        TemplatedBackend,
    },
    query_analysis::{QueryAnalysis, QueryAnalyzer},
    reranking::{RerankReport, Reranker},
    vector::{VectorSearchOutcome, VectorSearcher},
    weights::{adjust_weights, fixed_weights, FusionWeights},
    RetrievalResult, RetrievalServices,
};

use super::{
    diagnostics::{GraphProvenance, RetrievalRun, SourceCounts, StageTiming},
    GraphStrategy, PipelineStage, PipelineStageTimings, SearchConfig, StageKind, WeightPair,
};

pub struct PipelineContext<'a> {
    pub services: &'a RetrievalServices,
    pub kb_id: String,
    pub query: String,
    pub config: SearchConfig,
    pub cancel: CancellationToken,
    pub analysis: QueryAnalysis,
    pub query_embedding: Option<Vec<f32>>,
    pub candidates: HashMap<String, Candidate>,
    pub graph: GraphSearchOutcome,
    pub source_counts: SourceCounts,
    pub weights: Option<FusionWeights>,
    pub results: Vec<RetrievalResult>,
    pub backfill: BackfillReport,
    pub rerank: Option<RerankReport>,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        services: &'a RetrievalServices,
        kb_id: &str,
        query: &str,
        config: SearchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            services,
            kb_id: kb_id.to_owned(),
            query: query.to_owned(),
            config,
            cancel,
            analysis: QueryAnalysis::default(),
            query_embedding: None,
            candidates: HashMap::new(),
            graph: GraphSearchOutcome::default(),
            source_counts: SourceCounts::default(),
            weights: None,
            results: Vec::new(),
            backfill: BackfillReport::default(),
            rerank: None,
            stage_timings: PipelineStageTimings::default(),
        }
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: Duration) {
        self.stage_timings.record(kind, duration);
    }

    fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.config.source_timeout_ms)
    }

    pub fn into_run(self) -> RetrievalRun {
        let GraphSearchOutcome {
            result,
            strategy,
            attempts,
        } = self.graph;

        RetrievalRun {
            results: self.results,
            entities: self.analysis.entities,
            keywords: self.analysis.keywords.into_iter().collect(),
            provenance: GraphProvenance {
                strategy,
                raw_query: result.raw_query,
                triples: result.triples,
                attempts,
            },
            weights: self.weights,
            source_counts: self.source_counts,
            backfill: self.backfill,
            rerank: self.rerank,
            stage_timings: self
                .stage_timings
                .into_vec()
                .into_iter()
                .map(|(stage, duration)| StageTiming {
                    stage,
                    millis: duration.as_millis(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzeQueryStage;

#[async_trait]
impl PipelineStage for AnalyzeQueryStage {
    fn kind(&self) -> StageKind {
        StageKind::AnalyzeQuery
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        analyze_query(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectCandidatesStage;

#[async_trait]
impl PipelineStage for CollectCandidatesStage {
    fn kind(&self) -> StageKind {
        StageKind::CollectCandidates
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        collect_sources(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FuseStage;

#[async_trait]
impl PipelineStage for FuseStage {
    fn kind(&self) -> StageKind {
        StageKind::Fuse
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        fuse_candidates(ctx)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackfillStage;

#[async_trait]
impl PipelineStage for BackfillStage {
    fn kind(&self) -> StageKind {
        StageKind::Backfill
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        backfill_results(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        rerank(ctx).await
    }
}

/// Runs `source` under its own deadline and the request's cancellation token.
/// Expiry or cancellation yields the empty value for that source only.
async fn guard_source<T, F>(
    source: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    future: F,
) -> T
where
    T: Default,
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(source, "Source abandoned after cancellation");
            T::default()
        }
        outcome = tokio::time::timeout(timeout, future) => outcome.unwrap_or_else(|_| {
            warn!(source, timeout_ms = timeout.as_millis() as u64, "Source timed out, continuing without it");
            T::default()
        }),
    }
}

#[instrument(level = "trace", skip_all)]
pub async fn analyze_query(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let services = ctx.services;
    let llm = if ctx.config.use_llm_entities {
        services.llm.as_deref()
    } else {
        None
    };
    let analyzer = QueryAnalyzer::new(&services.tokenizer, llm);

    let analysis = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return Err(AppError::Cancelled),
        analysis = analyzer.analyze(&ctx.query, &ctx.config) => analysis,
    };
    ctx.analysis = analysis;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn collect_sources(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    debug!("Collecting candidates from vector, lexical and graph sources");
    let services = ctx.services;
    let timeout = ctx.source_timeout();
    let config = &ctx.config;

    let vector_searcher = VectorSearcher::new(services.vector_store.as_ref(), services.embedder.as_ref());
    let lexical_searcher = LexicalSearcher::new(services.corpus.as_ref(), &services.tokenizer);

    let templated = TemplatedBackend::new(services.graph_store.as_ref());
    let generative = services.llm.as_deref().map(|llm| {
        GenerativeBackend::new(
            services.graph_store.as_ref(),
            llm,
            Duration::from_millis(config.llm_timeout_ms),
        )
    });
    let backends: Vec<&dyn GraphBackend> = config
        .graph_strategies
        .iter()
        .filter_map(|strategy| match strategy {
            GraphStrategy::Templated => Some(&templated as &dyn GraphBackend),
            GraphStrategy::Generative => generative.as_ref().map(|backend| backend as &dyn GraphBackend),
        })
        .collect();
    // 90% of the source deadline; the rest is left for recording timed-out attempts.
    let graph_budget = timeout
        .checked_div(10)
        .map_or(timeout, |slack| timeout.saturating_sub(slack));
    let graph_searcher = GraphSearcher::new(backends).with_budget(graph_budget);
    let graph_request = GraphRequest {
        entities: &ctx.analysis.entities,
        keywords: &ctx.analysis.keywords,
        max_hops: config.max_hops,
        query_text: &ctx.query,
        chunk_limit: config.graph_chunk_limit,
        triple_limit: config.triple_limit,
    };

    let (vector, lexical, graph): (VectorSearchOutcome, _, GraphSearchOutcome) = tokio::join!(
        guard_source(
            "vector",
            timeout,
            &ctx.cancel,
            vector_searcher.search(&ctx.kb_id, &ctx.query, config.vector_take),
        ),
        guard_source(
            "lexical",
            timeout,
            &ctx.cancel,
            lexical_searcher.search(&ctx.kb_id, &ctx.query, config.lexical_take, config.tokenizer_mode),
        ),
        guard_source("graph", timeout, &ctx.cancel, graph_searcher.search(&graph_request)),
    );

    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    let counts = SourceCounts {
        vector: vector.hits.len(),
        lexical: lexical.len(),
        graph: graph.result.chunk_ids.len(),
    };
    debug!(
        vector = counts.vector,
        lexical = counts.lexical,
        graph = counts.graph,
        triples = graph.result.triples.len(),
        "Candidate counts per source"
    );

    let base = WeightPair::new(config.vector_weight, config.graph_weight);
    let weights = if config.enable_adaptive_weights {
        adjust_weights(&ctx.query, counts.graph, base, &config.adaptive_rules)
    } else {
        fixed_weights(base)
    };
    debug!(vector = weights.vector, graph = weights.graph, rule = ?weights.rule, "Fusion weights chosen");

    let candidates = collect_candidates(
        vector.hits,
        lexical,
        &graph.result.chunk_ids,
        config.normalization,
    );

    ctx.query_embedding = vector.query_embedding;
    ctx.candidates = candidates;
    ctx.graph = graph;
    ctx.source_counts = counts;
    ctx.weights = Some(weights);
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub fn fuse_candidates(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let weights = ctx
        .weights
        .ok_or_else(|| AppError::InternalError("fusion weights missing before fusion".into()))?;
    let params = FusionParams {
        strategy: ctx.config.merge_strategy,
        weights,
        lexical_blend: ctx.config.lexical_blend,
        score_threshold: ctx.config.score_threshold,
        top_k: ctx.config.top_k,
    };

    ctx.results = fuse(std::mem::take(&mut ctx.candidates), &params);
    debug!(
        results = ctx.results.len(),
        pending_fetch = ctx.results.iter().filter(|result| result.needs_fetch).count(),
        "Fusion finished"
    );
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn backfill_results(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let timeout = ctx.source_timeout();
    let store = ctx.services.vector_store.as_ref();

    let report = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return Err(AppError::Cancelled),
        report = backfill(&mut ctx.results, store, &ctx.kb_id, timeout) => report,
    };
    ctx.backfill = report;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn rerank(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let services = ctx.services;
    let reranker = Reranker {
        scorer: services.reranker.as_deref(),
        llm: services.llm.as_deref(),
        embedder: services.embedder.as_ref(),
        llm_timeout: Duration::from_millis(ctx.config.llm_timeout_ms),
    };
    let results = std::mem::take(&mut ctx.results);

    let (results, report) = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return Err(AppError::Cancelled),
        outcome = reranker.rerank(
            &ctx.query,
            ctx.query_embedding.as_deref(),
            results,
            &ctx.config.rerank,
        ) => outcome,
    };
    ctx.results = results;
    ctx.rerank = Some(report);
    Ok(())
}
