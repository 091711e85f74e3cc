mod config;
mod diagnostics;
mod stages;

pub use config::{
    AdaptiveRules, GraphStrategy, MergeStrategy, Normalization, RelationPair, RerankMode,
    RerankSettings, SearchConfig, TokenizerMode, WeightPair,
};
pub use diagnostics::{GraphProvenance, RetrievalRun, SourceCounts, StageTiming};
pub use stages::PipelineContext;

use async_trait::async_trait;
use common::error::AppError;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::RetrievalServices;

use stages::{AnalyzeQueryStage, BackfillStage, CollectCandidatesStage, FuseStage, RerankStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    AnalyzeQuery,
    CollectCandidates,
    Fuse,
    Backfill,
    Rerank,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }
}

/// Stages run for `config`, in order. Reranking is appended only when enabled.
pub fn stages_for(config: &SearchConfig) -> Vec<BoxedStage> {
    let mut stages: Vec<BoxedStage> = vec![
        Box::new(AnalyzeQueryStage),
        Box::new(CollectCandidatesStage),
        Box::new(FuseStage),
        Box::new(BackfillStage),
    ];
    if config.rerank.enabled {
        stages.push(Box::new(RerankStage));
    }
    stages
}

pub async fn run_pipeline(
    services: &RetrievalServices,
    kb_id: &str,
    query: &str,
    config: SearchConfig,
    cancel: CancellationToken,
) -> Result<RetrievalRun, AppError> {
    let input_chars = query.chars().count();
    let input_preview: String = query.chars().take(120).collect();
    let input_preview_clean = input_preview.replace('\n', " ");
    let preview_len = input_preview_clean.chars().count();
    info!(
        %kb_id,
        input_chars,
        preview_truncated = input_chars > preview_len,
        preview = %input_preview_clean,
        merge_strategy = %config.merge_strategy,
        normalization = %config.normalization,
        "Starting retrieval pipeline"
    );

    let stages = stages_for(&config);
    let mut ctx = PipelineContext::new(services, kb_id, query, config, cancel);

    for stage in stages {
        if ctx.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let start = Instant::now();
        stage.execute(&mut ctx).await?;
        ctx.record_stage_duration(stage.kind(), start.elapsed());
    }

    Ok(ctx.into_run())
}

pub(crate) fn round_score(value: f32) -> f64 {
    (f64::from(value) * 1000.0).round() / 1000.0
}
