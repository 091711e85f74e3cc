use std::{collections::HashMap, time::Duration};

use common::{
    error::AppError,
    storage::{store::VectorStore, types::text_chunk::TextChunk},
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    pipeline::{MergeStrategy, Normalization},
    scoring::{compare_scored, hop_to_similarity, normalize, RawHit, SourceScores},
    weights::FusionWeights,
    ResultSource, RetrievalResult,
};

/// Normalized evidence gathered for one chunk id before fusion.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    /// Content in hand; graph-only candidates have none.
    pub chunk: Option<TextChunk>,
    pub scores: SourceScores,
    pub graph_distance: Option<u32>,
}

/// Normalizes each source on its own and merges the results by chunk id.
///
/// Graph evidence enters as `1 / (1 + distance)` before normalization.
pub fn collect_candidates(
    vector: Vec<RawHit>,
    lexical: Vec<RawHit>,
    graph: &[(String, u32)],
    method: Normalization,
) -> HashMap<String, Candidate> {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    let vector_scores = normalize(method, &raw_scores(&vector));
    for (hit, score) in vector.into_iter().zip(vector_scores) {
        let entry = candidates.entry(hit.chunk.id.clone()).or_default();
        entry.scores.vector = Some(score);
        entry.chunk.get_or_insert(hit.chunk);
    }

    let lexical_scores = normalize(method, &raw_scores(&lexical));
    for (hit, score) in lexical.into_iter().zip(lexical_scores) {
        let entry = candidates.entry(hit.chunk.id.clone()).or_default();
        entry.scores.lexical = Some(score);
        entry.chunk.get_or_insert(hit.chunk);
    }

    let graph_raw: Vec<f32> = graph.iter().map(|(_, hops)| hop_to_similarity(*hops)).collect();
    let graph_scores = normalize(method, &graph_raw);
    for ((chunk_id, hops), score) in graph.iter().zip(graph_scores) {
        let entry = candidates.entry(chunk_id.clone()).or_default();
        entry.scores.graph = Some(score);
        entry.graph_distance = Some(entry.graph_distance.map_or(*hops, |d| d.min(*hops)));
    }

    candidates
}

fn raw_scores(hits: &[RawHit]) -> Vec<f32> {
    hits.iter().map(|hit| hit.raw_score).collect()
}

/// Knobs of a single fusion pass.
#[derive(Debug, Clone, Copy)]
pub struct FusionParams {
    pub strategy: MergeStrategy,
    pub weights: FusionWeights,
    pub lexical_blend: f32,
    pub score_threshold: f32,
    pub top_k: usize,
}

/// Combines per-source evidence into one ranked list.
///
/// Graph-only entries come back with empty content and `needs_fetch` set;
/// run [`backfill`] before handing them out.
pub fn fuse(candidates: HashMap<String, Candidate>, params: &FusionParams) -> Vec<RetrievalResult> {
    let graph_only = params.strategy == MergeStrategy::GraphOnly;
    if graph_only && candidates.values().all(|candidate| candidate.scores.graph.is_none()) {
        debug!("Graph-only merge without graph evidence, returning nothing");
        return Vec::new();
    }

    let mut results: Vec<RetrievalResult> = candidates
        .into_iter()
        .filter(|(_, candidate)| !graph_only || candidate.scores.graph.is_some())
        .filter_map(|(chunk_id, candidate)| fuse_candidate(chunk_id, candidate, params))
        .filter(|result| params.score_threshold <= 0.0 || result.final_score >= params.score_threshold)
        .collect();

    results.sort_by(|a, b| compare_scored(a.final_score, &a.chunk_id, b.final_score, &b.chunk_id));
    results.truncate(params.top_k);
    results
}

fn fuse_candidate(
    chunk_id: String,
    candidate: Candidate,
    params: &FusionParams,
) -> Option<RetrievalResult> {
    let text = candidate.scores.text_channel(params.lexical_blend);
    let graph = candidate.scores.graph;
    let weights = params.weights;

    let (final_score, source) = match (text, graph) {
        (Some(text), Some(graph)) => (
            weights.vector.mul_add(text, weights.graph * graph),
            ResultSource::Hybrid,
        ),
        (Some(text), None) => {
            let source = if candidate.scores.vector.is_some() {
                ResultSource::Vector
            } else {
                ResultSource::Lexical
            };
            (weights.vector * text, source)
        }
        (None, Some(graph)) => (weights.graph * graph, ResultSource::Graph),
        (None, None) => return None,
    };

    let needs_fetch = candidate.chunk.is_none();
    let (content, doc_id, metadata) = match candidate.chunk {
        Some(chunk) => (chunk.content, Some(chunk.doc_id), chunk.metadata),
        None => (String::new(), None, None),
    };

    Some(RetrievalResult {
        chunk_id,
        content,
        doc_id,
        metadata,
        final_score,
        per_source_scores: candidate.scores,
        source,
        graph_distance: candidate.graph_distance,
        needs_fetch,
        content_missing: false,
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BackfillReport {
    pub requested: usize,
    pub found: usize,
    pub missing: usize,
    pub failed: bool,
}

/// Fetches content for every `needs_fetch` entry in one store call.
///
/// Ids the store does not know keep empty content and get `content_missing`.
/// A failed or timed out call marks every pending entry that way instead of
/// failing the query.
pub async fn backfill(
    results: &mut [RetrievalResult],
    store: &dyn VectorStore,
    kb_id: &str,
    timeout: Duration,
) -> BackfillReport {
    let fetched = fetch_pending(results, store, kb_id, timeout).await;
    apply_backfill(results, fetched)
}

async fn fetch_pending(
    results: &[RetrievalResult],
    store: &dyn VectorStore,
    kb_id: &str,
    timeout: Duration,
) -> Option<Result<Vec<TextChunk>, AppError>> {
    let pending: Vec<String> = results
        .iter()
        .filter(|result| result.needs_fetch && !result.content_missing && result.content.is_empty())
        .map(|result| result.chunk_id.clone())
        .collect();
    if pending.is_empty() {
        return None;
    }
    let fetched = tokio::time::timeout(timeout, store.fetch_by_ids(kb_id, &pending))
        .await
        .unwrap_or_else(|_| {
            Err(AppError::Timeout(format!(
                "backfill exceeded {}ms",
                timeout.as_millis()
            )))
        });
    Some(fetched)
}

/// Applies a fetch outcome, `None` meaning nothing was pending.
fn apply_backfill(
    results: &mut [RetrievalResult],
    fetched: Option<Result<Vec<TextChunk>, AppError>>,
) -> BackfillReport {
    let mut report = BackfillReport::default();
    let Some(fetched) = fetched else {
        return report;
    };

    let mut by_id: HashMap<String, TextChunk> = match fetched {
        Ok(chunks) => chunks.into_iter().map(|chunk| (chunk.id.clone(), chunk)).collect(),
        Err(err) => {
            warn!(error = %err, "Backfill fetch failed, marking graph-only results as missing");
            report.failed = true;
            HashMap::new()
        }
    };

    for result in results
        .iter_mut()
        .filter(|result| result.needs_fetch && !result.content_missing && result.content.is_empty())
    {
        report.requested += 1;
        match by_id.remove(&result.chunk_id) {
            Some(chunk) => {
                result.content = chunk.content;
                result.doc_id = Some(chunk.doc_id);
                result.metadata = chunk.metadata;
                report.found += 1;
            }
            None => {
                result.content_missing = true;
                report.missing += 1;
            }
        }
    }

    debug!(
        requested = report.requested,
        found = report.found,
        missing = report.missing,
        "Backfill finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use common::storage::store::VectorHit;

    use super::*;
    use crate::weights::WeightRule;

    fn weights(vector: f32, graph: f32) -> FusionWeights {
        FusionWeights {
            vector,
            graph,
            rule: WeightRule::Base,
        }
    }

    fn params(strategy: MergeStrategy) -> FusionParams {
        FusionParams {
            strategy,
            weights: weights(0.6, 0.4),
            lexical_blend: 0.3,
            score_threshold: 0.0,
            top_k: 10,
        }
    }

    fn text_candidate(id: &str, vector: f32) -> (String, Candidate) {
        (
            id.to_string(),
            Candidate {
                chunk: Some(TextChunk::with_id(id, "kb", "doc", format!("content {id}"), Vec::new())),
                scores: SourceScores {
                    vector: Some(vector),
                    ..SourceScores::default()
                },
                graph_distance: None,
            },
        )
    }

    fn graph_candidate(id: &str, graph: f32, hops: u32) -> (String, Candidate) {
        (
            id.to_string(),
            Candidate {
                chunk: None,
                scores: SourceScores {
                    graph: Some(graph),
                    ..SourceScores::default()
                },
                graph_distance: Some(hops),
            },
        )
    }

    fn hit(id: &str, raw_score: f32) -> RawHit {
        RawHit {
            chunk: TextChunk::with_id(id, "kb", "doc", format!("content {id}"), Vec::new()),
            raw_score,
        }
    }

    #[test]
    fn test_hybrid_combines_both_channels() {
        let (id, mut candidate) = text_candidate("c1", 0.8);
        candidate.scores.graph = Some(1.0);
        candidate.graph_distance = Some(0);
        let candidates = HashMap::from([(id, candidate)]);

        let results = fuse(candidates, &params(MergeStrategy::Hybrid));
        assert_eq!(results.len(), 1);
        assert!((results[0].final_score - 0.88).abs() < 1e-6);
        assert_eq!(results[0].source, ResultSource::Hybrid);
        assert!(!results[0].needs_fetch);
    }

    #[test]
    fn test_hybrid_sources_and_fetch_flags() {
        let mut lexical_only = text_candidate("lex", 0.5);
        lexical_only.1.scores = SourceScores {
            lexical: Some(0.5),
            ..SourceScores::default()
        };
        let candidates = HashMap::from([
            text_candidate("vec", 1.0),
            graph_candidate("graph", 1.0, 1),
            lexical_only,
        ]);

        let results = fuse(candidates, &params(MergeStrategy::Hybrid));
        let by_id: HashMap<&str, &RetrievalResult> =
            results.iter().map(|r| (r.chunk_id.as_str(), r)).collect();

        assert_eq!(by_id["vec"].source, ResultSource::Vector);
        assert!((by_id["vec"].final_score - 0.6).abs() < 1e-6);
        assert_eq!(by_id["lex"].source, ResultSource::Lexical);
        assert_eq!(by_id["graph"].source, ResultSource::Graph);
        assert!(by_id["graph"].needs_fetch);
        assert!(by_id["graph"].content.is_empty());
        assert_eq!(by_id["graph"].graph_distance, Some(1));
    }

    #[test]
    fn test_ties_break_by_chunk_id() {
        let build = || {
            HashMap::from([
                text_candidate("b", 0.5),
                text_candidate("a", 0.5),
                text_candidate("c", 0.9),
            ])
        };
        let first = fuse(build(), &params(MergeStrategy::Hybrid));
        let second = fuse(build(), &params(MergeStrategy::Hybrid));

        let ids: Vec<&str> = first.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_graph_only_without_graph_is_empty() {
        let candidates = HashMap::from([text_candidate("a", 1.0), text_candidate("b", 0.4)]);
        assert!(fuse(candidates, &params(MergeStrategy::GraphOnly)).is_empty());
    }

    #[test]
    fn test_graph_only_restricts_to_graph_chunks() {
        let (id, mut overlap) = text_candidate("both", 0.5);
        overlap.scores.graph = Some(0.5);
        let candidates = HashMap::from([
            (id, overlap),
            text_candidate("text", 1.0),
            graph_candidate("graph", 1.0, 0),
        ]);

        let results = fuse(candidates, &params(MergeStrategy::GraphOnly));
        let ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["both", "graph"]);
        assert_eq!(results[0].source, ResultSource::Hybrid);
    }

    #[test]
    fn test_threshold_and_top_k() {
        let candidates = HashMap::from([
            text_candidate("a", 1.0),
            text_candidate("b", 0.9),
            text_candidate("c", 0.1),
        ]);
        let mut params = params(MergeStrategy::Hybrid);
        params.score_threshold = 0.5;
        params.top_k = 1;

        let results = fuse(candidates, &params);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "a");
    }

    #[test]
    fn test_collect_candidates_normalizes_per_source() {
        let candidates = collect_candidates(
            vec![hit("a", 0.9), hit("b", 0.5)],
            vec![hit("b", 12.0), hit("c", 3.0)],
            &[("c".to_string(), 2), ("d".to_string(), 0)],
            Normalization::MinMax,
        );

        assert_eq!(candidates["a"].scores.vector, Some(1.0));
        assert_eq!(candidates["b"].scores.vector, Some(0.0));
        assert_eq!(candidates["b"].scores.lexical, Some(1.0));
        assert_eq!(candidates["c"].scores.graph, Some(0.0));
        assert_eq!(candidates["c"].graph_distance, Some(2));
        assert!(candidates["c"].chunk.is_some());
        assert!(candidates["d"].chunk.is_none());
        assert_eq!(candidates["d"].scores.graph, Some(1.0));
    }

    #[test]
    fn test_zscore_candidates_fuse_in_score_order() {
        let candidates = collect_candidates(
            vec![hit("a", 3.0), hit("b", 1.0)],
            Vec::new(),
            &[("a".to_string(), 0), ("g".to_string(), 1)],
            Normalization::ZScore,
        );
        let high = 1.0 / (1.0 + (-1.0f32).exp());
        let low = 1.0 - high;
        assert!((candidates["a"].scores.vector.unwrap_or_default() - high).abs() < 1e-5);
        assert!((candidates["b"].scores.vector.unwrap_or_default() - low).abs() < 1e-5);
        assert!((candidates["g"].scores.graph.unwrap_or_default() - low).abs() < 1e-5);

        let results = fuse(candidates, &params(MergeStrategy::Hybrid));
        let ranked: Vec<(&str, ResultSource)> = results
            .iter()
            .map(|r| (r.chunk_id.as_str(), r.source))
            .collect();
        assert_eq!(
            ranked,
            vec![
                ("a", ResultSource::Hybrid),
                ("b", ResultSource::Vector),
                ("g", ResultSource::Graph)
            ]
        );
        assert!((results[0].final_score - high).abs() < 1e-5);
        assert!((results[1].final_score - 0.6 * low).abs() < 1e-5);
        assert!((results[2].final_score - 0.4 * low).abs() < 1e-5);
        assert!(results[2].needs_fetch);
    }

    struct PartialStore;

    #[async_trait]
    impl VectorStore for PartialStore {
        async fn search(&self, _kb_id: &str, _embedding: &[f32], _take: usize) -> Result<Vec<VectorHit>, AppError> {
            Ok(Vec::new())
        }

        async fn fetch_by_ids(&self, kb_id: &str, ids: &[String]) -> Result<Vec<TextChunk>, AppError> {
            Ok(ids
                .iter()
                .filter(|id| id.as_str() != "gone")
                .map(|id| TextChunk::with_id(id.as_str(), kb_id, "doc-9", format!("fetched {id}"), Vec::new()))
                .collect())
        }
    }

    struct OfflineStore;

    #[async_trait]
    impl VectorStore for OfflineStore {
        async fn search(&self, _kb_id: &str, _embedding: &[f32], _take: usize) -> Result<Vec<VectorHit>, AppError> {
            Ok(Vec::new())
        }

        async fn fetch_by_ids(&self, _kb_id: &str, _ids: &[String]) -> Result<Vec<TextChunk>, AppError> {
            Err(AppError::InternalError("store offline".into()))
        }
    }

    #[tokio::test]
    async fn test_backfill_marks_missing_ids() {
        let candidates = HashMap::from([
            graph_candidate("found", 1.0, 0),
            graph_candidate("gone", 0.5, 1),
            text_candidate("text", 0.7),
        ]);
        let mut results = fuse(candidates, &params(MergeStrategy::Hybrid));
        let store = PartialStore;

        let report = backfill(&mut results, &store, "kb", Duration::from_secs(1)).await;
        let by_id: HashMap<&str, &RetrievalResult> =
            results.iter().map(|r| (r.chunk_id.as_str(), r)).collect();

        assert_eq!(report.requested, 2);
        assert_eq!(report.found, 1);
        assert_eq!(by_id["found"].content, "fetched found");
        assert_eq!(by_id["found"].doc_id.as_deref(), Some("doc-9"));
        assert!(!by_id["found"].content_missing);
        assert!(by_id["gone"].content_missing);
        assert!(by_id["gone"].content.is_empty());
        assert_eq!(by_id["text"].content, "content text");
    }

    #[tokio::test]
    async fn test_backfill_failure_marks_all_pending() {
        let candidates = HashMap::from([graph_candidate("x", 1.0, 0), graph_candidate("y", 0.2, 2)]);
        let mut results = fuse(candidates, &params(MergeStrategy::Hybrid));
        let store = OfflineStore;

        let report = backfill(&mut results, &store, "kb", Duration::from_secs(1)).await;
        assert!(report.failed);
        assert!(results.iter().all(|r| r.content_missing));
        assert_eq!(results.len(), 2);
    }
}
