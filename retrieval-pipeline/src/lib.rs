pub mod fts;
pub mod fusion;
pub mod graph;
pub mod pipeline;
pub mod query_analysis;
pub mod reranking;
pub mod scoring;
pub mod tokenizer;
pub mod vector;
pub mod weights;

use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    graph::GraphStore,
    storage::store::{LexicalCorpus, VectorStore},
    utils::{embedding::Embedder, llm::LanguageModel},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

pub use pipeline::{
    MergeStrategy, Normalization, PipelineStageTimings, RetrievalRun, SearchConfig, StageKind,
};
use pipeline::round_score;
use reranking::PairScorer;
use scoring::SourceScores;
use tokenizer::Tokenizer;

/// Which evidence a result owes its score to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Vector,
    Lexical,
    Graph,
    Hybrid,
}

/// One ranked chunk returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub final_score: f32,
    pub per_source_scores: SourceScores,
    pub source: ResultSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_distance: Option<u32>,
    /// Content was not in hand at fusion time and came from the backfill fetch.
    pub needs_fetch: bool,
    /// Backfill could not find the chunk; `content` is empty.
    pub content_missing: bool,
}

/// Long-lived collaborators, built once at startup and shared by every query.
#[derive(Clone)]
pub struct RetrievalServices {
    pub embedder: Arc<dyn Embedder>,
    pub vector_store: Arc<dyn VectorStore>,
    pub corpus: Arc<dyn LexicalCorpus>,
    pub graph_store: Arc<dyn GraphStore>,
    pub llm: Option<Arc<dyn LanguageModel>>,
    pub tokenizer: Arc<Tokenizer>,
    pub reranker: Option<Arc<dyn PairScorer>>,
}

/// Ranked chunks for `query_text`, best first, at most `config.top_k` of them.
#[instrument(skip_all, fields(kb_id))]
pub async fn retrieve(
    services: &RetrievalServices,
    kb_id: &str,
    query_text: &str,
    config: SearchConfig,
    cancel: &CancellationToken,
) -> Result<Vec<RetrievalResult>, AppError> {
    retrieve_with_diagnostics(services, kb_id, query_text, config, cancel)
        .await
        .map(|run| run.results)
}

/// Same as [`retrieve`] plus provenance, weights, per-source counts and stage timings.
///
/// Source failures only thin out the results. The call itself fails when the
/// query is empty, the configuration is invalid, `cancel` fires or the request
/// deadline passes.
#[instrument(skip_all, fields(kb_id))]
pub async fn retrieve_with_diagnostics(
    services: &RetrievalServices,
    kb_id: &str,
    query_text: &str,
    config: SearchConfig,
    cancel: &CancellationToken,
) -> Result<RetrievalRun, AppError> {
    if query_text.trim().is_empty() {
        return Err(AppError::Validation("query must not be empty".into()));
    }
    config.validate()?;

    let deadline = Duration::from_millis(config.request_timeout_ms);
    let run = pipeline::run_pipeline(services, kb_id, query_text, config, cancel.clone());

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AppError::Cancelled),
        outcome = tokio::time::timeout(deadline, run) => match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Retrieval exceeded the request deadline");
                Err(AppError::Timeout(format!(
                    "retrieval exceeded {}ms",
                    deadline.as_millis()
                )))
            }
        },
    }
}

pub fn retrieved_results_to_json(results: &[RetrievalResult]) -> serde_json::Value {
    serde_json::json!(results
        .iter()
        .map(|result| {
            serde_json::json!({
                "chunk_id": result.chunk_id,
                "doc_id": result.doc_id,
                "score": round_score(result.final_score),
                "source": result.source,
                "scores": {
                    "vector": result.per_source_scores.vector.map(round_score),
                    "lexical": result.per_source_scores.lexical.map(round_score),
                    "graph": result.per_source_scores.graph.map(round_score),
                },
                "graph_distance": result.graph_distance,
                "content": result.content,
                "content_missing": result.content_missing,
                "metadata": result.metadata,
            })
        })
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{
        graph::QueryDialect,
        storage::{
            db::SurrealDbClient,
            store::{SurrealChunkStore, VectorHit},
            types::text_chunk::TextChunk,
        },
        utils::embedding::EmbeddingProvider,
    };
    use graph::test_support::{row, RecordingStore};
    use pipeline::GraphStrategy;
    use uuid::Uuid;

    const DIM: usize = 32;

    struct OfflineVectors;

    #[async_trait]
    impl VectorStore for OfflineVectors {
        async fn search(&self, _kb_id: &str, _embedding: &[f32], _take: usize) -> Result<Vec<VectorHit>, AppError> {
            Err(AppError::InternalError("vector index offline".into()))
        }

        async fn fetch_by_ids(&self, _kb_id: &str, _ids: &[String]) -> Result<Vec<TextChunk>, AppError> {
            Err(AppError::InternalError("vector index offline".into()))
        }
    }

    /// Never answers, so only cancellation or deadlines end a query using it.
    struct StalledCorpus;

    #[async_trait]
    impl LexicalCorpus for StalledCorpus {
        async fn enumerate(&self, _kb_id: &str) -> Result<Vec<TextChunk>, AppError> {
            std::future::pending().await
        }
    }

    async fn seeded_store() -> Arc<SurrealChunkStore> {
        let db = Arc::new(
            SurrealDbClient::memory("retrieval_test", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        let embedder = EmbeddingProvider::new_hashed(DIM);
        let chunks = [
            ("c1", "Marie Curie discovered polonium and radium in Paris."),
            ("c2", "Pierre Curie was a teacher of physics at the Sorbonne."),
            ("c3", "The Sorbonne is a university in Paris."),
            ("c4", "Paul Langevin was a student of Pierre Curie."),
        ];
        for (id, content) in chunks {
            let embedding = embedder.embed(content).await.expect("embedding");
            let chunk = TextChunk::with_id(id, "kb", "doc-1", content, embedding)
                .with_metadata(serde_json::json!({ "page": id.trim_start_matches('c') }));
            db.store_item(chunk).await.expect("store chunk");
        }
        Arc::new(SurrealChunkStore::new(db))
    }

    fn graph_with(rows: Vec<(&'static str, &'static str)>) -> Arc<RecordingStore> {
        Arc::new(RecordingStore::new(QueryDialect::Sparql, move |query| {
            if query.contains("GROUP BY ?chunk") {
                Ok(rows
                    .iter()
                    .map(|&(chunk, hop)| row(&[("chunk", chunk), ("hop", hop)]))
                    .collect())
            } else {
                Ok(Vec::new())
            }
        }))
    }

    fn services(
        vector_store: Arc<dyn VectorStore>,
        corpus: Arc<dyn LexicalCorpus>,
        graph_store: Arc<dyn GraphStore>,
    ) -> RetrievalServices {
        RetrievalServices {
            embedder: Arc::new(EmbeddingProvider::new_hashed(DIM)),
            vector_store,
            corpus,
            graph_store,
            llm: None,
            tokenizer: Arc::new(Tokenizer::new()),
            reranker: None,
        }
    }

    fn templated_config() -> SearchConfig {
        SearchConfig {
            graph_strategies: vec![GraphStrategy::Templated],
            use_llm_entities: false,
            ..SearchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_hybrid_retrieval_with_backfill() {
        let store = seeded_store().await;
        let graph = graph_with(vec![("c4", "1"), ("c2", "0"), ("ghost", "2")]);
        let services = services(store.clone(), store, graph.clone());

        let run = retrieve_with_diagnostics(
            &services,
            "kb",
            "Who was the teacher of Pierre Curie?",
            templated_config(),
            &CancellationToken::new(),
        )
        .await
        .expect("retrieval succeeds");

        assert!(!run.results.is_empty());
        assert!(run.results.len() <= 10);
        assert!(run
            .results
            .windows(2)
            .all(|pair| pair[0].final_score >= pair[1].final_score));
        assert!(run.entities.iter().any(|entity| entity == "Pierre Curie"));
        assert!(run.keywords.iter().any(|keyword| keyword == "student"));
        assert_eq!(run.provenance.strategy, Some(GraphStrategy::Templated));
        assert_eq!(run.source_counts.graph, 3);

        let by_id: std::collections::HashMap<&str, &RetrievalResult> =
            run.results.iter().map(|r| (r.chunk_id.as_str(), r)).collect();
        let ghost = by_id.get("ghost").expect("graph-only miss is kept");
        assert!(ghost.content_missing);
        assert!(ghost.content.is_empty());
        assert_eq!(by_id["c2"].source, ResultSource::Hybrid);
        assert_eq!(by_id["c2"].metadata, Some(serde_json::json!({ "page": "2" })));
        assert!(ghost.metadata.is_none());
        assert!(!by_id["c4"].content.is_empty());
        assert!(!by_id["c4"].content_missing);
        assert!(!graph.queries().is_empty());
    }

    #[tokio::test]
    async fn test_vector_failure_still_returns_results() {
        let store = seeded_store().await;
        let graph = graph_with(vec![("c2", "0")]);
        let services = services(Arc::new(OfflineVectors), store, graph);

        let results = retrieve(
            &services,
            "kb",
            "Pierre Curie physics teacher",
            templated_config(),
            &CancellationToken::new(),
        )
        .await
        .expect("partial failure is not an error");

        assert!(!results.is_empty());
        assert!(results
            .iter()
            .all(|result| result.per_source_scores.vector.is_none()));
    }

    #[tokio::test]
    async fn test_graph_only_without_graph_evidence_is_empty() {
        let store = seeded_store().await;
        let graph = graph_with(Vec::new());
        let services = services(store.clone(), store, graph);
        let config = SearchConfig {
            merge_strategy: MergeStrategy::GraphOnly,
            ..templated_config()
        };

        let results = retrieve(
            &services,
            "kb",
            "Marie Curie polonium",
            config,
            &CancellationToken::new(),
        )
        .await
        .expect("retrieval succeeds");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_as_cancelled() {
        let store = seeded_store().await;
        let services = services(store, Arc::new(StalledCorpus), graph_with(Vec::new()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = retrieve(&services, "kb", "Marie Curie", templated_config(), &cancel).await;
        assert!(matches!(outcome, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_request_deadline_surfaces_as_timeout() {
        let store = seeded_store().await;
        let services = services(store, Arc::new(StalledCorpus), graph_with(Vec::new()));
        let config = SearchConfig {
            request_timeout_ms: 50,
            ..templated_config()
        };

        let outcome = retrieve(&services, "kb", "Marie Curie", config, &CancellationToken::new()).await;
        assert!(matches!(outcome, Err(AppError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let store = seeded_store().await;
        let services = services(store.clone(), store, graph_with(Vec::new()));
        let outcome = retrieve(&services, "kb", "   ", templated_config(), &CancellationToken::new()).await;
        assert!(matches!(outcome, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_results_json_rounds_scores() {
        let result = RetrievalResult {
            chunk_id: "c1".into(),
            content: "text".into(),
            doc_id: Some("d1".into()),
            metadata: None,
            final_score: 0.876_54,
            per_source_scores: SourceScores {
                vector: Some(0.123_456),
                ..SourceScores::default()
            },
            source: ResultSource::Vector,
            graph_distance: None,
            needs_fetch: false,
            content_missing: false,
        };

        let json = retrieved_results_to_json(&[result]);
        assert_eq!(json[0]["score"], serde_json::json!(0.877));
        assert_eq!(json[0]["scores"]["vector"], serde_json::json!(0.123));
        assert_eq!(json[0]["source"], serde_json::json!("vector"));
    }
}
