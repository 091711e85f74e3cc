mod llm;

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{config::AppConfig, embedding::Embedder, llm::LanguageModel},
};
use fastembed::{RerankInitOptions, RerankResult, TextRerank};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    pipeline::{RerankMode, RerankSettings},
    scoring::{compare_scored, cosine_similarity, sigmoid},
    RetrievalResult,
};

pub use llm::{llm_relevance, parse_relevance_reply};

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Scores `(query, document)` pairs with a pairwise relevance model.
#[async_trait]
pub trait PairScorer: Send + Sync {
    /// Raw relevance logits, in document order.
    async fn score_pairs(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError>;
}

pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
}

impl RerankerPool {
    /// Build the pool at startup.
    /// `pool_size` controls max parallel reranks.
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranking_pool_size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating cross-encoder engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
        }))
    }

    /// Builds the pool when cross-encoder reranking is switched on.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);
        let init_options = build_rerank_init_options(config)?;
        Self::new_with_options(pool_size, init_options).map(Some)
    }

    /// Waits for a free engine. The permit is held by the returned lease.
    pub async fn checkout(&self) -> Result<RerankerLease, AppError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool is closed".into()))?;

        let idx = pick_engine_index(self.engines.len());
        let engine = self.engines[idx].clone();

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

#[async_trait]
impl PairScorer for RerankerPool {
    async fn score_pairs(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        let expected = documents.len();
        let lease = self.checkout().await?;
        let results = lease.rerank(query, documents).await?;

        let mut scores = vec![f32::NEG_INFINITY; expected];
        for RerankResult { index, score, .. } in results {
            if let Some(slot) = scores.get_mut(index) {
                *slot = score;
            }
        }
        Ok(scores)
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = RerankInitOptions::default();

    let cache_dir = config
        .fastembed_cache_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| env::var("RERANKING_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;

    options.show_download_progress = config
        .fastembed_show_download_progress
        .or_else(|| env::var("RERANKING_SHOW_DOWNLOAD_PROGRESS").ok().map(|v| is_truthy(&v)))
        .unwrap_or(false);

    if let Some(max_length) = config.fastembed_max_length {
        options.max_length = max_length;
    }

    Ok(options)
}

/// Active lease on a single TextRerank instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    pub async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankResult>, AppError> {
        let mut guard = self.engine.lock().await;

        guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::InternalError(e.to_string()))
    }
}

/// What the rerank pass did, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RerankReport {
    pub mode: RerankMode,
    pub applied: bool,
    pub scored: usize,
    pub dropped: usize,
    /// True when the cross-encoder order was rescored with fresh cosine similarities.
    pub cosine_rescored: bool,
}

/// Collaborators available to the rerank pass.
pub struct Reranker<'a> {
    pub scorer: Option<&'a dyn PairScorer>,
    pub llm: Option<&'a dyn LanguageModel>,
    pub embedder: &'a dyn Embedder,
    pub llm_timeout: Duration,
}

impl Reranker<'_> {
    /// Rescores and filters `results`. Leaves the fused order untouched when the
    /// selected mode has no model or the model call fails as a whole.
    pub async fn rerank(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        results: Vec<RetrievalResult>,
        settings: &RerankSettings,
    ) -> (Vec<RetrievalResult>, RerankReport) {
        let mut report = RerankReport {
            mode: settings.mode,
            applied: false,
            scored: 0,
            dropped: 0,
            cosine_rescored: false,
        };
        if results.is_empty() {
            return (results, report);
        }

        let scores = match settings.mode {
            RerankMode::CrossEncoder => self.cross_encoder_scores(query, &results).await,
            RerankMode::Llm => match self.llm {
                Some(model) => Some(
                    llm::llm_scores(model, query, &results, settings.concurrency, self.llm_timeout)
                        .await,
                ),
                None => {
                    warn!("LLM reranking requested without a language model, keeping fused order");
                    None
                }
            },
        };
        let Some(scores) = scores else {
            return (results, report);
        };

        let before = results.len();
        let mut reranked: Vec<RetrievalResult> = results
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| *score >= settings.threshold)
            .map(|(mut result, score)| {
                result.final_score = score;
                result
            })
            .collect();
        report.applied = true;
        report.scored = before;
        report.dropped = before - reranked.len();
        sort_results(&mut reranked);

        if settings.mode == RerankMode::CrossEncoder {
            if let Some(embedding) = query_embedding {
                report.cosine_rescored = self.rescore_with_cosine(embedding, &mut reranked).await;
                sort_results(&mut reranked);
            }
        }

        if let Some(keep) = settings.keep_top {
            reranked.truncate(keep);
        }
        debug!(
            mode = ?settings.mode,
            kept = reranked.len(),
            dropped = report.dropped,
            "Rerank pass finished"
        );
        (reranked, report)
    }

    /// Squashed cross-encoder scores aligned with `results`; missing content scores 0.
    async fn cross_encoder_scores(&self, query: &str, results: &[RetrievalResult]) -> Option<Vec<f32>> {
        let Some(scorer) = self.scorer else {
            warn!("Cross-encoder reranking requested without a reranker pool, keeping fused order");
            return None;
        };

        let (positions, documents): (Vec<usize>, Vec<String>) = results
            .iter()
            .enumerate()
            .filter(|(_, result)| !result.content_missing)
            .map(|(position, result)| (position, result.content.clone()))
            .unzip();

        let mut scores = vec![0.0; results.len()];
        if documents.is_empty() {
            return Some(scores);
        }

        match scorer.score_pairs(query, documents).await {
            Ok(raw) => {
                for (position, logit) in positions.into_iter().zip(raw) {
                    scores[position] = if logit.is_finite() { sigmoid(logit) } else { 0.0 };
                }
                Some(scores)
            }
            Err(err) => {
                warn!(error = %err, "Cross-encoder reranking failed, keeping fused order");
                None
            }
        }
    }

    /// Overwrites scores with cosine similarity against freshly embedded content.
    async fn rescore_with_cosine(&self, query_embedding: &[f32], results: &mut [RetrievalResult]) -> bool {
        let (positions, texts): (Vec<usize>, Vec<String>) = results
            .iter()
            .enumerate()
            .filter(|(_, result)| !result.content_missing)
            .map(|(position, result)| (position, result.content.clone()))
            .unzip();
        if texts.is_empty() {
            return false;
        }

        match self.embedder.embed_batch(texts).await {
            Ok(embeddings) if embeddings.len() == positions.len() => {
                for (position, embedding) in positions.into_iter().zip(embeddings) {
                    results[position].final_score = cosine_similarity(query_embedding, &embedding);
                }
                true
            }
            Ok(embeddings) => {
                warn!(
                    expected = positions.len(),
                    got = embeddings.len(),
                    "Embedding batch size mismatch, keeping cross-encoder scores"
                );
                false
            }
            Err(err) => {
                warn!(error = %err, "Embedding for cosine rescoring failed, keeping cross-encoder scores");
                false
            }
        }
    }
}

fn sort_results(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| compare_scored(a.final_score, &a.chunk_id, b.final_score, &b.chunk_id));
}
