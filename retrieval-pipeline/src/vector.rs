use common::{
    error::AppError,
    storage::store::VectorStore,
    utils::embedding::Embedder,
};
use tracing::{debug, warn};

use crate::scoring::{cosine_similarity, sort_hits_desc, RawHit};

/// Query embedding plus the hits it produced. The embedding is kept for rescoring.
#[derive(Debug, Clone, Default)]
pub struct VectorSearchOutcome {
    pub query_embedding: Option<Vec<f32>>,
    pub hits: Vec<RawHit>,
}

pub struct VectorSearcher<'a> {
    store: &'a dyn VectorStore,
    embedder: &'a dyn Embedder,
}

impl<'a> VectorSearcher<'a> {
    pub fn new(store: &'a dyn VectorStore, embedder: &'a dyn Embedder) -> Self {
        Self { store, embedder }
    }

    /// Embeds the query once and returns the nearest chunks scored by cosine similarity.
    /// Failures yield an empty outcome.
    pub async fn search(&self, kb_id: &str, query: &str, take: usize) -> VectorSearchOutcome {
        match self.embedder.embed(query).await {
            Ok(embedding) => {
                let hits = self
                    .search_with_embedding(kb_id, &embedding, take)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(error = %err, "Vector search failed, continuing without vector evidence");
                        Vec::new()
                    });
                VectorSearchOutcome {
                    query_embedding: Some(embedding),
                    hits,
                }
            }
            Err(err) => {
                warn!(error = %err, "Query embedding failed, continuing without vector evidence");
                VectorSearchOutcome::default()
            }
        }
    }

    pub async fn search_with_embedding(
        &self,
        kb_id: &str,
        embedding: &[f32],
        take: usize,
    ) -> Result<Vec<RawHit>, AppError> {
        if take == 0 {
            return Ok(Vec::new());
        }

        let store_hits = self.store.search(kb_id, embedding, take).await?;
        let mut hits: Vec<RawHit> = store_hits
            .into_iter()
            .map(|hit| {
                let raw_score = if hit.chunk.embedding.is_empty() {
                    debug!(chunk_id = %hit.chunk.id, "Stored vector missing, using store score");
                    hit.store_score
                } else {
                    cosine_similarity(embedding, &hit.chunk.embedding)
                };
                RawHit {
                    chunk: hit.chunk,
                    raw_score,
                }
            })
            .collect();

        sort_hits_desc(&mut hits);
        hits.truncate(take);
        debug!(kb_id, hits = hits.len(), "Vector candidates collected");
        Ok(hits)
    }
}
