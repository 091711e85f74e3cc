use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::RecordId;
use tracing::debug;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            text_chunk::{deserialize_flexible_id, TextChunk},
            StoredObject,
        },
    },
};

/// A chunk returned by a similarity search, with whatever score the store reported.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: TextChunk,
    pub store_score: f32,
}

/// Similarity search and id lookup over the chunk collection of a knowledge base.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Nearest chunks to `embedding`. Hits must carry the stored chunk vector.
    async fn search(
        &self,
        kb_id: &str,
        embedding: &[f32],
        take: usize,
    ) -> Result<Vec<VectorHit>, AppError>;

    /// Batch lookup by chunk id. Unknown ids are simply absent from the output.
    async fn fetch_by_ids(&self, kb_id: &str, ids: &[String]) -> Result<Vec<TextChunk>, AppError>;
}

/// Full enumeration of the chunks visible in a knowledge base.
#[async_trait]
pub trait LexicalCorpus: Send + Sync {
    async fn enumerate(&self, kb_id: &str) -> Result<Vec<TextChunk>, AppError>;
}

#[derive(Debug, Deserialize)]
struct SimilarityRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    store_score: Option<f32>,
}

/// `text_chunk` table in SurrealDB serving both read paths.
#[derive(Clone)]
pub struct SurrealChunkStore {
    db: Arc<SurrealDbClient>,
}

impl SurrealChunkStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    async fn select_by_ids(&self, kb_id: &str, ids: &[String]) -> Result<Vec<TextChunk>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let record_ids: Vec<RecordId> = ids
            .iter()
            .map(|id| RecordId::from_table_key(TextChunk::table_name(), id.as_str()))
            .collect();

        let mut response = self
            .db
            .query("SELECT * FROM type::table($table) WHERE id IN $things AND kb_id = $kb_id")
            .bind(("table", TextChunk::table_name().to_owned()))
            .bind(("things", record_ids))
            .bind(("kb_id", kb_id.to_owned()))
            .await?;

        let chunks: Vec<TextChunk> = response.take(0)?;
        Ok(chunks)
    }
}

#[async_trait]
impl VectorStore for SurrealChunkStore {
    async fn search(
        &self,
        kb_id: &str,
        embedding: &[f32],
        take: usize,
    ) -> Result<Vec<VectorHit>, AppError> {
        let sql = format!(
            "SELECT id, vector::similarity::cosine(embedding, $embedding) AS store_score \
             FROM {table} \
             WHERE kb_id = $kb_id AND array::len(embedding) = $dimension \
             ORDER BY store_score DESC \
             LIMIT $limit",
            table = TextChunk::table_name()
        );

        let mut response = self
            .db
            .query(sql)
            .bind(("embedding", embedding.to_vec()))
            .bind(("kb_id", kb_id.to_owned()))
            .bind(("dimension", embedding.len() as i64))
            .bind(("limit", take as i64))
            .await?;

        let rows: Vec<SimilarityRow> = response.take(0)?;
        debug!(kb_id, rows = rows.len(), "Vector similarity scan finished");
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
        let mut chunk_map: HashMap<String, TextChunk> = self
            .select_by_ids(kb_id, &ids)
            .await?
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(chunk) = chunk_map.remove(&row.id) {
                hits.push(VectorHit {
                    chunk,
                    store_score: row.store_score.unwrap_or_default(),
                });
            }
        }

        Ok(hits)
    }

    async fn fetch_by_ids(&self, kb_id: &str, ids: &[String]) -> Result<Vec<TextChunk>, AppError> {
        self.select_by_ids(kb_id, ids).await
    }
}

#[async_trait]
impl LexicalCorpus for SurrealChunkStore {
    async fn enumerate(&self, kb_id: &str) -> Result<Vec<TextChunk>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM type::table($table) WHERE kb_id = $kb_id")
            .bind(("table", TextChunk::table_name().to_owned()))
            .bind(("kb_id", kb_id.to_owned()))
            .await?;

        let chunks: Vec<TextChunk> = response.take(0)?;
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_store() -> SurrealChunkStore {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("store_test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.build_indexes().await.expect("Failed to build indexes");

        let chunks = vec![
            TextChunk::with_id("c1", "kb", "d1", "Curie studied radioactivity.", vec![1.0, 0.0, 0.0]),
            TextChunk::with_id("c2", "kb", "d1", "Langevin was a student of Curie.", vec![0.6, 0.8, 0.0]),
            TextChunk::with_id("c3", "kb", "d2", "Unrelated cooking notes.", vec![0.0, 0.0, 1.0]),
            TextChunk::with_id("other", "kb-other", "d9", "Other knowledge base.", vec![1.0, 0.0, 0.0]),
        ];
        for chunk in chunks {
            db.store_item(chunk).await.expect("Failed to store chunk");
        }

        SurrealChunkStore::new(Arc::new(db))
    }

    #[tokio::test]
    async fn test_enumerate_is_scoped_to_knowledge_base() {
        let store = setup_store().await;
        let mut ids: Vec<String> = store
            .enumerate("kb")
            .await
            .expect("enumerate failed")
            .into_iter()
            .map(|chunk| chunk.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_fetch_by_ids_skips_unknown_ids() {
        let store = setup_store().await;
        let chunks = store
            .fetch_by_ids("kb", &["c2".to_string(), "missing".to_string()])
            .await
            .expect("fetch failed");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "c2");
        assert!(chunks[0].content.contains("Langevin"));
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let store = setup_store().await;
        let hits = store
            .search("kb", &[1.0, 0.0, 0.0], 2)
            .await
            .expect("search failed");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "c1");
        assert_eq!(hits[1].chunk.id, "c2");
        assert!(hits[0].store_score >= hits[1].store_score);
        assert_eq!(hits[0].chunk.embedding, vec![1.0, 0.0, 0.0]);
    }
}
